// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flashcart images: a chain of slots, each a category divider or a program.
//!
//! A slot is laid out as
//!
//! ```text
//! header (256) | title image (1024) | program | FX data | [pad | save]
//! ```
//!
//! with the program and data each padded to a 256-byte FX page. The header
//! stores page links to its neighbors, so the chain can be walked without
//! understanding the contents.
//!
//! Save data is normally kept out of the chain. It lives in a region at the
//! top of the FX chip, one 4K-aligned area per program, and the slot header
//! and the program's FX vector point there. Only the single-slot debug output
//! from [`compile_single`] carries its save inline.

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use zerocopy::{AsBytes, U16};

use crate::error::{Error, Result};
use crate::format::{
    align_up, pad_to, SlotHeader, FX_MAX_PAGES, FX_PAGE_SIZE, HEADER_LENGTH,
    META_LENGTH, NO_PAGE, PREAMBLE_PAGES, PROGRAM_UNIT, SAVE_ALIGNMENT,
    TITLE_IMAGE_LENGTH,
};
use crate::patch;
use crate::title;

/// Strings stored in the tail of a slot header. Categories only keep `title`
/// and `info`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotMeta {
    pub title: String,
    pub version: String,
    pub developer: String,
    pub info: String,
}

/// One flashcart entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Index of the category this slot belongs to. Recomputed on compile.
    pub category: u8,
    /// Raw 1024-byte title screen.
    pub image: Vec<u8>,
    /// Program image; empty for a category divider.
    pub program: Vec<u8>,
    pub data: Vec<u8>,
    pub save: Vec<u8>,
    pub meta: SlotMeta,
}

impl Slot {
    /// A category divider.
    pub fn new_category(title: &str, info: &str, image: Vec<u8>) -> Self {
        Self {
            category: 0,
            image,
            program: Vec::new(),
            data: Vec::new(),
            save: Vec::new(),
            meta: SlotMeta {
                title: title.to_string(),
                info: info.to_string(),
                ..SlotMeta::default()
            },
        }
    }

    /// A program slot with no FX data or save.
    pub fn new_program(meta: SlotMeta, image: Vec<u8>, program: Vec<u8>) -> Self {
        Self {
            category: 0,
            image,
            program,
            data: Vec::new(),
            save: Vec::new(),
            meta,
        }
    }

    pub fn is_category(&self) -> bool {
        self.program.is_empty()
    }

    pub fn has_image(&self) -> bool {
        self.image.iter().any(|&b| b != 0)
    }

    pub fn fx_enabled(&self) -> bool {
        !self.data.is_empty() || !self.save.is_empty()
    }
}

/// Knobs for [`Cart::compile`].
#[derive(Clone, Debug)]
pub struct CompileOptions {
    /// Install the return-to-menu timer ISR into each program that allows it.
    pub menu_patch: bool,
    /// Size of the FX chip the cart is meant for; save areas are stacked
    /// down from here.
    pub capacity: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            menu_patch: false,
            capacity: FX_MAX_PAGES * FX_PAGE_SIZE,
        }
    }
}

/// A save area at the top of the chip, belonging to one program slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveArea {
    /// Index of the owning slot in the cart.
    pub slot: usize,
    /// First FX page of the area.
    pub page: u16,
    /// Save contents padded to `SAVE_ALIGNMENT`.
    pub data: Vec<u8>,
}

impl SaveArea {
    pub fn address(&self) -> usize {
        usize::from(self.page) * FX_PAGE_SIZE
    }
}

/// Output of [`Cart::compile`].
#[derive(Clone, Debug)]
pub struct CompiledCart {
    /// The slot chain, starting at FX page 0.
    pub stream: Vec<u8>,
    /// Save areas to be written separately, highest address first.
    pub saves: Vec<SaveArea>,
    pub games: usize,
    pub categories: usize,
}

impl CompiledCart {
    /// The save areas as one contiguous run, with the address it starts at.
    /// Areas are stacked without gaps, so this ends where the topmost one
    /// does.
    pub fn save_region_bytes(&self) -> Option<(usize, Vec<u8>)> {
        let lowest = self.saves.last()?;
        let mut bytes = Vec::new();
        for area in self.saves.iter().rev() {
            bytes.extend_from_slice(&area.data);
        }
        Some((lowest.address(), bytes))
    }

    /// Lays the stream and save areas out as a complete chip image of
    /// `capacity` bytes, erased everywhere else.
    pub fn to_image(&self, capacity: usize) -> Result<Vec<u8>> {
        if self.stream.len() > capacity {
            return Err(Error::format(format!(
                "cart is {} bytes, chip only holds {}",
                self.stream.len(),
                capacity,
            )));
        }
        let mut image = vec![0xFF; capacity];
        image[..self.stream.len()].copy_from_slice(&self.stream);
        for save in &self.saves {
            let end = save.address() + save.data.len();
            let dest = image.get_mut(save.address()..end)
                .ok_or_else(|| Error::format(format!(
                    "save area at page {:#06x} is outside a {} byte chip",
                    save.page,
                    capacity,
                )))?;
            dest.copy_from_slice(&save.data);
        }
        Ok(image)
    }
}

/// Ordered flashcart contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cart {
    pub slots: Vec<Slot>,
}

/// Where a compiled slot's save data goes.
#[derive(Clone, Copy, Debug)]
enum SavePlacement {
    /// Program has no save, or it is being dropped.
    None,
    /// Appended to the slot itself, 4K aligned.
    Inline,
    /// In the save region at this page.
    At(u16),
}

impl Cart {
    pub fn new(slots: Vec<Slot>) -> Self {
        Self { slots }
    }

    /// Parses a flashcart image, stopping at the first page without a slot
    /// header. `bytes` is assumed to start at FX page 0; if it extends into
    /// the save region (a full chip backup, say), save areas are recovered
    /// too.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        debug!("parsing flashcart ({} bytes)", bytes.len());
        let mut slots = Vec::new();
        // (slot index, absolute save page) for saves outside their slot
        let mut remote_saves = Vec::new();

        let mut offset = 0;
        while offset + 1 < bytes.len() {
            let Some(header) = SlotHeader::read(&bytes[offset..]) else {
                break;
            };
            let slot_len = header.slot_len();
            if slot_len == 0 {
                return Err(Error::CorruptCart { offset });
            }
            let slot_end = offset + slot_len;
            let Some(slot_bytes) = bytes.get(offset..slot_end) else {
                warn!(
                    "slot at {:#x} claims {} bytes but the image ends at {:#x}, \
                     treating it as the end of the cart",
                    offset, slot_len, bytes.len(),
                );
                break;
            };

            let (slot, save_page) = parse_slot(&header, slot_bytes);
            if let Some(page) = save_page {
                remote_saves.push((slots.len(), page));
            }
            slots.push(slot);
            offset = slot_end;
        }

        // Each remote save runs up to the next one above it, the last one to
        // the end of what we were given.
        remote_saves.sort_by_key(|&(_, page)| page);
        for (i, &(slot, page)) in remote_saves.iter().enumerate() {
            let start = usize::from(page) * FX_PAGE_SIZE;
            let end = remote_saves[i + 1..]
                .iter()
                .map(|&(_, p)| usize::from(p) * FX_PAGE_SIZE)
                .find(|&p| p > start)
                .unwrap_or(bytes.len())
                .min(bytes.len());
            if start < end {
                slots[slot].save = bytes[start..end].to_vec();
            }
        }

        info!("parsed {} flashcart slots", slots.len());
        Ok(Self { slots })
    }

    /// Assigns category indices: each slot gets the index of the nearest
    /// divider at or before it. Also gives image-less slots a blank screen.
    pub fn renumber(&mut self) -> Result<()> {
        let numbers = self.category_numbers()?;
        for (slot, n) in self.slots.iter_mut().zip(numbers) {
            slot.category = n;
            if slot.image.is_empty() {
                slot.image = title::blank();
            }
        }
        Ok(())
    }

    fn category_numbers(&self) -> Result<Vec<u8>> {
        let mut current: Option<u8> = None;
        self.slots
            .iter()
            .map(|slot| {
                if slot.is_category() {
                    current = Some(match current {
                        None => 0,
                        Some(n) => n.checked_add(1).ok_or_else(|| {
                            Error::format("more than 256 categories")
                        })?,
                    });
                }
                current.ok_or_else(|| {
                    Error::format(format!(
                        "program '{}' comes before any category",
                        slot.meta.title,
                    ))
                })
            })
            .collect()
    }

    /// Index of the category divider `index` falls under.
    pub fn category_of(&self, index: usize) -> Option<usize> {
        self.slots.get(..=index)?.iter().rposition(Slot::is_category)
    }

    /// Checks the layout the stock bootloader menu expects: at least two
    /// slots, and the first two are categories (the first is the
    /// bootloader's own hidden list).
    pub fn check_menu_layout(&self) -> Result<()> {
        if self.slots.len() < 2 {
            return Err(Error::format(
                "cart needs at least two categories for the bootloader menu",
            ));
        }
        if !self.slots[0].is_category() || !self.slots[1].is_category() {
            return Err(Error::format(
                "the first two slots of a cart must be categories",
            ));
        }
        Ok(())
    }

    /// Lays out where each program's save goes, stacking 4K-aligned areas
    /// down from the top of a chip of `capacity` bytes in slot order.
    pub fn save_region(&self, capacity: usize) -> Result<Vec<SaveArea>> {
        if capacity % SAVE_ALIGNMENT != 0 || capacity > FX_MAX_PAGES * FX_PAGE_SIZE {
            return Err(Error::format(format!(
                "{} is not a usable FX chip capacity",
                capacity,
            )));
        }
        let mut top = capacity;
        let mut areas = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_category() || slot.save.is_empty() {
                continue;
            }
            let mut data = slot.save.clone();
            pad_to(&mut data, SAVE_ALIGNMENT);
            top = top.checked_sub(data.len()).ok_or_else(|| {
                Error::format("save data does not fit on the chip")
            })?;
            areas.push(SaveArea {
                slot: i,
                page: (top / FX_PAGE_SIZE) as u16,
                data,
            });
        }
        Ok(areas)
    }

    /// Builds the slot chain and the save areas.
    pub fn compile(&self, opts: &CompileOptions) -> Result<CompiledCart> {
        debug!("compiling flashcart with {} slots", self.slots.len());
        let numbers = self.category_numbers()?;
        let saves = self.save_region(opts.capacity)?;

        let mut stream = Vec::new();
        let mut previous = NO_PAGE;
        let mut games = 0;
        let mut categories = 0;
        for (i, (slot, &category)) in self.slots.iter().zip(&numbers).enumerate() {
            let current = page_of(stream.len())?;
            let placement = match saves.iter().find(|s| s.slot == i) {
                Some(area) => SavePlacement::At(area.page),
                None => SavePlacement::None,
            };
            let bin = build_slot(slot, category, current, previous, placement, opts.menu_patch)?;
            stream.extend_from_slice(&bin);
            if slot.is_category() {
                categories += 1;
            } else {
                games += 1;
            }
            previous = current;
        }

        if let Some(lowest) = saves.last() {
            if lowest.address() < stream.len() {
                return Err(Error::format(format!(
                    "cart ({} bytes) runs into the save region at {:#x}",
                    stream.len(),
                    lowest.address(),
                )));
            }
        }

        // An erased page after the last slot ends the chain.
        if stream.len() / FX_PAGE_SIZE < FX_MAX_PAGES {
            stream.extend_from_slice(&[0xFF; FX_PAGE_SIZE]);
        }

        info!(
            "compiled flashcart: {} bytes, {} games, {} categories, {} saves",
            stream.len(), games, categories, saves.len(),
        );
        Ok(CompiledCart { stream, saves, games, categories })
    }

    /// Compiles with default options and returns just the slot chain.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.compile(&CompileOptions::default())?.stream)
    }
}

/// Compiles one slot on its own at page 0, with its save appended inline.
/// Meant for inspecting a slot's layout; the result is a valid one-slot
/// chain but has no terminator.
pub fn compile_single(slot: &Slot) -> Result<Vec<u8>> {
    let placement = if slot.is_category() || slot.save.is_empty() {
        SavePlacement::None
    } else {
        SavePlacement::Inline
    };
    build_slot(slot, slot.category, 0, NO_PAGE, placement, false)
}

/// Returns the prefix of `bytes` occupied by the slot chain, for shrinking a
/// raw chip backup down to the cart it holds.
pub fn trim(bytes: &[u8]) -> Result<&[u8]> {
    let mut offset = 0;
    while offset + 1 < bytes.len() {
        let Some(header) = SlotHeader::read(&bytes[offset..]) else {
            break;
        };
        if header.slot_len() == 0 {
            return Err(Error::CorruptCart { offset });
        }
        let slot_end = offset + header.slot_len();
        if slot_end > bytes.len() {
            warn!(
                "slot at {:#x} runs past the end of the image, dropping it",
                offset,
            );
            break;
        }
        offset = slot_end;
    }
    debug!("trim flashcart from {} to {} bytes", bytes.len(), offset);
    Ok(&bytes[..offset])
}

fn page_of(offset: usize) -> Result<u16> {
    u16::try_from(offset / FX_PAGE_SIZE)
        .map_err(|_| Error::format("cart exceeds 16 MiB of FX pages"))
}

fn build_slot(
    slot: &Slot,
    category: u8,
    current: u16,
    previous: u16,
    save: SavePlacement,
    menu_patch: bool,
) -> Result<Vec<u8>> {
    let blank;
    let image = if slot.image.is_empty() {
        blank = title::blank();
        &blank
    } else {
        &slot.image
    };
    if image.len() != TITLE_IMAGE_LENGTH {
        return Err(Error::format(format!(
            "title image for '{}' is {} bytes, expected {}",
            slot.meta.title,
            image.len(),
            TITLE_IMAGE_LENGTH,
        )));
    }

    let is_program = !slot.is_category();
    let mut program = slot.program.clone();
    pad_to(&mut program, FX_PAGE_SIZE);
    let mut data = if is_program { slot.data.clone() } else { Vec::new() };
    pad_to(&mut data, FX_PAGE_SIZE);
    let mut save_inline = match save {
        SavePlacement::Inline => slot.save.clone(),
        _ => Vec::new(),
    };
    pad_to(&mut save_inline, SAVE_ALIGNMENT);

    // The last 128 bytes of the padded program needn't be flashed if erased.
    let mut units = program.len() / PROGRAM_UNIT;
    if units > 0 && program[program.len() - PROGRAM_UNIT..].iter().all(|&b| b == 0xFF) {
        units -= 1;
    }
    let units = u8::try_from(units).map_err(|_| Error::format(format!(
        "program '{}' is {} bytes, larger than the {} a slot can describe",
        slot.meta.title,
        slot.program.len(),
        255 * PROGRAM_UNIT,
    )))?;

    let hash = Sha256::new().chain_update(&program).chain_update(&data).finalize();

    let program_page = usize::from(current) + PREAMBLE_PAGES;
    let data_page = program_page + program.len() / FX_PAGE_SIZE;
    let align_page = data_page + data.len() / FX_PAGE_SIZE;
    let align_len = if save_inline.is_empty() {
        0
    } else {
        align_up(align_page, SAVE_ALIGNMENT / FX_PAGE_SIZE) * FX_PAGE_SIZE
            - align_page * FX_PAGE_SIZE
    };
    let inline_save_page = align_page + align_len / FX_PAGE_SIZE;

    let body_len = program.len() + data.len() + align_len + save_inline.len();
    if body_len % FX_PAGE_SIZE != 0 {
        return Err(Error::format(format!(
            "slot '{}' body is {} bytes, not page aligned",
            slot.meta.title, body_len,
        )));
    }
    let slot_pages = PREAMBLE_PAGES + body_len / FX_PAGE_SIZE;
    let next_page = page_of((usize::from(current) + slot_pages) * FX_PAGE_SIZE)?;

    let mut header = SlotHeader::prototype();
    header.category = category;
    header.previous_page = U16::new(previous);
    header.next_page = U16::new(next_page);
    header.slot_pages = U16::new(slot_pages as u16);
    header.program_units = units;

    if is_program {
        header.program_page = U16::new(program_page as u16);
        if !data.is_empty() {
            let page = data_page as u16;
            program[0x14] = 0x18;
            program[0x15] = 0x95;
            program[0x16..0x18].copy_from_slice(&page.to_be_bytes());
            header.data_page = U16::new(page);
            header.data_pages = U16::new((data.len() / FX_PAGE_SIZE) as u16);
        }
        let save_page = match save {
            SavePlacement::None => None,
            SavePlacement::Inline => Some(inline_save_page as u16),
            SavePlacement::At(page) => Some(page),
        };
        if let Some(page) = save_page {
            program[0x18] = 0x18;
            program[0x19] = 0x95;
            program[0x1A..0x1C].copy_from_slice(&page.to_be_bytes());
            header.save_page = U16::new(page);
        }
        header.hash.copy_from_slice(&hash);

        if menu_patch {
            match patch::patch_menu_buttons(&program) {
                Ok(patched) => program = patched.data,
                Err(e) => warn!(
                    "couldn't install the menu patch for '{}': {}",
                    slot.meta.title, e,
                ),
            }
        }
    }
    header.meta = pack_meta(&slot.meta, is_program);

    let mut out = Vec::with_capacity(HEADER_LENGTH + TITLE_IMAGE_LENGTH + body_len);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(image);
    out.extend_from_slice(&program);
    out.extend_from_slice(&data);
    out.resize(out.len() + align_len, 0xFF);
    out.extend_from_slice(&save_inline);
    Ok(out)
}

/// Pulls one slot out of its bytes. Returns the absolute save page as well
/// when the save lives outside the slot.
fn parse_slot(header: &SlotHeader, bytes: &[u8]) -> (Slot, Option<u16>) {
    let preamble = HEADER_LENGTH + TITLE_IMAGE_LENGTH;
    let image = bytes.get(HEADER_LENGTH..preamble).unwrap_or_default().to_vec();
    let program_end = (preamble + header.program_len()).min(bytes.len());
    let program = bytes.get(preamble..program_end).unwrap_or_default().to_vec();

    let program_page = header.program_page.get();
    // Header pages are absolute; convert them relative to this slot.
    let local = |page: u16| -> Option<usize> {
        if page == NO_PAGE || program_page == NO_PAGE || page < program_page {
            return None;
        }
        let at = preamble + usize::from(page - program_page) * FX_PAGE_SIZE;
        (at <= bytes.len()).then_some(at)
    };

    let save_page = header.save_page.get();
    let local_save = local(save_page).filter(|&at| at < bytes.len());

    let data = match local(header.data_page.get()) {
        None => Vec::new(),
        Some(start) => {
            let data_pages = header.data_pages.get();
            if data_pages != NO_PAGE {
                let end = (start + usize::from(data_pages) * FX_PAGE_SIZE).min(bytes.len());
                bytes[start..end].to_vec()
            } else if save_page == NO_PAGE {
                bytes[start..].to_vec()
            } else {
                let end = local_save.unwrap_or(bytes.len()).max(start);
                let mut data = bytes[start..end].to_vec();
                // The data length wasn't recorded, and a save is 4K aligned,
                // so drop the erased pages in between.
                while data.len() >= FX_PAGE_SIZE
                    && data[data.len() - FX_PAGE_SIZE..].iter().all(|&b| b == 0xFF)
                {
                    data.truncate(data.len() - FX_PAGE_SIZE);
                }
                data
            }
        }
    };

    let (save, remote) = match local_save {
        Some(at) => (bytes[at..].to_vec(), None),
        None if save_page != NO_PAGE && !program.is_empty() => (Vec::new(), Some(save_page)),
        None => (Vec::new(), None),
    };

    let slot = Slot {
        category: header.category,
        image,
        meta: unpack_meta(&header.meta, program_page == NO_PAGE),
        program,
        data,
        save,
    };
    (slot, remote)
}

fn pack_meta(meta: &SlotMeta, is_program: bool) -> [u8; META_LENGTH] {
    let fields: &[&str] = if is_program {
        &[&meta.title, &meta.version, &meta.developer, &meta.info]
    } else {
        &[&meta.title, &meta.info]
    };
    let mut block = Vec::new();
    for field in fields {
        block.extend_from_slice(field.as_bytes());
        block.push(0);
    }
    if block.len() > META_LENGTH {
        warn!(
            "metadata for '{}' is {} bytes, truncating to {}",
            meta.title, block.len(), META_LENGTH,
        );
        let mut cut = META_LENGTH;
        while std::str::from_utf8(&block[..cut]).is_err() {
            cut -= 1;
        }
        block.truncate(cut);
    }
    let mut out = [0xFF; META_LENGTH];
    out[..block.len()].copy_from_slice(&block);
    out
}

fn unpack_meta(block: &[u8], is_category: bool) -> SlotMeta {
    let values: Vec<String> = block
        .split(|&b| b == 0)
        .map(|v| String::from_utf8_lossy(v).replace('\u{FFFD}', ""))
        .collect();
    let field = |i: usize| values.get(i).cloned().unwrap_or_default();
    if is_category {
        SlotMeta {
            title: field(0),
            info: field(1),
            ..SlotMeta::default()
        }
    } else {
        SlotMeta {
            title: field(0),
            version: field(1),
            developer: field(2),
            info: field(3),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(fill: u8) -> Vec<u8> {
        vec![fill; TITLE_IMAGE_LENGTH]
    }

    fn program(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed) & 0x7F).collect()
    }

    fn game(title: &str, img: Vec<u8>, prog: Vec<u8>) -> Slot {
        Slot::new_program(
            SlotMeta {
                title: title.into(),
                version: "1.0".into(),
                developer: "dev".into(),
                info: format!("{} info", title),
            },
            img,
            prog,
        )
    }

    fn demo_cart() -> Cart {
        Cart::new(vec![
            Slot::new_category("Demos", "Some demos", image(0x11)),
            game("Pong", image(0x22), program(1000, 1)),
            game("Tetris", image(0x33), program(3000, 2)),
        ])
    }

    #[test]
    fn compile_then_parse() {
        let cart = demo_cart();
        let compiled = cart.compile(&CompileOptions::default()).unwrap();
        assert_eq!(compiled.games, 2);
        assert_eq!(compiled.categories, 1);

        let parsed = Cart::parse(&compiled.stream).unwrap();
        assert_eq!(parsed.slots.len(), 3);
        let flags: Vec<bool> = parsed.slots.iter().map(Slot::is_category).collect();
        assert_eq!(flags, vec![true, false, false]);
        assert_eq!(parsed.slots[1].image, image(0x22));
        assert_eq!(parsed.slots[0].meta.title, "Demos");
        assert_eq!(parsed.slots[0].meta.info, "Some demos");
        assert_eq!(parsed.slots[2].meta, cart.slots[2].meta);
        for (a, b) in cart.slots.iter().zip(&parsed.slots) {
            let mut expected = b.program.clone();
            expected.truncate(a.program.len());
            assert_eq!(expected, a.program);
        }
    }

    #[test]
    fn program_is_trimmed_to_units() {
        // 1000 bytes pad to 1024 = 8 units; the last half page is not erased
        // (byte 999 is data) so all 8 are kept.
        let cart = demo_cart();
        let parsed = Cart::parse(&cart.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.slots[1].program.len(), 1024);

        // 1 byte pads to 256 = 2 units, the second one erased.
        let cart = Cart::new(vec![
            Slot::new_category("c", "", image(0)),
            game("tiny", image(0), vec![0x42]),
        ]);
        let parsed = Cart::parse(&cart.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.slots[1].program.len(), 128);
    }

    #[test]
    fn header_links() {
        let bytes = demo_cart().to_bytes().unwrap();
        let first = SlotHeader::read(&bytes).unwrap();
        assert_eq!(first.previous_page.get(), NO_PAGE);
        assert_eq!(first.program_page.get(), NO_PAGE);
        assert_eq!(usize::from(first.slot_pages.get()), PREAMBLE_PAGES);
        assert_eq!(usize::from(first.next_page.get()), PREAMBLE_PAGES);

        let second = SlotHeader::read(&bytes[first.slot_len()..]).unwrap();
        assert_eq!(second.previous_page.get(), 0);
        assert_eq!(usize::from(second.program_page.get()), PREAMBLE_PAGES * 2);
        assert_eq!(second.program_units, 8);
        assert_ne!(second.hash, [0xFF; 32]);
    }

    #[test]
    fn categories_are_renumbered() {
        let mut cart = demo_cart();
        cart.slots.push(Slot::new_category("More", "", image(0)));
        cart.slots.push(game("Snake", Vec::new(), program(300, 3)));
        for s in &mut cart.slots {
            s.category = 9;
        }
        let parsed = Cart::parse(&cart.to_bytes().unwrap()).unwrap();
        let cats: Vec<u8> = parsed.slots.iter().map(|s| s.category).collect();
        assert_eq!(cats, vec![0, 0, 0, 1, 1]);
        assert_eq!(parsed.slots[4].image, title::blank());
        assert_eq!(parsed.category_of(2), Some(0));
        assert_eq!(parsed.category_of(4), Some(3));
    }

    #[test]
    fn program_before_category_is_rejected() {
        let cart = Cart::new(vec![game("lost", image(0), program(10, 0))]);
        assert!(matches!(cart.to_bytes(), Err(Error::Format { .. })));
    }

    #[test]
    fn menu_layout_check() {
        assert!(demo_cart().check_menu_layout().is_err());
        let mut cart = demo_cart();
        cart.slots.insert(0, Slot::new_category("Bootloader", "", image(0)));
        assert!(cart.check_menu_layout().is_ok());
    }

    #[test]
    fn data_and_save_round_trip_through_region() {
        let mut cart = demo_cart();
        cart.slots[1].data = vec![0xAB; 700];
        cart.slots[1].save = vec![0x01; 10];
        cart.slots[2].save = vec![0x02; 5000];
        let capacity = 1 << 20;
        let opts = CompileOptions { capacity, ..CompileOptions::default() };
        let compiled = cart.compile(&opts).unwrap();

        assert_eq!(compiled.saves.len(), 2);
        assert_eq!(compiled.saves[0].address(), capacity - 4096);
        assert_eq!(compiled.saves[1].address(), capacity - 4096 - 8192);

        // The program's FX vectors point at its data and save.
        let header = SlotHeader::read(&compiled.stream[PREAMBLE_PAGES * FX_PAGE_SIZE..]).unwrap();
        let prog_start = PREAMBLE_PAGES * FX_PAGE_SIZE + HEADER_LENGTH + TITLE_IMAGE_LENGTH;
        let prog = &compiled.stream[prog_start..];
        assert_eq!(&prog[0x14..0x16], &[0x18, 0x95]);
        assert_eq!(&prog[0x16..0x18], &header.data_page.get().to_be_bytes());
        assert_eq!(&prog[0x1A..0x1C], &compiled.saves[0].page.to_be_bytes());

        // Without the region, the stream alone has no saves.
        let parsed = Cart::parse(&compiled.stream).unwrap();
        assert_eq!(parsed.slots[1].data.len(), 768);
        assert_eq!(&parsed.slots[1].data[..700], &[0xAB; 700][..]);
        assert!(parsed.slots[1].save.is_empty());

        // With a full chip image, they come back padded to 4K.
        let image = compiled.to_image(capacity).unwrap();
        let parsed = Cart::parse(&image).unwrap();
        assert_eq!(parsed.slots[1].save.len(), 4096);
        assert_eq!(&parsed.slots[1].save[..10], &[0x01; 10]);
        assert_eq!(parsed.slots[2].save.len(), 8192);
        assert_eq!(&parsed.slots[2].save[..5000], &[0x02; 5000][..]);
    }

    #[test]
    fn save_region_overlap_fails() {
        let mut cart = demo_cart();
        cart.slots[1].save = vec![0x01; 10];
        let opts = CompileOptions { capacity: 8192, ..CompileOptions::default() };
        assert!(matches!(cart.compile(&opts), Err(Error::Format { .. })));
    }

    #[test]
    fn single_slot_keeps_save_inline() {
        let mut slot = game("Saver", image(0x44), program(600, 5));
        slot.data = vec![0xCD; 300];
        slot.save = vec![0x5A; 100];
        let bytes = compile_single(&slot).unwrap();
        assert_eq!(bytes.len() % SAVE_ALIGNMENT, 0);

        let header = SlotHeader::read(&bytes).unwrap();
        assert_eq!(header.slot_len(), bytes.len());
        assert_eq!(usize::from(header.save_page.get()) % (SAVE_ALIGNMENT / FX_PAGE_SIZE), 0);

        // A chain needs a category first, so check the slot directly.
        let (parsed, remote) = parse_slot(&header, &bytes);
        assert!(remote.is_none());
        assert_eq!(parsed.data.len(), 512);
        assert_eq!(&parsed.data[..300], &[0xCD; 300][..]);
        assert_eq!(parsed.save.len(), SAVE_ALIGNMENT);
        assert_eq!(&parsed.save[..100], &[0x5A; 100][..]);
    }

    #[test]
    fn legacy_slot_without_data_length() {
        // Older builders leave the data length unset and put the save
        // inline; the data must stop at the last non-erased page.
        let mut slot = game("Old", image(0x44), program(600, 5));
        slot.data = vec![0xCD; 300];
        slot.save = vec![0x5A; 100];
        let mut bytes = compile_single(&slot).unwrap();
        bytes[21] = 0xFF;
        bytes[22] = 0xFF;
        let header = SlotHeader::read(&bytes).unwrap();
        let (parsed, _) = parse_slot(&header, &bytes);
        assert_eq!(parsed.data.len(), 512);
        assert_eq!(parsed.save.len(), SAVE_ALIGNMENT);
    }

    #[test]
    fn zero_sized_slot_is_corrupt() {
        let mut bytes = demo_cart().to_bytes().unwrap();
        bytes[12] = 0;
        bytes[13] = 0;
        assert!(matches!(Cart::parse(&bytes), Err(Error::CorruptCart { offset: 0 })));
        assert!(matches!(trim(&bytes), Err(Error::CorruptCart { offset: 0 })));
    }

    #[test]
    fn garbage_ends_the_cart() {
        let mut bytes = demo_cart().to_bytes().unwrap();
        bytes.extend_from_slice(b"definitely not a slot header");
        assert_eq!(Cart::parse(&bytes).unwrap().slots.len(), 3);
        assert!(Cart::parse(&[]).unwrap().slots.is_empty());
    }

    #[test]
    fn trim_backup() {
        let stream = demo_cart().to_bytes().unwrap();
        let chain_len = stream.len() - FX_PAGE_SIZE;
        let mut backup = stream.clone();
        backup.resize(1 << 20, 0xFF);
        assert_eq!(trim(&backup).unwrap(), &stream[..chain_len]);
    }

    #[test]
    fn trim_drops_torn_last_slot() {
        let stream = demo_cart().to_bytes().unwrap();
        let chain_len = stream.len() - FX_PAGE_SIZE;
        let torn = &stream[..chain_len - 300];
        let trimmed = trim(torn).unwrap();
        let parsed = Cart::parse(torn).unwrap();
        assert_eq!(parsed.slots.len(), demo_cart().slots.len() - 1);
        let two_slots = Cart::new(demo_cart().slots[..2].to_vec()).to_bytes().unwrap();
        assert_eq!(trimmed, &stream[..two_slots.len() - FX_PAGE_SIZE]);
        assert_eq!(Cart::parse(trimmed).unwrap(), parsed);
    }

    #[test]
    fn long_metadata_is_truncated() {
        let mut cart = demo_cart();
        cart.slots[1].meta.info = "é".repeat(200);
        let parsed = Cart::parse(&cart.to_bytes().unwrap()).unwrap();
        let meta = &parsed.slots[1].meta;
        assert_eq!(meta.title, "Pong");
        let used = meta.title.len() + meta.version.len() + meta.developer.len() + 3;
        assert_eq!(meta.info.len(), (META_LENGTH - used) / 2 * 2);
        assert!(meta.info.chars().all(|c| c == 'é'));
    }

    #[test]
    fn oversized_program_is_rejected() {
        let mut cart = demo_cart();
        cart.slots[1].program = vec![0; 256 * PROGRAM_UNIT];
        assert!(matches!(cart.to_bytes(), Err(Error::Format { .. })));
    }

    #[test]
    fn bad_image_size_is_rejected() {
        let mut cart = demo_cart();
        cart.slots[1].image = vec![0; 10];
        assert!(matches!(cart.to_bytes(), Err(Error::Format { .. })));
    }
}
