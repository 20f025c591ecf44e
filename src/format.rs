// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flash geometry, flashcart slot header definitions and magic constants.

use zerocopy::{AsBytes, FromBytes, Unaligned, U16};
use byteorder::BigEndian;

/// Size of the microcontroller's onboard program flash.
pub const FLASH_SIZE: usize = 32768;
/// Onboard flash page size, which is also the bootloader's write unit.
pub const FLASH_PAGE_SIZE: usize = 128;
pub const FLASH_PAGE_COUNT: usize = FLASH_SIZE / FLASH_PAGE_SIZE;
/// First page of the 4K Caterina bootloader region. Sketches that use this
/// page or anything above it will clobber the bootloader.
pub const BOOTLOADER_START_PAGE: usize = 224;

/// Size of the EEPROM, which is always transferred in one piece.
pub const EEPROM_SIZE: usize = 1024;

/// FX chip page size; FX addresses on the wire are in these units.
pub const FX_PAGE_SIZE: usize = 256;
/// FX chip erase granularity.
pub const FX_BLOCK_SIZE: usize = 65536;
pub const FX_PAGES_PER_BLOCK: usize = FX_BLOCK_SIZE / FX_PAGE_SIZE;
/// Largest FX chip addressable with 16-bit page numbers (16 MiB).
pub const FX_MAX_PAGES: usize = 65536;

/// Save data is erased and rewritten by sketches in 4K sectors, so it is
/// always aligned to this.
pub const SAVE_ALIGNMENT: usize = 4096;

pub const SCREEN_WIDTH: usize = 128;
pub const SCREEN_HEIGHT: usize = 64;
/// Raw 1-bit title image: 128x64 pixels, 8 vertical pixels per byte.
pub const TITLE_IMAGE_LENGTH: usize = SCREEN_WIDTH * SCREEN_HEIGHT / 8;

pub const HEADER_LENGTH: usize = 256;
/// Header plus title image, in FX pages.
pub const PREAMBLE_PAGES: usize = (HEADER_LENGTH + TITLE_IMAGE_LENGTH) / FX_PAGE_SIZE;
/// Unit of the header's program length field.
pub const PROGRAM_UNIT: usize = 128;
pub const META_LENGTH: usize = 199;

/// Page value meaning "not present" in header page fields.
pub const NO_PAGE: u16 = 0xFFFF;

/// On-flash header at the start of every flashcart slot.
///
/// Fields the header does not use are left as `0xFF`, the erased state.
#[derive(Clone, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct SlotHeader {
    pub magic: [u8; 7],
    pub category: u8,
    pub previous_page: U16<BigEndian>,
    pub next_page: U16<BigEndian>,
    /// Total slot size in FX pages, including this header.
    pub slot_pages: U16<BigEndian>,
    /// Program length in 128-byte units.
    pub program_units: u8,
    pub program_page: U16<BigEndian>,
    pub data_page: U16<BigEndian>,
    pub save_page: U16<BigEndian>,
    /// FX data length in pages. Carts built by older tools leave this unset.
    pub data_pages: U16<BigEndian>,
    pub reserved: [u8; 2],
    /// SHA-256 of program + data, only set for program slots.
    pub hash: [u8; 32],
    /// NUL-separated metadata strings.
    pub meta: [u8; META_LENGTH],
}

impl SlotHeader {
    pub const MAGIC: [u8; 7] = *b"ARDUBOY";

    /// Produces a `SlotHeader` that has been initialized with the magic and
    /// every other byte erased.
    ///
    /// Callers fill in the fields relevant to the slot they describe; the
    /// erased value of each page field already means "absent".
    pub fn prototype() -> Self {
        Self {
            magic: Self::MAGIC,
            category: 0xFF,
            previous_page: U16::new(NO_PAGE),
            next_page: U16::new(NO_PAGE),
            slot_pages: U16::new(NO_PAGE),
            program_units: 0xFF,
            program_page: U16::new(NO_PAGE),
            data_page: U16::new(NO_PAGE),
            save_page: U16::new(NO_PAGE),
            data_pages: U16::new(NO_PAGE),
            reserved: [0xFF; 2],
            hash: [0xFF; 32],
            meta: [0xFF; META_LENGTH],
        }
    }

    /// Reads a header from the start of `bytes`, provided there are enough
    /// of them and the magic matches.
    pub fn read(bytes: &[u8]) -> Option<Self> {
        let header = Self::read_from(bytes.get(..HEADER_LENGTH)?)?;
        if header.magic == Self::MAGIC {
            Some(header)
        } else {
            None
        }
    }

    pub fn slot_len(&self) -> usize {
        usize::from(self.slot_pages.get()) * FX_PAGE_SIZE
    }

    pub fn program_len(&self) -> usize {
        usize::from(self.program_units) * PROGRAM_UNIT
    }
}

/// Returns `len` rounded up to a multiple of `align`.
pub fn align_up(len: usize, align: usize) -> usize {
    match len % align {
        0 => len,
        rem => len + (align - rem),
    }
}

/// Pads `data` with `0xFF` up to a multiple of `align`.
pub fn pad_to(data: &mut Vec<u8>, align: usize) {
    let len = align_up(data.len(), align);
    data.resize(len, 0xFF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(std::mem::size_of::<SlotHeader>(), HEADER_LENGTH);

        let mut h = SlotHeader::prototype();
        h.category = 3;
        h.slot_pages = U16::new(0x0102);
        h.program_units = 0x40;
        h.data_pages = U16::new(0x0A0B);
        let bytes = h.as_bytes();
        assert_eq!(&bytes[..7], b"ARDUBOY");
        assert_eq!(bytes[7], 3);
        assert_eq!(&bytes[12..14], &[0x01, 0x02]);
        assert_eq!(bytes[14], 0x40);
        assert_eq!(&bytes[21..23], &[0x0A, 0x0B]);
        assert!(bytes[57..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn read_rejects_bad_magic() {
        let mut bytes = SlotHeader::prototype().as_bytes().to_vec();
        assert!(SlotHeader::read(&bytes).is_some());
        bytes[0] = b'a';
        assert!(SlotHeader::read(&bytes).is_none());
        assert!(SlotHeader::read(&bytes[..100]).is_none());
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(245, 256), 256);
        assert_eq!(align_up(400, 256), 512);
        let mut v = vec![0u8; 3];
        pad_to(&mut v, 4);
        assert_eq!(v, vec![0, 0, 0, 0xFF]);
    }
}
