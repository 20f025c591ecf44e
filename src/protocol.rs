// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Arduboy CDC bootloader protocol.
//!
//! The bootloader speaks a strict request/response protocol: every command is
//! a few bytes, and is answered by a reply of a length fixed by the command.
//! Nothing is framed or buffered on the device side, so a reply must be read
//! in full before the next command is sent.
//!
//! Block reads and writes act on an address register set by a separate
//! command. At this layer every block operation takes its address as a
//! parameter and sets the register itself, so there is no way to issue a
//! block command against a stale address.

use std::io::{Read, Write};
use std::ops::Range;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cart::CompiledCart;
use crate::error::{Error, Result};
use crate::format::{
    pad_to, BOOTLOADER_START_PAGE, EEPROM_SIZE, FLASH_PAGE_COUNT,
    FLASH_PAGE_SIZE, FLASH_SIZE, FX_BLOCK_SIZE, FX_MAX_PAGES, FX_PAGE_SIZE,
};
use crate::hex::DecodedHex;

/// Baud rate of the bootloader's CDC port.
pub const BOOTLOADER_BAUD: u32 = 57600;
/// First bootloader version that can talk to the FX chip.
pub const FX_MIN_VERSION: u8 = 13;

/// Bootloader size at the top of onboard flash.
const BOOTLOADER_SIZE: usize = FLASH_SIZE - BOOTLOADER_START_PAGE * FLASH_PAGE_SIZE;

// RGB LED and button states for the 'x' command.
const LED_WRITE: [u8; 2] = [0xC2, 0xC0];
const LED_VERIFY: u8 = 0xC1;
const LED_IDLE: u8 = 0x40;

/// Known SPI flash manufacturers, by JEDEC id byte.
const MANUFACTURERS: &[(u8, &str)] = &[
    (0x01, "Spansion"),
    (0x14, "Cypress"),
    (0x1C, "EON"),
    (0x1F, "Adesto (Atmel)"),
    (0x20, "Micron"),
    (0x37, "AMIC"),
    (0x9D, "ISSI"),
    (0xBF, "Microchip"),
    (0xC2, "General Plus"),
    (0xC8, "Giga Device"),
    (0xEF, "Winbond"),
];

/// Per-session settings.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub baud: u32,
    /// How long a single reply may take before the port gives up.
    pub timeout: Duration,
    /// How long to wait for a device to come back after a reset.
    pub reconnect_wait: Duration,
    /// Pause between the two JEDEC id queries.
    pub jedec_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud: BOOTLOADER_BAUD,
            timeout: Duration::from_secs(2),
            reconnect_wait: Duration::from_secs(20),
            jedec_settle: Duration::from_millis(100),
        }
    }
}

/// Transfer progress, in blocks or pages depending on the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

/// What an FX chip said about itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JedecInfo {
    pub id: [u8; 3],
    pub capacity: usize,
    pub manufacturer: &'static str,
}

impl JedecInfo {
    pub fn from_id(id: [u8; 3]) -> Self {
        let manufacturer = MANUFACTURERS
            .iter()
            .find(|(code, _)| *code == id[0])
            .map_or("unknown", |(_, name)| name);
        Self {
            id,
            capacity: 1usize.checked_shl(u32::from(id[2])).unwrap_or(0),
            manufacturer,
        }
    }

    /// The part of the chip reachable with 16-bit page addresses.
    pub fn addressable(&self) -> usize {
        self.capacity.min(FX_MAX_PAGES * FX_PAGE_SIZE)
    }
}

/// How to leave the bootloader at the end of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    /// Start the sketch.
    Bootloader,
    /// Reset the LED and drop the connection, leaving the device in the
    /// bootloader menu.
    Normal,
}

/// The erase-block layout of a write to `[start, start + len)`.
///
/// The chip erases a whole block before writing it, so the parts of the
/// first and last block the caller does not provide must be read back and
/// written again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockPlan {
    /// Block-aligned start of the write on the chip.
    pub start: usize,
    /// Total bytes written, a multiple of the block size.
    pub len: usize,
    /// Existing bytes to keep before the caller's data.
    pub leading: Range<usize>,
    /// Existing bytes to keep after the caller's data, if it doesn't end on
    /// a block boundary.
    pub trailing: Option<Range<usize>>,
}

impl BlockPlan {
    pub fn new(start: usize, len: usize, block: usize) -> Self {
        let aligned_start = start - start % block;
        let end = start + len;
        let aligned_end = match end % block {
            0 => end,
            rem => end + (block - rem),
        };
        Self {
            start: aligned_start,
            len: aligned_end - aligned_start,
            leading: aligned_start..start,
            trailing: (aligned_end != end).then_some(end..aligned_end),
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Memory {
    Flash,
    Fx,
    Eeprom,
}

impl Memory {
    fn tag(self) -> u8 {
        match self {
            Memory::Flash => b'F',
            Memory::Fx => b'C',
            Memory::Eeprom => b'E',
        }
    }
}

/// Block lengths go on the wire as 16 bits, with 0 meaning 65536.
fn wire_len(len: usize) -> [u8; 2] {
    ((len & 0xFFFF) as u16).to_be_bytes()
}

/// A conversation with one device in bootloader mode.
pub struct Session<T> {
    port: T,
    label: String,
    config: SessionConfig,
    chip: Option<JedecInfo>,
}

impl<T: Read + Write> Session<T> {
    /// Wraps an open transport. `label` names it in errors and logs, usually
    /// the port name.
    pub fn new(port: T, label: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            port,
            label: label.into(),
            config,
            chip: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Runs `body` against this session, then leaves the bootloader the way
    /// `exit` says, whether or not `body` succeeded. An error from `body`
    /// takes precedence over one from exiting.
    pub fn run<R>(
        mut self,
        exit: Exit,
        body: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let result = body(&mut self);
        let exited = match exit {
            Exit::Bootloader => self.exit_bootloader(),
            Exit::Normal => self.exit_normal(),
        };
        match (result, exited) {
            (Ok(r), Ok(())) => Ok(r),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(exit_err)) => {
                warn!("also failed to leave the bootloader: {}", exit_err);
                Err(e)
            }
        }
    }

    ///////////////////////////////////////////////////////////////////
    // Wire primitives.

    fn send(&mut self, op: &'static str, bytes: &[u8]) -> Result<()> {
        let r = self.port.write_all(bytes).and_then(|()| self.port.flush());
        r.map_err(|e| Error::io(op, &self.label, e))
    }

    fn recv(&mut self, op: &'static str, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        let r = self.port.read_exact(&mut buf);
        r.map_err(|e| Error::io(op, &self.label, e))?;
        Ok(buf)
    }

    /// Sends a command answered by a single acknowledgement byte.
    fn ack(&mut self, op: &'static str, command: &[u8]) -> Result<()> {
        self.send(op, command)?;
        self.recv(op, 1)?;
        Ok(())
    }

    fn select_flash_page(&mut self, page: usize) -> Result<()> {
        // The register holds a word address.
        self.ack("set address", &[b'A', (page >> 2) as u8, ((page & 3) << 6) as u8])
    }

    fn select_fx_page(&mut self, page: u16) -> Result<()> {
        let [hi, lo] = page.to_be_bytes();
        self.ack("set address", &[b'A', hi, lo])
    }

    fn read_block(&mut self, op: &'static str, mem: Memory, len: usize) -> Result<Vec<u8>> {
        let [hi, lo] = wire_len(len);
        self.send(op, &[b'g', hi, lo, mem.tag()])?;
        self.recv(op, len)
    }

    fn write_block(&mut self, op: &'static str, mem: Memory, data: &[u8]) -> Result<()> {
        let [hi, lo] = wire_len(data.len());
        self.send(op, &[b'B', hi, lo, mem.tag()])?;
        self.send(op, data)?;
        self.recv(op, 1)?;
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////
    // Bootloader identification.

    /// Bootloader version number.
    pub fn version(&mut self) -> Result<u8> {
        self.send("read version", b"V")?;
        let reply = self.recv("read version", 2)?;
        std::str::from_utf8(&reply)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::format(format!(
                "bootloader on {} sent unreadable version {:02x?}",
                self.label, reply,
            )))
    }

    /// Fails unless the bootloader is new enough to reach the FX chip.
    pub fn require_fx_support(&mut self) -> Result<u8> {
        let version = self.version()?;
        if version < FX_MIN_VERSION {
            return Err(Error::Unsupported {
                port: self.label.clone(),
                version,
                required: FX_MIN_VERSION,
            });
        }
        Ok(version)
    }

    /// Checks for the stock 4K Caterina bootloader, which a sketch can
    /// overwrite.
    pub fn is_caterina(&mut self) -> Result<bool> {
        self.send("read version", b"V")?;
        if self.recv("read version", 2)? != b"10" {
            return Ok(false);
        }
        self.send("read lock bits", b"r")?;
        let lock = self.recv("read lock bits", 1)?;
        Ok(lock[0] & 0x10 != 0)
    }

    fn read_jedec(&mut self) -> Result<[u8; 3]> {
        self.send("read JEDEC id", b"j")?;
        let reply = self.recv("read JEDEC id", 3)?;
        Ok([reply[0], reply[1], reply[2]])
    }

    /// Identifies the FX chip. The chip is queried twice, since the first
    /// answer after power-up can be garbage.
    pub fn jedec_id(&mut self) -> Result<JedecInfo> {
        let first = self.read_jedec()?;
        thread::sleep(self.config.jedec_settle);
        let second = self.read_jedec()?;
        if first != second || second == [0; 3] || second == [0xFF; 3] {
            debug!("{}: JEDEC replies {:02x?} then {:02x?}", self.label, first, second);
            return Err(Error::NoFxChip {
                port: self.label.clone(),
                id: second,
            });
        }
        let info = JedecInfo::from_id(second);
        info!(
            "{}: FX chip {:02X}{:02X}{:02X} ({}, {} KiB)",
            self.label, info.id[0], info.id[1], info.id[2],
            info.manufacturer, info.capacity / 1024,
        );
        Ok(info)
    }

    /// Checks the bootloader version and chip once per session, before the
    /// first FX operation.
    pub fn fx_chip(&mut self) -> Result<JedecInfo> {
        if let Some(chip) = self.chip {
            return Ok(chip);
        }
        self.require_fx_support()?;
        let chip = self.jedec_id()?;
        self.chip = Some(chip);
        Ok(chip)
    }

    pub fn set_led(&mut self, bits: u8) -> Result<()> {
        self.ack("set LED", &[b'x', bits])
    }

    ///////////////////////////////////////////////////////////////////
    // Onboard flash.

    pub fn read_flash_page(&mut self, page: usize) -> Result<Vec<u8>> {
        check_flash_page(page)?;
        self.select_flash_page(page)?;
        self.read_block("read flash", Memory::Flash, FLASH_PAGE_SIZE)
    }

    pub fn write_flash_page(&mut self, page: usize, data: &[u8]) -> Result<()> {
        check_flash_page(page)?;
        if data.len() != FLASH_PAGE_SIZE {
            return Err(Error::format(format!(
                "flash pages are {} bytes, got {}",
                FLASH_PAGE_SIZE,
                data.len(),
            )));
        }
        self.select_flash_page(page)?;
        self.write_block("write flash", Memory::Flash, data)
    }

    /// Writes the pages a decoded sketch uses, and optionally reads them all
    /// back afterwards.
    ///
    /// Refuses a sketch that reaches into the bootloader region if the
    /// device runs Caterina, which would be destroyed by it.
    pub fn flash_sketch(
        &mut self,
        sketch: &DecodedHex,
        verify: bool,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<()> {
        let pages: Vec<usize> = sketch.pages.iter()
            .filter(|&p| p < FLASH_PAGE_COUNT)
            .collect();
        if pages.iter().any(|&p| p >= BOOTLOADER_START_PAGE) && self.is_caterina()? {
            return Err(Error::format(format!(
                "sketch would overwrite the Caterina bootloader on {}",
                self.label,
            )));
        }

        info!(
            "{}: flashing {} bytes ({} pages)",
            self.label, pages.len() * FLASH_PAGE_SIZE, pages.len(),
        );
        let total = pages.len() * if verify { 2 } else { 1 };
        let mut done = 0;
        for &page in &pages {
            let range = page * FLASH_PAGE_SIZE..(page + 1) * FLASH_PAGE_SIZE;
            self.write_flash_page(page, &sketch.data[range])?;
            done += 1;
            progress(Progress { done, total });
        }
        if verify {
            for &page in &pages {
                let range = page * FLASH_PAGE_SIZE..(page + 1) * FLASH_PAGE_SIZE;
                let readback = self.read_flash_page(page)?;
                if let Some(offset) = first_difference(&readback, &sketch.data[range]) {
                    return Err(Error::Verify {
                        op: "flash",
                        port: self.label.clone(),
                        address: page * FLASH_PAGE_SIZE + offset,
                    });
                }
                done += 1;
                progress(Progress { done, total });
            }
        }
        Ok(())
    }

    /// Reads onboard flash, minus the bootloader unless asked for.
    pub fn backup_sketch(&mut self, include_bootloader: bool) -> Result<Vec<u8>> {
        self.select_flash_page(0)?;
        let mut image = self.read_block("read flash", Memory::Flash, FLASH_SIZE)?;
        if !include_bootloader {
            image.truncate(FLASH_SIZE - BOOTLOADER_SIZE);
        }
        Ok(image)
    }

    ///////////////////////////////////////////////////////////////////
    // FX chip.

    /// Reads up to one block starting at an FX page.
    pub fn read_fx(&mut self, page: u16, len: usize) -> Result<Vec<u8>> {
        if len == 0 || len > FX_BLOCK_SIZE {
            return Err(Error::format(format!(
                "FX reads must be 1 to {} bytes, not {}",
                FX_BLOCK_SIZE, len,
            )));
        }
        self.select_fx_page(page)?;
        self.read_block("read FX", Memory::Fx, len)
    }

    /// Reads an arbitrary byte range. The wire only addresses whole pages,
    /// so reading starts at the page holding `range.start` and the excess is
    /// dropped.
    fn read_fx_range(&mut self, range: Range<usize>) -> Result<Vec<u8>> {
        let skip = range.start % FX_PAGE_SIZE;
        let mut address = range.start - skip;
        let mut out = Vec::with_capacity(range.end - address);
        while address < range.end {
            let len = (range.end - address).min(FX_BLOCK_SIZE);
            out.extend(self.read_fx((address / FX_PAGE_SIZE) as u16, len)?);
            address += len;
        }
        Ok(out.split_off(skip))
    }

    /// Writes `data` to the FX chip at byte `address`, preserving whatever
    /// shares an erase block with it.
    pub fn write_fx(
        &mut self,
        address: usize,
        data: &[u8],
        verify: bool,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<()> {
        let chip = self.fx_chip()?;
        if data.is_empty() {
            return Ok(());
        }
        let plan = BlockPlan::new(address, data.len(), FX_BLOCK_SIZE);
        if address + data.len() > chip.addressable() {
            return Err(Error::format(format!(
                "{} bytes at {:#x} run past the end of the {} byte FX chip on {}",
                data.len(), address, chip.addressable(), self.label,
            )));
        }

        let mut stream = Vec::with_capacity(plan.len);
        if !plan.leading.is_empty() {
            debug!("{}: keeping {:x?} ahead of the write", self.label, plan.leading);
            stream.extend(self.read_fx_range(plan.leading.clone())?);
        }
        stream.extend_from_slice(data);
        if let Some(trailing) = plan.trailing.clone() {
            debug!("{}: keeping {:x?} after the write", self.label, trailing);
            stream.extend(self.read_fx_range(trailing)?);
        }

        let total = stream.len() / FX_BLOCK_SIZE;
        info!(
            "{}: writing {} FX blocks at {:#x}",
            self.label, total, plan.start,
        );
        for (i, block) in stream.chunks(FX_BLOCK_SIZE).enumerate() {
            let block_address = plan.start + i * FX_BLOCK_SIZE;
            let page = (block_address / FX_PAGE_SIZE) as u16;
            self.set_led(LED_WRITE[i & 1])?;
            self.select_fx_page(page)?;
            self.write_block("write FX", Memory::Fx, block)?;
            if verify {
                self.set_led(LED_VERIFY)?;
                let readback = self.read_fx(page, block.len())?;
                if let Some(offset) = first_difference(&readback, block) {
                    return Err(Error::Verify {
                        op: "FX",
                        port: self.label.clone(),
                        address: block_address + offset,
                    });
                }
            }
            progress(Progress { done: i + 1, total });
        }
        self.set_led(LED_IDLE)
    }

    /// Writes `data` so that it ends at the top of the chip, where
    /// development data and save regions live. Returns the address used.
    pub fn flash_fx_at_end(
        &mut self,
        data: &[u8],
        verify: bool,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<usize> {
        let chip = self.fx_chip()?;
        let mut padded = data.to_vec();
        pad_to(&mut padded, FX_PAGE_SIZE);
        let address = chip.addressable().checked_sub(padded.len())
            .ok_or_else(|| Error::format(format!(
                "{} bytes don't fit on the {} byte FX chip on {}",
                padded.len(), chip.addressable(), self.label,
            )))?;
        self.write_fx(address, &padded, verify, progress)?;
        Ok(address)
    }

    /// Writes a compiled flashcart: the slot chain from page 0, then the
    /// save region.
    pub fn write_cart(
        &mut self,
        cart: &CompiledCart,
        verify: bool,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<()> {
        self.write_fx(0, &cart.stream, verify, progress)?;
        if let Some((address, region)) = cart.save_region_bytes() {
            debug!("{}: writing {} byte save region", self.label, region.len());
            self.write_fx(address, &region, verify, progress)?;
        }
        Ok(())
    }

    /// Reads the whole chip.
    pub fn backup_fx(&mut self, progress: &mut dyn FnMut(Progress)) -> Result<Vec<u8>> {
        let chip = self.fx_chip()?;
        let total = chip.addressable() / FX_BLOCK_SIZE;
        let mut image = Vec::with_capacity(chip.addressable());
        for block in 0..total {
            let page = (block * FX_BLOCK_SIZE / FX_PAGE_SIZE) as u16;
            image.extend(self.read_fx(page, FX_BLOCK_SIZE)?);
            progress(Progress { done: block + 1, total });
        }
        Ok(image)
    }

    ///////////////////////////////////////////////////////////////////
    // EEPROM.

    pub fn read_eeprom(&mut self) -> Result<Vec<u8>> {
        self.select_fx_page(0)?;
        self.read_block("read EEPROM", Memory::Eeprom, EEPROM_SIZE)
    }

    pub fn write_eeprom(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != EEPROM_SIZE {
            return Err(Error::format(format!(
                "EEPROM images must be exactly {} bytes, not {}",
                EEPROM_SIZE,
                data.len(),
            )));
        }
        self.select_fx_page(0)?;
        self.write_block("write EEPROM", Memory::Eeprom, data)
    }

    pub fn erase_eeprom(&mut self) -> Result<()> {
        self.write_eeprom(&[0xFF; EEPROM_SIZE])
    }

    ///////////////////////////////////////////////////////////////////
    // Leaving.

    /// Leaves the bootloader and starts the sketch.
    pub fn exit_bootloader(mut self) -> Result<()> {
        self.ack("exit bootloader", b"E")
    }

    /// Turns the LED off, re-enables the buttons and closes the port.
    pub fn exit_normal(mut self) -> Result<()> {
        self.set_led(LED_IDLE)
    }
}

fn check_flash_page(page: usize) -> Result<()> {
    if page >= FLASH_PAGE_COUNT {
        return Err(Error::format(format!(
            "flash page {} is outside the {} page flash",
            page, FLASH_PAGE_COUNT,
        )));
    }
    Ok(())
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter().zip(b).position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hex;
    use std::collections::VecDeque;
    use std::io;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Op {
        Read { mem: u8, address: usize, len: usize },
        Write { mem: u8, address: usize, len: usize },
        Led(u8),
        Exit,
    }

    /// Simulates a bootloader with its three memories.
    struct FakeBootloader {
        version: [u8; 2],
        lock: u8,
        jedec: VecDeque<[u8; 3]>,
        flash: Vec<u8>,
        fx: Vec<u8>,
        eeprom: Vec<u8>,
        register: usize,
        corrupt_writes: bool,
        input: Vec<u8>,
        output: VecDeque<u8>,
        log: Vec<Op>,
    }

    impl FakeBootloader {
        fn new() -> Self {
            Self {
                version: *b"14",
                lock: 0,
                // 256 KiB Winbond part
                jedec: VecDeque::from(vec![[0xEF, 0x40, 0x12]]),
                flash: vec![0xFF; FLASH_SIZE],
                fx: (0..1 << 18).map(|i| (i % 251) as u8).collect(),
                eeprom: vec![0x55; EEPROM_SIZE],
                register: 0,
                corrupt_writes: false,
                input: Vec::new(),
                output: VecDeque::new(),
                log: Vec::new(),
            }
        }

        fn address(&self, mem: u8) -> usize {
            match mem {
                b'F' => self.register * 2,
                b'C' => self.register * FX_PAGE_SIZE,
                _ => self.register,
            }
        }

        fn memory(&mut self, mem: u8) -> &mut Vec<u8> {
            match mem {
                b'F' => &mut self.flash,
                b'C' => &mut self.fx,
                b'E' => &mut self.eeprom,
                other => panic!("unknown memory {:?}", other as char),
            }
        }

        fn block_len(hi: u8, lo: u8) -> usize {
            match u16::from_be_bytes([hi, lo]) {
                0 => 65536,
                n => usize::from(n),
            }
        }

        /// Consumes complete commands from `input`.
        fn process(&mut self) {
            loop {
                if self.input.is_empty() {
                    return;
                }
                let needed = match self.input[0] {
                    b'A' => 3,
                    b'g' => 4,
                    b'B' if self.input.len() >= 4 => {
                        4 + Self::block_len(self.input[1], self.input[2])
                    }
                    b'B' => 4,
                    b'x' => 2,
                    _ => 1,
                };
                if self.input.len() < needed {
                    return;
                }
                let cmd: Vec<u8> = self.input.drain(..needed).collect();
                match cmd[0] {
                    b'A' => {
                        self.register = usize::from(u16::from_be_bytes([cmd[1], cmd[2]]));
                        self.output.push_back(0x0D);
                    }
                    b'g' => {
                        let len = Self::block_len(cmd[1], cmd[2]);
                        let address = self.address(cmd[3]);
                        self.log.push(Op::Read { mem: cmd[3], address, len });
                        let bytes = self.memory(cmd[3])[address..address + len].to_vec();
                        self.output.extend(bytes);
                    }
                    b'B' => {
                        let address = self.address(cmd[3]);
                        let mut data = cmd[4..].to_vec();
                        self.log.push(Op::Write { mem: cmd[3], address, len: data.len() });
                        if self.corrupt_writes {
                            data[7] ^= 0x01;
                        }
                        self.memory(cmd[3])[address..address + data.len()]
                            .copy_from_slice(&data);
                        self.output.push_back(0x0D);
                    }
                    b'V' => self.output.extend(self.version),
                    b'r' => self.output.push_back(self.lock),
                    b'j' => {
                        let id = if self.jedec.len() > 1 {
                            self.jedec.pop_front().unwrap()
                        } else {
                            self.jedec[0]
                        };
                        self.output.extend(id);
                    }
                    b'x' => {
                        self.log.push(Op::Led(cmd[1]));
                        self.output.push_back(0x0D);
                    }
                    b'E' => {
                        self.log.push(Op::Exit);
                        self.output.push_back(0x0D);
                    }
                    other => panic!("unexpected command {:?}", other as char),
                }
            }
        }

        fn writes(&self) -> Vec<&Op> {
            self.log.iter().filter(|op| matches!(op, Op::Write { .. })).collect()
        }
    }

    impl Write for FakeBootloader {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.input.extend_from_slice(buf);
            self.process();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for FakeBootloader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.output.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
            }
            let n = buf.len().min(self.output.len());
            for (dst, src) in buf.iter_mut().zip(self.output.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            jedec_settle: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    fn session(fake: FakeBootloader) -> Session<FakeBootloader> {
        Session::new(fake, "fake0", config())
    }

    fn no_progress() -> impl FnMut(Progress) {
        |_| ()
    }

    #[test]
    fn block_plan_spanning_two_blocks() {
        let plan = BlockPlan::new(100, 69900, 65536);
        assert_eq!(plan.start, 0);
        assert_eq!(plan.len, 131072);
        assert_eq!(plan.leading, 0..100);
        assert_eq!(plan.trailing, Some(70000..131072));
    }

    #[test]
    fn block_plan_aligned() {
        let plan = BlockPlan::new(65536, 65536, 65536);
        assert_eq!(plan.start, 65536);
        assert_eq!(plan.len, 65536);
        assert!(plan.leading.is_empty());
        assert_eq!(plan.trailing, None);
    }

    #[test]
    fn full_block_length_wraps_to_zero() {
        assert_eq!(wire_len(65536), [0, 0]);
        assert_eq!(wire_len(1024), [0x04, 0x00]);
    }

    #[test]
    fn version_and_caterina() {
        let mut s = session(FakeBootloader::new());
        assert_eq!(s.version().unwrap(), 14);
        assert!(!s.is_caterina().unwrap());

        let mut fake = FakeBootloader::new();
        fake.version = *b"10";
        fake.lock = 0x10;
        assert!(session(fake).is_caterina().unwrap());
    }

    #[test]
    fn jedec_identifies_chip() {
        let mut s = session(FakeBootloader::new());
        let info = s.jedec_id().unwrap();
        assert_eq!(info.capacity, 1 << 18);
        assert_eq!(info.manufacturer, "Winbond");
    }

    #[test]
    fn jedec_mismatch_means_no_chip() {
        let mut fake = FakeBootloader::new();
        fake.jedec = VecDeque::from(vec![[0xEF, 0x40, 0x18], [0xEF, 0x40, 0x12]]);
        assert!(matches!(
            session(fake).jedec_id(),
            Err(Error::NoFxChip { id: [0xEF, 0x40, 0x12], .. }),
        ));

        let mut fake = FakeBootloader::new();
        fake.jedec = VecDeque::from(vec![[0xFF; 3]]);
        assert!(matches!(session(fake).jedec_id(), Err(Error::NoFxChip { .. })));
    }

    #[test]
    fn old_bootloader_rejected_before_writing() {
        let mut fake = FakeBootloader::new();
        fake.version = *b"12";
        let mut s = session(fake);
        let r = s.write_fx(0, &[1, 2, 3], false, &mut no_progress());
        assert!(matches!(r, Err(Error::Unsupported { version: 12, required: 13, .. })));
        assert!(s.port.writes().is_empty());
    }

    #[test]
    fn unaligned_write_preserves_neighbors() {
        let fake = FakeBootloader::new();
        let original = fake.fx.clone();
        let mut s = session(fake);
        let data = vec![0xA5; 69900];
        let mut calls = Vec::new();
        s.write_fx(100, &data, false, &mut |p| calls.push(p)).unwrap();

        let fake = &s.port;
        let reads: Vec<&Op> = fake.log.iter()
            .filter(|op| matches!(op, Op::Read { .. }))
            .collect();
        assert_eq!(reads, vec![
            &Op::Read { mem: b'C', address: 0, len: 100 },
            // starts at the page holding byte 70000
            &Op::Read { mem: b'C', address: 69888, len: 131072 - 69888 },
        ]);
        assert_eq!(fake.writes(), vec![
            &Op::Write { mem: b'C', address: 0, len: 65536 },
            &Op::Write { mem: b'C', address: 65536, len: 65536 },
        ]);
        assert_eq!(&fake.fx[..100], &original[..100]);
        assert!(fake.fx[100..70000].iter().all(|&b| b == 0xA5));
        assert_eq!(&fake.fx[70000..], &original[70000..]);
        assert_eq!(calls.last(), Some(&Progress { done: 2, total: 2 }));
        assert_eq!(fake.log.last(), Some(&Op::Led(LED_IDLE)));
    }

    #[test]
    fn write_past_chip_end_fails() {
        let mut s = session(FakeBootloader::new());
        let r = s.write_fx((1 << 18) - 10, &[0; 20], false, &mut no_progress());
        assert!(matches!(r, Err(Error::Format { .. })));
        assert!(s.port.writes().is_empty());
    }

    #[test]
    fn verify_failure_reports_address() {
        let mut fake = FakeBootloader::new();
        fake.corrupt_writes = true;
        let mut s = session(fake);
        let r = s.write_fx(65536, &vec![0; 65536 * 2], true, &mut no_progress());
        match r {
            Err(Error::Verify { op, address, .. }) => {
                assert_eq!(op, "FX");
                assert_eq!(address, 65536 + 7);
            }
            other => panic!("expected verify failure, got {:?}", other),
        }
        // aborted after the first block
        assert_eq!(s.port.writes().len(), 1);
    }

    #[test]
    fn data_at_end_of_chip() {
        let mut s = session(FakeBootloader::new());
        let address = s.flash_fx_at_end(&[7; 300], true, &mut no_progress()).unwrap();
        assert_eq!(address, (1 << 18) - 512);
        assert_eq!(&s.port.fx[address..address + 300], &[7; 300][..]);
        assert!(s.port.fx[address + 300..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn backup_reads_whole_chip() {
        let fake = FakeBootloader::new();
        let original = fake.fx.clone();
        let mut s = session(fake);
        let mut calls = 0;
        let image = s.backup_fx(&mut |_| calls += 1).unwrap();
        assert_eq!(image, original);
        assert_eq!(calls, 4);
    }

    #[test]
    fn eeprom_round_trip() {
        let mut s = session(FakeBootloader::new());
        assert_eq!(s.read_eeprom().unwrap(), vec![0x55; EEPROM_SIZE]);
        let data: Vec<u8> = (0..EEPROM_SIZE).map(|i| i as u8).collect();
        s.write_eeprom(&data).unwrap();
        assert_eq!(s.read_eeprom().unwrap(), data);
        s.erase_eeprom().unwrap();
        assert_eq!(s.port.eeprom, vec![0xFF; EEPROM_SIZE]);
        assert!(s.write_eeprom(&[0; 10]).is_err());
    }

    #[test]
    fn sketch_writes_only_used_pages() {
        let text = ":040000000C94A800B4\n:040100001122334451\n:00000001FF";
        let decoded = hex::decode(text).unwrap();
        let mut s = session(FakeBootloader::new());
        let mut calls = Vec::new();
        s.flash_sketch(&decoded, true, &mut |p| calls.push(p)).unwrap();

        assert_eq!(s.port.writes(), vec![
            &Op::Write { mem: b'F', address: 0, len: 128 },
            &Op::Write { mem: b'F', address: 256, len: 128 },
        ]);
        assert_eq!(&s.port.flash[..4], &[0x0C, 0x94, 0xA8, 0x00]);
        assert_eq!(&s.port.flash[256..260], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[3], Progress { done: 4, total: 4 });
    }

    #[test]
    fn sketch_over_caterina_is_refused() {
        let mut record = vec![0x01, 0x70, 0x00, 0x00, 0x42];
        let sum = record.iter().fold(0u8, |a, &b| a.wrapping_add(b)).wrapping_neg();
        record.push(sum);
        let text: String = std::iter::once(":".to_string())
            .chain(record.iter().map(|b| format!("{:02X}", b)))
            .collect();
        let decoded = hex::decode(&text).unwrap();

        let mut fake = FakeBootloader::new();
        fake.version = *b"10";
        fake.lock = 0x10;
        let mut s = session(fake);
        assert!(s.flash_sketch(&decoded, false, &mut no_progress()).is_err());
        assert!(s.port.writes().is_empty());
    }

    #[test]
    fn sketch_backup_drops_bootloader() {
        let mut fake = FakeBootloader::new();
        fake.flash[0] = 0x12;
        let mut s = session(fake);
        let image = s.backup_sketch(false).unwrap();
        assert_eq!(image.len(), FLASH_SIZE - 4096);
        assert_eq!(image[0], 0x12);
        assert_eq!(s.backup_sketch(true).unwrap().len(), FLASH_SIZE);
    }

    #[test]
    fn run_always_exits() {
        let mut fake = FakeBootloader::new();
        fake.version = *b"09";
        let s = Session::new(&mut fake, "fake0", config());
        let r = s.run(Exit::Bootloader, |s| s.require_fx_support());
        assert!(matches!(r, Err(Error::Unsupported { .. })));
        assert_eq!(fake.log.last(), Some(&Op::Exit));

        let mut fake = FakeBootloader::new();
        let s = Session::new(&mut fake, "fake0", config());
        assert_eq!(s.run(Exit::Normal, |s| s.version()).unwrap(), 14);
        assert_eq!(fake.log, vec![Op::Led(LED_IDLE)]);
    }

    #[test]
    fn silent_device_times_out() {
        let mut s = session(FakeBootloader::new());
        // A reply was never produced for this.
        let r = s.recv("read version", 2);
        assert!(matches!(r, Err(Error::Timeout { op: "read version", .. })));
    }
}
