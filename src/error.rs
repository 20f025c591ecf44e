// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error conditions reportable by the codecs and the device protocol.

use std::fmt;
use std::io;

use self::Error::*;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// Malformed hex record, flashcart header, or slot contents.
    Format { what: String },
    /// A hex data record whose checksum byte does not validate.
    Checksum { line: usize, expected: u8, actual: u8 },
    /// Slot header with valid magic but a size of zero.
    CorruptCart { offset: usize },
    /// Readback after a write did not match what was written.
    Verify { op: &'static str, port: String, address: usize },
    /// JEDEC query returned nothing usable.
    NoFxChip { port: String, id: [u8; 3] },
    /// Bootloader too old for the requested operation.
    Unsupported { port: String, version: u8, required: u8 },
    /// No matching device showed up before the deadline.
    DeviceNotFound { what: String },
    /// The transport stopped answering mid-operation.
    Timeout { op: &'static str, port: String },
    /// Any other I/O failure, tagged with the operation that hit it.
    Io { op: String, source: io::Error },
    /// Problem reading or writing an `.arduboy` package.
    Package { what: String },
    /// Title image could not be converted.
    Image { what: String },
}

impl Error {
    pub fn format(what: impl Into<String>) -> Self {
        Format { what: what.into() }
    }

    pub fn package(what: impl Into<String>) -> Self {
        Package { what: what.into() }
    }

    pub fn image(what: impl Into<String>) -> Self {
        Image { what: what.into() }
    }

    /// Wraps an I/O error with the operation it came from. Timeouts from the
    /// serial layer are reported as [`Error::Timeout`] so callers can tell a
    /// silent device apart from a broken one.
    pub fn io(op: &'static str, port: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::UnexpectedEof => Timeout {
                op,
                port: port.to_string(),
            },
            _ => Io {
                op: format!("{} on {}", op, port),
                source,
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Format { what } => write!(f, "format error: {}", what),
            Checksum { line, expected, actual } => write!(
                f, "hex checksum error on line {}: checksum byte is {:#04x}, \
                    record content requires {:#04x}",
                line, actual, expected,
            ),
            CorruptCart { offset } => write!(
                f, "corrupt flashcart: slot at offset {:#x} claims a size of 0",
                offset,
            ),
            Verify { op, port, address } => write!(
                f, "{} verify failed on {} at address {:#08x}",
                op, port, address,
            ),
            NoFxChip { port, id } => write!(
                f, "no FX flash chip found on {} (JEDEC id {:02X} {:02X} {:02X})",
                port, id[0], id[1], id[2],
            ),
            Unsupported { port, version, required } => write!(
                f, "bootloader on {} is version {}, version {} or newer \
                    is required",
                port, version, required,
            ),
            DeviceNotFound { what } => write!(f, "device not found: {}", what),
            Timeout { op, port } => write!(f, "{} on {} timed out", op, port),
            Io { op, source } => write!(f, "{}: {}", op, source),
            Package { what } => write!(f, "package error: {}", what),
            Image { what } => write!(f, "image error: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
