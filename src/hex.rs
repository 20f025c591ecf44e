// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intel HEX decoding and encoding for sketch images.
//!
//! Only what the AVR toolchain produces is understood: type 0 data records
//! with 16-bit addresses, terminated by an end-of-file record. Anything else
//! is skipped. Checksums on data records are always enforced, since a
//! corrupted image must never make it onto hardware.

use std::fmt::Write;

use tracing::debug;

use crate::error::{Error, Result};
use crate::format::{FLASH_PAGE_SIZE, FLASH_SIZE};
use crate::page::PageMap;

pub const BYTES_PER_RECORD: u8 = 16;
pub const END_RECORD: &str = ":00000001FF";

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;

/// A flat flash image decoded from hex text.
#[derive(Clone, Debug)]
pub struct DecodedHex {
    /// Exactly `FLASH_SIZE` bytes; anything not written is `0xFF`.
    pub data: Vec<u8>,
    /// Pages touched by data records.
    pub pages: PageMap,
}

/// Decodes hex text into a full flash image.
pub fn decode(text: &str) -> Result<DecodedHex> {
    let mut data = vec![0xFF; FLASH_SIZE];
    let mut pages = PageMap::with_page_size(FLASH_PAGE_SIZE);

    for (i, line) in text.lines().enumerate() {
        let lineno = i + 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == END_RECORD {
            break;
        }
        let Some(digits) = line.strip_prefix(':') else {
            debug!("hex line {} is not a record, skipping", lineno);
            continue;
        };

        let record = parse_digits(digits)
            .ok_or_else(|| Error::format(format!(
                "hex line {} contains invalid hex digits",
                lineno,
            )))?;
        // count, address (2), type, ..., checksum
        if record.len() < 4 {
            return Err(Error::format(format!(
                "hex line {} is too short to be a record",
                lineno,
            )));
        }

        match record[3] {
            RECORD_DATA => {
                if record.len() != usize::from(record[0]) + 5 {
                    return Err(Error::format(format!(
                        "hex line {} has {} bytes, which doesn't match its byte count",
                        lineno,
                        record.len(),
                    )));
                }
                let count = usize::from(record[0]);
                let address = usize::from(u16::from_be_bytes([record[1], record[2]]));
                let payload = &record[4..4 + count];
                let (body, sum) = record.split_at(record.len() - 1);
                let expected = checksum(body);
                if sum[0] != expected {
                    return Err(Error::Checksum {
                        line: lineno,
                        expected,
                        actual: sum[0],
                    });
                }
                let end = address + count;
                if end > data.len() {
                    return Err(Error::format(format!(
                        "hex line {} writes {} bytes at {:#06x}, past the end \
                         of {} byte flash",
                        lineno,
                        count,
                        address,
                        FLASH_SIZE,
                    )));
                }
                data[address..end].copy_from_slice(payload);
                pages.add(address, count);
            }
            RECORD_EOF => break,
            other => {
                debug!("hex line {}: ignoring record type {:#04x}", lineno, other);
            }
        }
    }

    Ok(DecodedHex { data, pages })
}

/// Encodes `binary` as hex text with 16 bytes per record.
pub fn encode(binary: &[u8]) -> Result<String> {
    encode_with(binary, BYTES_PER_RECORD)
}

/// Encodes `binary` as hex text with `per_record` bytes per data record. The
/// image is assumed to start at address 0.
pub fn encode_with(binary: &[u8], per_record: u8) -> Result<String> {
    if per_record == 0 {
        return Err(Error::format("hex records must hold at least one byte"));
    }
    if binary.len() > 0x10000 {
        return Err(Error::format(format!(
            "{} bytes doesn't fit in 16-bit hex addressing",
            binary.len(),
        )));
    }

    let mut out = String::with_capacity(binary.len() * 2 + binary.len() / 2);
    for (i, chunk) in binary.chunks(usize::from(per_record)).enumerate() {
        let address = (i * usize::from(per_record)) as u16;
        let mut record = Vec::with_capacity(chunk.len() + 5);
        record.push(chunk.len() as u8);
        record.extend_from_slice(&address.to_be_bytes());
        record.push(RECORD_DATA);
        record.extend_from_slice(chunk);
        record.push(checksum(&record));

        out.push(':');
        for b in record {
            // Writing into a String can't fail.
            let _ = write!(out, "{:02X}", b);
        }
        out.push('\n');
    }
    out.push_str(END_RECORD);
    Ok(out)
}

/// Two's complement of the byte sum, which makes the whole record sum to 0.
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)).wrapping_neg()
}

fn parse_digits(digits: &str) -> Option<Vec<u8>> {
    if digits.len() % 2 != 0 || !digits.is_ascii() {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}
