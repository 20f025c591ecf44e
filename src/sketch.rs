// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Analysis of single-program flash images.

use crate::format::{
    align_up, BOOTLOADER_START_PAGE, FLASH_PAGE_COUNT, FLASH_PAGE_SIZE, FLASH_SIZE,
};
use crate::hex::DecodedHex;
use crate::page::PageMap;

/// Facts about a sketch image needed before uploading or packing it.
#[derive(Clone, Debug)]
pub struct SketchAnalysis {
    /// One entry per 128-byte flash page.
    pub used_pages: Vec<bool>,
    pub page_count: usize,
    /// The image cut after its last used byte, padded to a page boundary.
    pub trimmed: Vec<u8>,
    /// The image reaches into the bootloader region.
    pub overwrites_bootloader: bool,
}

impl SketchAnalysis {
    /// Length of the meaningful part of the image in bytes.
    pub fn len(&self) -> usize {
        self.trimmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trimmed.is_empty()
    }
}

/// Analyzes a raw flash image. With no record boundaries to go on, a page is
/// used iff it holds anything other than erased bytes.
pub fn analyze(binary: &[u8]) -> SketchAnalysis {
    let pages = PageMap::from_image(binary, FLASH_PAGE_SIZE, 0xFF);
    analyze_with(binary, &pages)
}

/// Analyzes a decoded hex image, using the pages its data records touched.
///
/// This can differ from [`analyze`]: a record that spans a page boundary
/// marks both pages even if one of them only received `0xFF` bytes.
pub fn analyze_hex(decoded: &DecodedHex) -> SketchAnalysis {
    analyze_with(&decoded.data, &decoded.pages)
}

fn analyze_with(binary: &[u8], pages: &PageMap) -> SketchAnalysis {
    let used_pages = pages.mask(FLASH_PAGE_COUNT);
    // Note that this is not simply "highest used page": what matters is
    // whether any page the upload will write lands in the bootloader.
    let overwrites_bootloader = pages.iter().any(|p| p >= BOOTLOADER_START_PAGE);

    let end = binary.iter().rposition(|&b| b != 0xFF).map_or(0, |i| i + 1);
    let mut trimmed = binary[..end].to_vec();
    trimmed.resize(align_up(end, FLASH_PAGE_SIZE), 0xFF);

    SketchAnalysis {
        used_pages,
        page_count: pages.page_count(),
        trimmed,
        overwrites_bootloader,
    }
}

/// Pads a possibly short program out to a full flash image.
pub fn expand(program: &[u8]) -> Vec<u8> {
    let mut full = program.to_vec();
    if full.len() < FLASH_SIZE {
        full.resize(FLASH_SIZE, 0xFF);
    }
    full
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hex;

    fn image_with(len: usize) -> Vec<u8> {
        let mut image = vec![0xFF; FLASH_SIZE];
        for (i, b) in image[..len].iter_mut().enumerate() {
            *b = i as u8 & 0x7F;
        }
        image
    }

    #[test]
    fn small_sketch() {
        let analysis = analyze(&image_with(5));
        assert_eq!(analysis.page_count, 1);
        assert!(!analysis.overwrites_bootloader);
        assert_eq!(analysis.trimmed.len(), FLASH_PAGE_SIZE);
        assert_eq!(&analysis.trimmed[..5], &[0, 1, 2, 3, 4]);
        assert!(analysis.trimmed[5..].iter().all(|&b| b == 0xFF));
        for (i, used) in analysis.used_pages.iter().enumerate() {
            assert_eq!(*used, i == 0);
        }
    }

    #[test]
    fn bootloader_threshold_page() {
        let mut image = image_with(5);
        image[BOOTLOADER_START_PAGE * FLASH_PAGE_SIZE] = 0x00;
        let analysis = analyze(&image);
        assert!(analysis.overwrites_bootloader);
        assert_eq!(analysis.page_count, 2);

        let mut image = image_with(5);
        image[BOOTLOADER_START_PAGE * FLASH_PAGE_SIZE - 1] = 0x00;
        assert!(!analyze(&image).overwrites_bootloader);
    }

    #[test]
    fn empty_image() {
        let analysis = analyze(&vec![0xFF; FLASH_SIZE]);
        assert_eq!(analysis.page_count, 0);
        assert!(analysis.is_empty());
    }

    #[test]
    fn spanning_record_counts_gap_pages() {
        // 16 bytes at 0x78 cross from page 0 into page 1; the bytes in page 1
        // are all erased, but the record still touched it.
        let mut data = vec![0x11; 8];
        data.extend_from_slice(&[0xFF; 8]);
        let text = format!(":10007800{}{:02X}\n:00000001FF",
            data.iter().map(|b| format!("{:02X}", b)).collect::<String>(),
            {
                let mut sum: u8 = 0x10 + 0x78;
                for b in &data {
                    sum = sum.wrapping_add(*b);
                }
                sum.wrapping_neg()
            });
        let decoded = hex::decode(&text).unwrap();

        let from_records = analyze_hex(&decoded);
        assert_eq!(from_records.page_count, 2);
        assert!(from_records.used_pages[1]);

        let from_bytes = analyze(&decoded.data);
        assert_eq!(from_bytes.page_count, 1);
        assert_eq!(from_records.trimmed, from_bytes.trimmed);
    }

    #[test]
    fn expand_pads() {
        let full = expand(&[1, 2, 3]);
        assert_eq!(full.len(), FLASH_SIZE);
        assert_eq!(full[3], 0xFF);
    }
}
