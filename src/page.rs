// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A record of which flash pages a program image actually touches.

use std::collections::BTreeSet;

/// Models the set of fixed-size pages that received data while an image was
/// being assembled.
///
/// Pages are tracked by _index,_ which is their base address divided by
/// `page_size`. Only the first and last page of each added extent are marked;
/// this mirrors how the bootloader upload tools have always counted pages, and
/// it matters for images whose records are larger than a page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageMap {
    /// Number of bytes per page.
    page_size: usize,
    pages: BTreeSet<usize>,
}

impl PageMap {
    /// Creates an empty page map configured for a given page size.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            pages: BTreeSet::new(),
        }
    }

    /// Builds a map from a raw image, marking every page that holds at least
    /// one byte different from `fill`.
    pub fn from_image(image: &[u8], page_size: usize, fill: u8) -> Self {
        let mut map = Self::with_page_size(page_size);
        for (i, page) in image.chunks(page_size).enumerate() {
            if page.iter().any(|&b| b != fill) {
                map.pages.insert(i);
            }
        }
        map
    }

    /// Notes that `len` bytes were written starting at `address`.
    ///
    /// If `len` is zero, this is a no-op.
    pub fn add(&mut self, address: usize, len: usize) {
        if len == 0 {
            // Don't populate pages just to put nothing in them.
            return;
        }
        let ps = self.page_size;
        self.pages.insert(address / ps);
        self.pages.insert((address + len - 1) / ps);
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_used(&self, index: usize) -> bool {
        self.pages.contains(&index)
    }

    /// Iterates over used page indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.pages.iter().copied()
    }

    /// Returns the number of pages with data in them. As with the rest of this
    /// type, a page skipped over by a long record is not counted.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn last(&self) -> Option<usize> {
        self.pages.iter().next_back().copied()
    }

    /// Expands the map into a dense mask covering `count` pages. Pages at or
    /// beyond `count` are dropped.
    pub fn mask(&self, count: usize) -> Vec<bool> {
        let mut mask = vec![false; count];
        for &p in self.pages.range(..count) {
            mask[p] = true;
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spanning_extent_marks_both_ends() {
        let mut map = PageMap::with_page_size(128);
        map.add(120, 16);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn long_extent_only_marks_boundaries() {
        let mut map = PageMap::with_page_size(128);
        map.add(0, 128 * 3);
        assert_eq!(map.page_count(), 2);
        assert!(map.is_used(0));
        assert!(!map.is_used(1));
        assert!(map.is_used(2));
    }

    #[test]
    fn empty_extent_is_ignored() {
        let mut map = PageMap::with_page_size(128);
        map.add(500, 0);
        assert_eq!(map.page_count(), 0);
        assert_eq!(map.last(), None);
    }

    #[test]
    fn from_image_uses_fill() {
        let mut image = vec![0xFF; 512];
        image[300] = 0;
        let map = PageMap::from_image(&image, 128, 0xFF);
        assert_eq!(map.mask(4), vec![false, false, true, false]);
    }
}
