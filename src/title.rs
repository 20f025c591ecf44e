// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Title screen codec.
//!
//! Flashcart slots store their title screen as a raw 1024-byte bitmap in the
//! display's native layout: 8 horizontal bands of 128 bytes, each byte a
//! vertical strip of 8 pixels with the least significant bit on top.
//! Packages and the catalog carry the same screens as PNG.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat};

use crate::error::{Error, Result};
use crate::format::{SCREEN_HEIGHT, SCREEN_WIDTH, TITLE_IMAGE_LENGTH};

/// Expands a raw title screen into one byte per pixel, 0 or 255, row-major.
pub fn raw_to_pixels(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() != TITLE_IMAGE_LENGTH {
        return Err(Error::image(format!(
            "title image is {} bytes, expected {}",
            raw.len(),
            TITLE_IMAGE_LENGTH,
        )));
    }
    let mut pixels = vec![0u8; SCREEN_WIDTH * SCREEN_HEIGHT];
    for (i, &byte) in raw.iter().enumerate() {
        let x = i % SCREEN_WIDTH;
        let band = i / SCREEN_WIDTH;
        for bit in 0..8 {
            if byte >> bit & 1 != 0 {
                pixels[(band * 8 + bit) * SCREEN_WIDTH + x] = 255;
            }
        }
    }
    Ok(pixels)
}

/// Packs row-major pixels (any nonzero value is lit) into a raw title screen.
pub fn pixels_to_raw(pixels: &[u8]) -> Result<Vec<u8>> {
    if pixels.len() != SCREEN_WIDTH * SCREEN_HEIGHT {
        return Err(Error::image(format!(
            "{} pixels can't be a {}x{} screen",
            pixels.len(),
            SCREEN_WIDTH,
            SCREEN_HEIGHT,
        )));
    }
    let mut raw = vec![0u8; TITLE_IMAGE_LENGTH];
    for (i, out) in raw.iter_mut().enumerate() {
        let x = i % SCREEN_WIDTH;
        let band = i / SCREEN_WIDTH;
        for bit in 0..8 {
            if pixels[(band * 8 + bit) * SCREEN_WIDTH + x] != 0 {
                *out |= 1 << bit;
            }
        }
    }
    Ok(raw)
}

/// Encodes a raw title screen as a grayscale PNG.
pub fn raw_to_png(raw: &[u8]) -> Result<Vec<u8>> {
    let pixels = raw_to_pixels(raw)?;
    let gray = GrayImage::from_raw(SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32, pixels)
        .ok_or_else(|| Error::image("pixel buffer does not match screen size"))?;
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(gray)
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| Error::image(format!("can't encode PNG: {}", e)))?;
    Ok(out.into_inner())
}

/// Decodes any image the `image` crate understands into a raw title screen.
///
/// Images of the wrong size are stretched with nearest-neighbor sampling.
/// Pixels are lit when they are bright and opaque; no dithering is done, so
/// photographs will not convert nicely.
pub fn image_to_raw(bytes: &[u8]) -> Result<Vec<u8>> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| Error::image(format!("can't decode image: {}", e)))?;
    let (w, h) = (SCREEN_WIDTH as u32, SCREEN_HEIGHT as u32);
    let img = if img.width() != w || img.height() != h {
        img.resize_exact(w, h, FilterType::Nearest)
    } else {
        img
    };
    let pixels: Vec<u8> = img
        .to_luma_alpha8()
        .pixels()
        .map(|p| if p.0[0] >= 128 && p.0[1] >= 128 { 255 } else { 0 })
        .collect();
    pixels_to_raw(&pixels)
}

/// An all-black title screen.
pub fn blank() -> Vec<u8> {
    vec![0u8; TITLE_IMAGE_LENGTH]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkerboard() -> Vec<u8> {
        (0..TITLE_IMAGE_LENGTH).map(|i| if i % 2 == 0 { 0xAA } else { 0x0F }).collect()
    }

    #[test]
    fn layout() {
        let mut raw = blank();
        // Second band, column 3, bit 2 -> pixel (3, 10).
        raw[SCREEN_WIDTH + 3] = 0b100;
        let pixels = raw_to_pixels(&raw).unwrap();
        let lit: Vec<usize> = pixels.iter().enumerate()
            .filter(|(_, &p)| p != 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(lit, vec![10 * SCREEN_WIDTH + 3]);
        assert_eq!(pixels_to_raw(&pixels).unwrap(), raw);
    }

    #[test]
    fn png_round_trip() {
        let raw = checkerboard();
        let png = raw_to_png(&raw).unwrap();
        assert_eq!(&png[1..4], b"PNG");
        assert_eq!(image_to_raw(&png).unwrap(), raw);
    }

    #[test]
    fn oversized_image_is_scaled() {
        let big = GrayImage::from_pixel(256, 128, image::Luma([255u8]));
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(big).write_to(&mut png, ImageFormat::Png).unwrap();
        let raw = image_to_raw(png.get_ref()).unwrap();
        assert!(raw.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn wrong_sizes() {
        assert!(raw_to_pixels(&[0; 10]).is_err());
        assert!(pixels_to_raw(&[0; 10]).is_err());
        assert!(image_to_raw(b"not an image").is_err());
    }
}
