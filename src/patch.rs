// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Binary patches for hardware variants and for the flashcart menu.
//!
//! Every patch takes an image by reference and returns a patched copy along
//! with the number of sites it changed. None of them are idempotent, so apply
//! each one to a given image at most once.

use std::fmt;

/// SSD1306 boot command sequence emitted by the Arduboy core. Byte 7 is the
/// contrast value and varies between builds.
const LCD_BOOT_PROGRAM: [u8; 13] = [
    0xD5, 0xF0, 0x8D, 0x14, 0xA1, 0xC8, 0x81, 0xCF, 0xD9, 0xF1, 0xAF, 0x20, 0x00,
];
const LCD_CONTRAST_OFFSET: usize = 7;

pub const CONTRAST_NORMAL: u8 = 0xCF;
pub const CONTRAST_DIM: u8 = 0x7F;
pub const CONTRAST_DIMMER: u8 = 0x2F;
pub const CONTRAST_DIMMEST: u8 = 0x00;
pub const CONTRAST_HIGHEST: u8 = 0xFF;

/// Replacement timer0 ISR: hold UP + DOWN for two seconds to return to the
/// flashcart bootloader menu.
const MENU_BUTTON_ISR: [u8; 148] = [
    0x0f, 0x92, 0x0f, 0xb6, 0x8f, 0x93, 0x9f, 0x93, 0xef, 0x93, 0xff, 0x93, 0x80, 0x91, 0xcc, 0x01,
    0x8d, 0x5f, 0x8d, 0x37, 0x08, 0xf0, 0x8d, 0x57, 0x80, 0x93, 0xcc, 0x01, 0xe2, 0xe4, 0xf3, 0xe0,
    0x80, 0x81, 0x8e, 0x4f, 0x80, 0x83, 0x91, 0x81, 0x9f, 0x4f, 0x91, 0x83, 0x82, 0x81, 0x8f, 0x4f,
    0x82, 0x83, 0x83, 0x81, 0x8f, 0x4f, 0x83, 0x83, 0xed, 0xec, 0xf1, 0xe0, 0x80, 0x81, 0x8f, 0x5f,
    0x80, 0x83, 0x81, 0x81, 0x8f, 0x4f, 0x81, 0x83, 0x82, 0x81, 0x8f, 0x4f, 0x82, 0x83, 0x83, 0x81,
    0x8f, 0x4f, 0x83, 0x83, 0x8f, 0xb1, 0x8f, 0x60, 0x66, 0x99, 0x1c, 0x9b, 0x88, 0x27, 0x8f, 0x36,
    0x81, 0xf4, 0x80, 0x91, 0xFF, 0x0A, 0x98, 0x1b, 0x96, 0x30, 0x68, 0xf0, 0xe0, 0xe0, 0xf8, 0xe0,
    0x87, 0xe7, 0x80, 0x83, 0x81, 0x83, 0x88, 0xe1, 0x80, 0x93, 0x60, 0x00, 0xf0, 0x93, 0x60, 0x00,
    0xff, 0xcf, 0x90, 0x93, 0xFF, 0x0A, 0xff, 0x91, 0xef, 0x91, 0x9f, 0x91, 0x8f, 0x91, 0x0f, 0xbe,
    0x0f, 0x90, 0x18, 0x95,
];
// Operand locations inside MENU_BUTTON_ISR that must point at the sketch's
// own timer variables.
const MBP_FRACT_LDS: usize = 14;
const MBP_FRACT_STS: usize = 26;
const MBP_MILLIS_R30: usize = 28;
const MBP_MILLIS_R31: usize = 30;
const MBP_OVERFLOW_R30: usize = 56;
const MBP_OVERFLOW_R31: usize = 58;

/// A patched copy of an image.
#[derive(Clone, Debug)]
pub struct Patched {
    pub data: Vec<u8>,
    /// Number of places the patch matched. Zero means the patch did not
    /// apply and `data` equals the input.
    pub sites: usize,
}

/// Display-related patch settings.
#[derive(Clone, Copy, Debug, Default)]
pub struct DisplayPatch {
    /// Rewrite the boot sequence for SSD1309 controllers.
    pub ssd1309: bool,
    /// Replace the boot contrast value.
    pub contrast: Option<u8>,
}

impl DisplayPatch {
    pub fn is_noop(&self) -> bool {
        !self.ssd1309 && self.contrast.is_none()
    }
}

/// Finds every LCD boot sequence in `binary` and rewrites it according to
/// `patch`. Works on single sketches and on whole flashcart images.
pub fn patch_display(binary: &[u8], patch: DisplayPatch) -> Patched {
    let mut data = binary.to_vec();
    let mut sites = 0;
    let n = LCD_BOOT_PROGRAM.len();

    let mut i = 0;
    while i + n <= data.len() {
        let candidate = &data[i..i + n];
        if candidate[..LCD_CONTRAST_OFFSET] == LCD_BOOT_PROGRAM[..LCD_CONTRAST_OFFSET]
            && candidate[LCD_CONTRAST_OFFSET + 1..] == LCD_BOOT_PROGRAM[LCD_CONTRAST_OFFSET + 1..]
        {
            if patch.ssd1309 {
                data[i + 2] = 0xE3;
                data[i + 3] = 0xE3;
            }
            if let Some(contrast) = patch.contrast {
                data[i + LCD_CONTRAST_OFFSET] = contrast;
            }
            sites += 1;
            i += n;
        } else {
            i += 1;
        }
    }

    Patched { data, sites }
}

/// Swaps RX/TX LED polarity for Arduino Micro based builds, whose LEDs are
/// wired the other way around from a Leonardo.
pub fn patch_micro_led(binary: &[u8]) -> Patched {
    let mut data = binary.to_vec();
    let mut sites = 0;

    for i in (0..data.len().saturating_sub(4)).step_by(2) {
        match [data[i], data[i + 1], data[i + 2], data[i + 3]] {
            // RXLED1 / TXLED1: cbi -> sbi
            [0x28, 0x98, ..] | [0x5d, 0x98, ..] => data[i + 1] = 0x9a,
            // RXLED0 / TXLED0: sbi -> cbi
            [0x28, 0x9a, ..] | [0x5d, 0x9a, ..] => data[i + 1] = 0x98,
            // core init of the RX LED port
            [0x81, 0xef, 0x85, 0xb9] => data[i] = 0x80,
            // core init of the TX LED port
            [0x84, 0xe2, 0x8b, 0xb9] => data[i + 1] = 0xe0,
            _ => continue,
        }
        sites += 1;
    }

    Patched { data, sites }
}

/// Reasons the menu-button patch declined to touch a program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuPatchError {
    TooShort,
    /// The timer0 ISR calls a subroutine, so it can't be replaced wholesale.
    Subroutine,
    /// The ISR is smaller than the replacement.
    TooSmall(usize),
    /// The ISR doesn't touch the standard Arduino timer variables.
    CustomIsr,
}

impl fmt::Display for MenuPatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooShort => write!(f, "program too short"),
            Self::Subroutine => write!(f, "timer0 ISR contains a subroutine"),
            Self::TooSmall(n) => write!(f, "timer0 ISR too small ({} bytes)", n),
            Self::CustomIsr => write!(f, "custom timer0 ISR in use"),
        }
    }
}

impl std::error::Error for MenuPatchError {}

/// Replaces the timer0 overflow ISR with one that also watches for the
/// return-to-menu button combination.
///
/// The sketch's own ISR is walked instruction by instruction to find its length
/// and the addresses of `timer0_millis`, `timer0_fract` and
/// `timer0_overflow_count`, which the replacement is then pointed at.
pub fn patch_menu_buttons(program: &[u8]) -> Result<Patched, MenuPatchError> {
    if program.len() < 256 {
        return Err(MenuPatchError::TooShort);
    }
    let at = |i: usize| program.get(i).copied().unwrap_or(0);
    let word = |i: usize| u16::from(at(i)) | u16::from(at(i + 1)) << 8;

    // timer0 overflow vector, word address
    let vector = (usize::from(program[0x5E]) << 1) | (usize::from(program[0x5F]) << 9);
    let mut p = vector;
    let mut isr_len: isize = 0;
    let mut branch: isize = 0;
    let mut lds = 0;
    let mut millis = 0u16;
    let mut fract = 0u16;
    let mut overflow = 0u16;

    while p + 2 < program.len() {
        p += 2;
        let (lo, hi) = (program[p - 2], program[p - 1]);
        if (lo, hi) == (0x08, 0x95) {
            // ret
            isr_len = -1;
            break;
        }
        if hi & 0xFC == 0xF4 && lo & 0x07 == 0x00 {
            // brcc, which may jump past the reti
            let offset = (isize::from(hi & 0x03) << 6) + (isize::from(lo & 0xF8) >> 2);
            branch = if offset < 128 {
                p as isize + offset
            } else {
                p as isize - 256 + offset
            };
        }
        if (lo, hi) == (0x18, 0x95) {
            // reti
            isr_len = (p - vector) as isize;
            if p as isize > branch {
                break;
            }
        }
        if isr_len != 0 && hi & 0xF0 == 0xC0 {
            // branched beyond reti, the rjmp back ends the ISR
            isr_len = (p - vector) as isize;
            break;
        }
        if hi & 0xFE == 0x90 && lo & 0x0F == 0x00 {
            // lds, 4 bytes
            lds += 1;
            match lds {
                1 => millis = word(p),
                5 => fract = word(p),
                6 => overflow = word(p),
                _ => (),
            }
            p += 2;
        }
        let (lo, hi) = (at(p - 2), at(p - 1));
        if hi & 0xFE == 0x92 && lo & 0x0F == 0x00 {
            // sts, 4 bytes
            p += 2;
        }
    }

    if isr_len < 0 {
        return Err(MenuPatchError::Subroutine);
    }
    let isr_len = isr_len as usize;
    if isr_len < MENU_BUTTON_ISR.len() {
        return Err(MenuPatchError::TooSmall(isr_len));
    }
    if millis == 0 || fract == 0 || overflow == 0 {
        return Err(MenuPatchError::CustomIsr);
    }

    let mut data = program.to_vec();
    let isr = &mut data[vector..vector + MENU_BUTTON_ISR.len()];
    isr.copy_from_slice(&MENU_BUTTON_ISR);
    let [fract_lo, fract_hi] = fract.to_le_bytes();
    isr[MBP_FRACT_LDS] = fract_lo;
    isr[MBP_FRACT_LDS + 1] = fract_hi;
    isr[MBP_FRACT_STS] = fract_lo;
    isr[MBP_FRACT_STS + 1] = fract_hi;
    // ldi r30/r31 encode their immediate as nibbles
    let ldi = |value: u16, at: &mut [u8]| {
        at[0] = 0xE0 | (value & 0x0F) as u8;
        at[1] = 0xE0 | (value >> 4 & 0x0F) as u8;
        at[2] = 0xF0 | (value >> 8 & 0x0F) as u8;
        at[3] = 0xE0 | (value >> 12 & 0x0F) as u8;
    };
    ldi(millis, &mut isr[MBP_MILLIS_R30..MBP_MILLIS_R31 + 2]);
    ldi(overflow, &mut isr[MBP_OVERFLOW_R30..MBP_OVERFLOW_R31 + 2]);

    Ok(Patched { data, sites: 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_boot_program(contrast: u8) -> Vec<u8> {
        let mut image = vec![0xFF; 64];
        let mut seq = LCD_BOOT_PROGRAM;
        seq[LCD_CONTRAST_OFFSET] = contrast;
        image[10..23].copy_from_slice(&seq);
        image[40..53].copy_from_slice(&LCD_BOOT_PROGRAM);
        image
    }

    #[test]
    fn display_patch_sites() {
        let image = with_boot_program(0x7F);
        let patched = patch_display(&image, DisplayPatch { ssd1309: true, contrast: None });
        assert_eq!(patched.sites, 2);
        assert_eq!(&patched.data[12..14], &[0xE3, 0xE3]);
        assert_eq!(&patched.data[42..44], &[0xE3, 0xE3]);
        assert_eq!(patched.data[17], 0x7F);
        // Input left alone.
        assert_eq!(image[12], 0x8D);
    }

    #[test]
    fn display_patch_contrast() {
        let image = with_boot_program(CONTRAST_NORMAL);
        let patched = patch_display(&image, DisplayPatch {
            ssd1309: false,
            contrast: Some(CONTRAST_DIMMEST),
        });
        assert_eq!(patched.sites, 2);
        assert_eq!(patched.data[17], CONTRAST_DIMMEST);
        assert_eq!(patched.data[12], 0x8D);
    }

    #[test]
    fn display_patch_not_found() {
        let image = vec![0u8; 100];
        let patched = patch_display(&image, DisplayPatch { ssd1309: true, contrast: None });
        assert_eq!(patched.sites, 0);
        assert_eq!(patched.data, image);
    }

    #[test]
    fn double_application_is_detectable() {
        let image = with_boot_program(CONTRAST_NORMAL);
        let once = patch_display(&image, DisplayPatch { ssd1309: true, contrast: None });
        let twice = patch_display(&once.data, DisplayPatch { ssd1309: true, contrast: None });
        // The SSD1309 sequence no longer matches the signature.
        assert_eq!(twice.sites, 0);
    }

    #[test]
    fn micro_led() {
        let mut image = vec![0u8; 32];
        image[0..2].copy_from_slice(&[0x28, 0x98]);
        image[2..4].copy_from_slice(&[0x5d, 0x9a]);
        image[4..8].copy_from_slice(&[0x81, 0xef, 0x85, 0xb9]);
        image[8..12].copy_from_slice(&[0x84, 0xe2, 0x8b, 0xb9]);
        // Odd offsets are not instruction boundaries.
        image[13..15].copy_from_slice(&[0x28, 0x98]);

        let patched = patch_micro_led(&image);
        assert_eq!(patched.sites, 4);
        assert_eq!(&patched.data[0..2], &[0x28, 0x9a]);
        assert_eq!(&patched.data[2..4], &[0x5d, 0x98]);
        assert_eq!(patched.data[4], 0x80);
        assert_eq!(patched.data[9], 0xe0);
        assert_eq!(&patched.data[13..15], &[0x28, 0x98]);
    }

    #[test]
    fn menu_patch_refuses_short_program() {
        assert_eq!(patch_menu_buttons(&[0; 100]).unwrap_err(), MenuPatchError::TooShort);
    }

    #[test]
    fn menu_patch_refuses_subroutine() {
        let mut program = vec![0u8; 512];
        // vector at byte 0x100
        program[0x5E] = 0x80;
        program[0x5F] = 0x00;
        program[0x104..0x106].copy_from_slice(&[0x08, 0x95]);
        assert_eq!(patch_menu_buttons(&program).unwrap_err(), MenuPatchError::Subroutine);
    }

    /// A timer0 ISR at byte 0x100: six lds instructions with distinct
    /// operands, then filler, then `reti` at `reti_at` bytes in.
    fn standard_isr(reti_at: usize) -> (Vec<u8>, usize) {
        let mut program = vec![0u8; 1024];
        program[0x5E] = 0x80;
        program[0x5F] = 0x00;
        let vector = 0x100;
        let mut p = vector;
        for addr in [0x0101u16, 0x0202, 0x0303, 0x0404, 0x0505, 0x0606] {
            program[p..p + 2].copy_from_slice(&[0x00, 0x90]);
            program[p + 2..p + 4].copy_from_slice(&addr.to_le_bytes());
            p += 4;
        }
        let reti = vector + reti_at;
        program[reti..reti + 2].copy_from_slice(&[0x18, 0x95]);
        (program, vector)
    }

    #[test]
    fn menu_isr_size() {
        assert_eq!(MENU_BUTTON_ISR.len(), 148);
        assert_eq!(&MENU_BUTTON_ISR[146..], &[0x18, 0x95]);
    }

    #[test]
    fn menu_patch_refuses_small_isr() {
        let (program, _) = standard_isr(140);
        assert_eq!(patch_menu_buttons(&program).unwrap_err(), MenuPatchError::TooSmall(142));
    }

    #[test]
    fn menu_patch_applies_to_standard_isr() {
        let (program, vector) = standard_isr(MENU_BUTTON_ISR.len());

        let patched = patch_menu_buttons(&program).unwrap();
        assert_eq!(patched.sites, 1);
        let isr = &patched.data[vector..vector + MENU_BUTTON_ISR.len()];
        // fract is the fifth lds
        assert_eq!(&isr[MBP_FRACT_LDS..MBP_FRACT_LDS + 2], &[0x05, 0x05]);
        assert_eq!(&isr[MBP_FRACT_STS..MBP_FRACT_STS + 2], &[0x05, 0x05]);
        // millis is the first, 0x0101
        assert_eq!(&isr[MBP_MILLIS_R30..MBP_MILLIS_R31 + 2], &[0xE1, 0xE0, 0xF1, 0xE0]);
        // overflow count is the sixth, 0x0606
        assert_eq!(&isr[MBP_OVERFLOW_R30..MBP_OVERFLOW_R31 + 2], &[0xE6, 0xE0, 0xF6, 0xE0]);
        assert_eq!(&patched.data[vector + MENU_BUTTON_ISR.len()..], &program[vector + MENU_BUTTON_ISR.len()..]);
    }
}
