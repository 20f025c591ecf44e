// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tools for Arduboy sketches, FX flashcarts and game packages.
//!
//! The file formats (`hex`, `cart`, `package`) and the analyses built on them
//! are pure functions over byte buffers. Talking to hardware goes through
//! [`protocol::Session`], which works over any `Read + Write` transport, and
//! [`device`], which finds boards on serial ports and resets them into the
//! bootloader.

pub mod cart;
pub mod device;
pub mod error;
pub mod format;
pub mod hex;
pub mod package;
pub mod page;
pub mod patch;
pub mod protocol;
pub mod sketch;
pub mod title;
pub mod update;

pub use error::{Error, Result};
