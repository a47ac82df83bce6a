//! Channel coding: CRC-16, the BCH(63,56) block code, and CLTU framing.

mod bch;
mod cltu;
mod crc16;

pub use bch::*;
pub use cltu::*;
pub use crc16::*;
