//! Addressable big-endian binary buffers.
//!
//! [DataUnit] is the backing store for every frame and packet type in this
//! crate. It owns a byte buffer and provides typed accessors addressed by bit
//! or byte offset, all big-endian per CCSDS convention. [Field] pairs an
//! accessor with a fixed location so a layout can be declared as constants
//! and validated against a buffer up front.

mod field;

pub use field::*;

use std::fmt;

use chrono::{DateTime, Utc};
use pretty_hex::pretty_hex;

use crate::coding::crc16;
use crate::error::{Error, Result};
use crate::timecode::{self, Format};

/// An owned byte buffer with typed big-endian accessors.
///
/// Out of range or otherwise impossible accesses fail with
/// [Error::OutOfRange], [Error::InvalidWidth], or [Error::Overflow] rather
/// than panicking, so callers can treat arbitrary input bytes as a unit and
/// probe them safely.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataUnit {
    data: Vec<u8>,
}

impl DataUnit {
    /// Create a zero-filled unit of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        DataUnit { data: vec![0; len] }
    }

    #[must_use]
    pub fn from_bytes(dat: &[u8]) -> Self {
        DataUnit { data: dat.to_vec() }
    }

    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        DataUnit { data }
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Grow or shrink to `len` bytes, zero-filling any new tail.
    pub fn set_len(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    pub fn append(&mut self, dat: &[u8]) {
        self.data.extend_from_slice(dat);
    }

    fn span(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(Error::OutOfRange {
                offset,
                len,
                available: self.data.len(),
            }),
        }
    }

    /// Read `width` bits starting at absolute bit offset `bit`.
    ///
    /// The addressed window must lie within 8 consecutive bytes, i.e.,
    /// `bit % 8 + width <= 64`.
    ///
    /// # Example
    /// ```
    /// use spacelink::dataunit::DataUnit;
    ///
    /// let unit = DataUnit::from_bytes(&[0x1a, 0xcf, 0xfc, 0x1d]);
    /// assert_eq!(unit.get_bits(0, 2).unwrap(), 0);
    /// assert_eq!(unit.get_bits(2, 10).unwrap(), 0x1ac);
    /// ```
    pub fn get_bits(&self, bit: usize, width: usize) -> Result<u64> {
        let (start, nbytes, shift, mask) = self.bit_window(bit, width)?;
        let mut word: u64 = 0;
        for &byte in &self.data[start..start + nbytes] {
            word = word << 8 | u64::from(byte);
        }
        Ok(word >> shift & mask)
    }

    /// Write `value` into the `width` bits starting at absolute bit offset
    /// `bit`, leaving surrounding bits untouched.
    pub fn set_bits(&mut self, bit: usize, width: usize, value: u64) -> Result<()> {
        let (start, nbytes, shift, mask) = self.bit_window(bit, width)?;
        if value & !mask != 0 {
            return Err(Error::Overflow);
        }
        let mut word: u64 = 0;
        for &byte in &self.data[start..start + nbytes] {
            word = word << 8 | u64::from(byte);
        }
        word &= !(mask << shift);
        word |= value << shift;
        for i in 0..nbytes {
            self.data[start + i] = (word >> ((nbytes - 1 - i) * 8)) as u8;
        }
        Ok(())
    }

    fn bit_window(&self, bit: usize, width: usize) -> Result<(usize, usize, usize, u64)> {
        if width == 0 || width > 64 {
            return Err(Error::InvalidWidth(format!(
                "bit width must be 1..=64, got {width}"
            )));
        }
        let skew = bit % 8;
        if skew + width > 64 {
            return Err(Error::InvalidWidth(format!(
                "bit field at offset {bit} of width {width} spans more than 8 bytes"
            )));
        }
        let start = bit / 8;
        let nbytes = (skew + width + 7) / 8;
        self.span(start, nbytes)?;
        let shift = nbytes * 8 - (skew + width);
        let mask = if width == 64 { u64::MAX } else { (1 << width) - 1 };
        Ok((start, nbytes, shift, mask))
    }

    /// Read a byte-aligned big-endian unsigned integer of 1 to 8 bytes.
    pub fn get_unsigned(&self, offset: usize, len: usize) -> Result<u64> {
        check_numeric_len(len)?;
        self.span(offset, len)?;
        let mut value: u64 = 0;
        for &byte in &self.data[offset..offset + len] {
            value = value << 8 | u64::from(byte);
        }
        Ok(value)
    }

    /// Write a byte-aligned big-endian unsigned integer of 1 to 8 bytes.
    pub fn set_unsigned(&mut self, offset: usize, len: usize, value: u64) -> Result<()> {
        check_numeric_len(len)?;
        self.span(offset, len)?;
        if len < 8 && value >> (len * 8) != 0 {
            return Err(Error::Overflow);
        }
        for i in 0..len {
            self.data[offset + i] = (value >> ((len - 1 - i) * 8)) as u8;
        }
        Ok(())
    }

    /// Read a byte-aligned big-endian two's complement integer of 1 to 8
    /// bytes.
    pub fn get_signed(&self, offset: usize, len: usize) -> Result<i64> {
        let raw = self.get_unsigned(offset, len)?;
        let shift = 64 - len as u32 * 8;
        Ok(((raw << shift) as i64) >> shift)
    }

    /// Write a byte-aligned big-endian two's complement integer of 1 to 8
    /// bytes.
    pub fn set_signed(&mut self, offset: usize, len: usize, value: i64) -> Result<()> {
        check_numeric_len(len)?;
        self.span(offset, len)?;
        if len < 8 {
            let bits = len as u32 * 8;
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            if value < min || value > max {
                return Err(Error::Overflow);
            }
        }
        for i in 0..len {
            self.data[offset + i] = ((value as u64) >> ((len - 1 - i) * 8)) as u8;
        }
        Ok(())
    }

    /// Read an IEEE-754 float, 4 or 8 bytes, widened to `f64`.
    pub fn get_float(&self, offset: usize, len: usize) -> Result<f64> {
        match len {
            4 => Ok(f64::from(f32::from_bits(
                self.get_unsigned(offset, 4)? as u32
            ))),
            8 => Ok(f64::from_bits(self.get_unsigned(offset, 8)?)),
            _ => Err(Error::InvalidWidth(format!(
                "float field length must be 4 or 8, got {len}"
            ))),
        }
    }

    /// Write an IEEE-754 float as 4 or 8 bytes, narrowing to `f32` for
    /// 4-byte fields.
    pub fn set_float(&mut self, offset: usize, len: usize, value: f64) -> Result<()> {
        match len {
            4 => self.set_unsigned(offset, 4, u64::from((value as f32).to_bits())),
            8 => self.set_unsigned(offset, 8, value.to_bits()),
            _ => Err(Error::InvalidWidth(format!(
                "float field length must be 4 or 8, got {len}"
            ))),
        }
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.span(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn set_bytes(&mut self, offset: usize, dat: &[u8]) -> Result<()> {
        self.span(offset, dat.len())?;
        self.data[offset..offset + dat.len()].copy_from_slice(dat);
        Ok(())
    }

    /// Read a fixed-width ASCII field, dropping trailing NUL and space
    /// padding.
    pub fn get_string(&self, offset: usize, len: usize) -> Result<String> {
        let raw = self.get_bytes(offset, len)?;
        if !raw.is_ascii() {
            return Err(Error::Malformed(format!(
                "non-ASCII bytes in string field at offset {offset}"
            )));
        }
        let trimmed = raw
            .iter()
            .rposition(|&b| b != 0 && b != b' ')
            .map_or(&raw[..0], |last| &raw[..=last]);
        Ok(String::from_utf8_lossy(trimmed).into_owned())
    }

    /// Write an ASCII string into a fixed-width field, padding with NULs.
    pub fn set_string(&mut self, offset: usize, len: usize, value: &str) -> Result<()> {
        if !value.is_ascii() {
            return Err(Error::Malformed("non-ASCII string value".to_string()));
        }
        if value.len() > len {
            return Err(Error::Overflow);
        }
        self.span(offset, len)?;
        let mut fixed = vec![0u8; len];
        fixed[..value.len()].copy_from_slice(value.as_bytes());
        self.set_bytes(offset, &fixed)
    }

    /// Decode a CCSDS timecode of the given format at `offset`.
    pub fn get_time(&self, offset: usize, format: &Format) -> Result<DateTime<Utc>> {
        let raw = self.get_bytes(offset, format.encoded_len())?;
        timecode::decode(format, raw)
    }

    /// Encode `time` in the given timecode format at `offset`.
    pub fn set_time(&mut self, offset: usize, format: &Format, time: &DateTime<Utc>) -> Result<()> {
        let encoded = timecode::encode(format, time)?;
        self.set_bytes(offset, &encoded)
    }

    /// Compute the CRC-16 over all but the last 2 bytes and store it
    /// big-endian in those 2 bytes.
    pub fn set_checksum(&mut self) -> Result<()> {
        let n = self.data.len();
        if n < 3 {
            return Err(Error::NotEnoughData {
                actual: n,
                minimum: 3,
            });
        }
        let crc = crc16(&self.data[..n - 2]);
        self.data[n - 2..].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Verify the trailing CRC-16, returning whether it matches.
    pub fn check_checksum(&self) -> Result<bool> {
        let n = self.data.len();
        if n < 3 {
            return Err(Error::NotEnoughData {
                actual: n,
                minimum: 3,
            });
        }
        let expected = u16::from_be_bytes([self.data[n - 2], self.data[n - 1]]);
        Ok(crc16(&self.data[..n - 2]) == expected)
    }
}

fn check_numeric_len(len: usize) -> Result<()> {
    if len == 0 || len > 8 {
        return Err(Error::InvalidWidth(format!(
            "numeric field length must be 1..=8, got {len}"
        )));
    }
    Ok(())
}

impl fmt::Display for DataUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", pretty_hex(&self.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_cross_byte_boundary() {
        let mut unit = DataUnit::new(4);
        unit.set_bits(5, 13, 0x155a).unwrap();
        assert_eq!(unit.get_bits(5, 13).unwrap(), 0x155a);
        // neighbors untouched
        assert_eq!(unit.get_bits(0, 5).unwrap(), 0);
        assert_eq!(unit.get_bits(18, 14).unwrap(), 0);
    }

    #[test]
    fn bits_full_width() {
        let mut unit = DataUnit::new(8);
        unit.set_bits(0, 64, u64::MAX).unwrap();
        assert_eq!(unit.get_bits(0, 64).unwrap(), u64::MAX);
    }

    #[test]
    fn bits_window_too_wide() {
        let unit = DataUnit::new(16);
        let err = unit.get_bits(4, 64).unwrap_err();
        assert!(matches!(err, Error::InvalidWidth(_)), "{err}");
    }

    #[test]
    fn bits_out_of_range() {
        let unit = DataUnit::new(2);
        let err = unit.get_bits(10, 8).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { .. }), "{err}");
    }

    #[test]
    fn bits_value_overflow() {
        let mut unit = DataUnit::new(2);
        let err = unit.set_bits(0, 3, 8).unwrap_err();
        assert!(matches!(err, Error::Overflow), "{err}");
    }

    #[test]
    fn unsigned_round_trip() {
        let mut unit = DataUnit::new(8);
        unit.set_unsigned(1, 3, 0x01_02_03).unwrap();
        assert_eq!(unit.get_unsigned(1, 3).unwrap(), 0x01_02_03);
        assert_eq!(unit.as_bytes(), &[0, 1, 2, 3, 0, 0, 0, 0]);
        assert!(matches!(
            unit.set_unsigned(0, 2, 0x1_0000),
            Err(Error::Overflow)
        ));
    }

    #[test]
    fn signed_round_trip() {
        let mut unit = DataUnit::new(4);
        unit.set_signed(0, 2, -2).unwrap();
        assert_eq!(unit.get_signed(0, 2).unwrap(), -2);
        assert_eq!(unit.as_bytes()[..2], [0xff, 0xfe]);
        assert!(matches!(
            unit.set_signed(0, 1, 128),
            Err(Error::Overflow)
        ));
        assert!(matches!(
            unit.set_signed(0, 1, -129),
            Err(Error::Overflow)
        ));
    }

    #[test]
    fn float_round_trip() {
        let mut unit = DataUnit::new(12);
        unit.set_float(0, 4, 1.5).unwrap();
        unit.set_float(4, 8, -0.25).unwrap();
        assert_eq!(unit.get_float(0, 4).unwrap(), 1.5);
        assert_eq!(unit.get_float(4, 8).unwrap(), -0.25);
        assert!(matches!(
            unit.get_float(0, 6),
            Err(Error::InvalidWidth(_))
        ));
    }

    #[test]
    fn string_round_trip() {
        let mut unit = DataUnit::new(8);
        unit.set_string(0, 8, "abc").unwrap();
        assert_eq!(unit.get_string(0, 8).unwrap(), "abc");
        assert_eq!(&unit.as_bytes()[3..], &[0, 0, 0, 0, 0]);

        assert!(matches!(
            unit.set_string(0, 2, "abc"),
            Err(Error::Overflow)
        ));
        assert!(matches!(
            unit.set_string(0, 8, "\u{e9}"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn string_trims_space_padding() {
        let unit = DataUnit::from_bytes(b"hi      ");
        assert_eq!(unit.get_string(0, 8).unwrap(), "hi");
    }

    #[test]
    fn checksum_round_trip() {
        let mut unit = DataUnit::from_bytes(b"123456789\0\0");
        unit.set_checksum().unwrap();
        // CRC-16/IBM-3740 check value
        assert_eq!(&unit.as_bytes()[9..], &[0x29, 0xb1]);
        assert!(unit.check_checksum().unwrap());

        let mut corrupt = unit.clone();
        corrupt.set_unsigned(0, 1, 0xff).unwrap();
        assert!(!corrupt.check_checksum().unwrap());

        let short = DataUnit::new(2);
        assert!(matches!(
            short.check_checksum(),
            Err(Error::NotEnoughData { .. })
        ));
    }

    #[test]
    fn time_round_trip() {
        use chrono::TimeZone;

        let time = Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 1).unwrap();
        let mut unit = DataUnit::new(10);
        unit.set_time(1, &timecode::CDS2, &time).unwrap();
        assert_eq!(unit.get_time(1, &timecode::CDS2).unwrap(), time);
    }

    #[test]
    fn resize_zero_fills() {
        let mut unit = DataUnit::from_bytes(&[1, 2]);
        unit.set_len(4);
        assert_eq!(unit.as_bytes(), &[1, 2, 0, 0]);
        unit.append(&[9]);
        assert_eq!(unit.len(), 5);
    }
}
