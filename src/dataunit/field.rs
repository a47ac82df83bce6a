use chrono::{DateTime, Utc};

use super::DataUnit;
use crate::error::{Error, Result};
use crate::timecode::Format;

/// Location and type of a single field within a [DataUnit].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldSpec {
    /// Arbitrary bit span addressed by absolute bit offset.
    Bits { bit: usize, width: usize },
    /// Byte-aligned big-endian unsigned integer.
    Uint { offset: usize, len: usize },
    /// Byte-aligned big-endian two's complement integer.
    Int { offset: usize, len: usize },
    /// IEEE-754 float of 4 or 8 bytes.
    Float { offset: usize, len: usize },
    /// Raw byte span.
    Bytes { offset: usize, len: usize },
    /// Fixed-width padded ASCII.
    Ascii { offset: usize, len: usize },
    /// CCSDS timecode.
    Time { offset: usize, format: Format },
}

/// A named [FieldSpec], declarable as a `const` so a whole layout can live
/// next to the type that owns it.
///
/// # Example
/// ```
/// use spacelink::dataunit::{DataUnit, Field};
///
/// const VERSION: Field = Field::bits("version", 0, 3);
/// const APID: Field = Field::bits("apid", 5, 11);
///
/// let unit = DataUnit::from_bytes(&[0x08, 0x64, 0xc0, 0x00, 0x00, 0x01]);
/// Field::check_all(&[VERSION, APID], &unit).unwrap();
/// assert_eq!(APID.read_uint(&unit).unwrap(), 100);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub spec: FieldSpec,
}

impl Field {
    #[must_use]
    pub const fn bits(name: &'static str, bit: usize, width: usize) -> Self {
        Field {
            name,
            spec: FieldSpec::Bits { bit, width },
        }
    }

    #[must_use]
    pub const fn uint(name: &'static str, offset: usize, len: usize) -> Self {
        Field {
            name,
            spec: FieldSpec::Uint { offset, len },
        }
    }

    #[must_use]
    pub const fn int(name: &'static str, offset: usize, len: usize) -> Self {
        Field {
            name,
            spec: FieldSpec::Int { offset, len },
        }
    }

    #[must_use]
    pub const fn float(name: &'static str, offset: usize, len: usize) -> Self {
        Field {
            name,
            spec: FieldSpec::Float { offset, len },
        }
    }

    #[must_use]
    pub const fn bytes(name: &'static str, offset: usize, len: usize) -> Self {
        Field {
            name,
            spec: FieldSpec::Bytes { offset, len },
        }
    }

    #[must_use]
    pub const fn ascii(name: &'static str, offset: usize, len: usize) -> Self {
        Field {
            name,
            spec: FieldSpec::Ascii { offset, len },
        }
    }

    #[must_use]
    pub const fn time(name: &'static str, offset: usize, format: Format) -> Self {
        Field {
            name,
            spec: FieldSpec::Time { offset, format },
        }
    }

    pub fn read_uint(&self, unit: &DataUnit) -> Result<u64> {
        match self.spec {
            FieldSpec::Bits { bit, width } => unit.get_bits(bit, width),
            FieldSpec::Uint { offset, len } => unit.get_unsigned(offset, len),
            _ => Err(self.type_error("an unsigned integer")),
        }
    }

    pub fn write_uint(&self, unit: &mut DataUnit, value: u64) -> Result<()> {
        match self.spec {
            FieldSpec::Bits { bit, width } => unit.set_bits(bit, width, value),
            FieldSpec::Uint { offset, len } => unit.set_unsigned(offset, len, value),
            _ => Err(self.type_error("an unsigned integer")),
        }
    }

    pub fn read_int(&self, unit: &DataUnit) -> Result<i64> {
        match self.spec {
            FieldSpec::Int { offset, len } => unit.get_signed(offset, len),
            _ => Err(self.type_error("a signed integer")),
        }
    }

    pub fn write_int(&self, unit: &mut DataUnit, value: i64) -> Result<()> {
        match self.spec {
            FieldSpec::Int { offset, len } => unit.set_signed(offset, len, value),
            _ => Err(self.type_error("a signed integer")),
        }
    }

    pub fn read_float(&self, unit: &DataUnit) -> Result<f64> {
        match self.spec {
            FieldSpec::Float { offset, len } => unit.get_float(offset, len),
            _ => Err(self.type_error("a float")),
        }
    }

    pub fn write_float(&self, unit: &mut DataUnit, value: f64) -> Result<()> {
        match self.spec {
            FieldSpec::Float { offset, len } => unit.set_float(offset, len, value),
            _ => Err(self.type_error("a float")),
        }
    }

    pub fn read_bytes<'a>(&self, unit: &'a DataUnit) -> Result<&'a [u8]> {
        match self.spec {
            FieldSpec::Bytes { offset, len } => unit.get_bytes(offset, len),
            _ => Err(self.type_error("raw bytes")),
        }
    }

    pub fn write_bytes(&self, unit: &mut DataUnit, dat: &[u8]) -> Result<()> {
        match self.spec {
            FieldSpec::Bytes { offset, len } => {
                if dat.len() != len {
                    return Err(Error::InvalidWidth(format!(
                        "field {} takes {len} bytes, got {}",
                        self.name,
                        dat.len()
                    )));
                }
                unit.set_bytes(offset, dat)
            }
            _ => Err(self.type_error("raw bytes")),
        }
    }

    pub fn read_ascii(&self, unit: &DataUnit) -> Result<String> {
        match self.spec {
            FieldSpec::Ascii { offset, len } => unit.get_string(offset, len),
            _ => Err(self.type_error("an ASCII string")),
        }
    }

    pub fn write_ascii(&self, unit: &mut DataUnit, value: &str) -> Result<()> {
        match self.spec {
            FieldSpec::Ascii { offset, len } => unit.set_string(offset, len, value),
            _ => Err(self.type_error("an ASCII string")),
        }
    }

    pub fn read_time(&self, unit: &DataUnit) -> Result<DateTime<Utc>> {
        match self.spec {
            FieldSpec::Time { offset, format } => unit.get_time(offset, &format),
            _ => Err(self.type_error("a timecode")),
        }
    }

    pub fn write_time(&self, unit: &mut DataUnit, time: &DateTime<Utc>) -> Result<()> {
        match self.spec {
            FieldSpec::Time { offset, format } => unit.set_time(offset, &format, time),
            _ => Err(self.type_error("a timecode")),
        }
    }

    fn type_error(&self, wanted: &str) -> Error {
        Error::InvalidWidth(format!("field {} is not {wanted}", self.name))
    }

    /// Check that this field lies within `unit`.
    pub fn check(&self, unit: &DataUnit) -> Result<()> {
        match self.spec {
            FieldSpec::Bits { bit, width } => unit.get_bits(bit, width).map(|_| ()),
            FieldSpec::Uint { offset, len } => unit.get_unsigned(offset, len).map(|_| ()),
            FieldSpec::Int { offset, len } => unit.get_signed(offset, len).map(|_| ()),
            FieldSpec::Float { offset, len } => unit.get_float(offset, len).map(|_| ()),
            FieldSpec::Bytes { offset, len } | FieldSpec::Ascii { offset, len } => {
                unit.get_bytes(offset, len).map(|_| ())
            }
            FieldSpec::Time { offset, format } => {
                unit.get_bytes(offset, format.encoded_len()).map(|_| ())
            }
        }
    }

    /// Check an entire layout against `unit`, failing on the first field
    /// that does not fit.
    pub fn check_all(fields: &[Field], unit: &DataUnit) -> Result<()> {
        for field in fields {
            field.check(unit)?;
        }
        Ok(())
    }
}
