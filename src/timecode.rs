//! CCSDS timecode formats (CCSDS 301.0-B).
//!
//! Supports the Day Segmented (CDS) and Unsegmented (CUC) timecodes against
//! the CCSDS epoch 1958-01-01T00:00:00Z. Timecodes are treated as UTC with
//! no leap second handling.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seconds from the CCSDS epoch 1958-01-01 to the Unix epoch 1970-01-01.
pub const CCSDS_UNIX_DELTA_SECS: i64 = 378_691_200;

/// Timecode layout, not including any preamble field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    /// Day Segmented: days from the CCSDS epoch, milliseconds of day, and
    /// an optional microsecond-of-millisecond field.
    Cds { num_day: usize, num_submillis: usize },
    /// Unsegmented: seconds from the CCSDS epoch with a binary fraction.
    Cuc { num_coarse: usize, num_fine: usize },
}

/// CDS with a 16-bit day and millisecond resolution.
pub const CDS1: Format = Format::Cds {
    num_day: 2,
    num_submillis: 0,
};
/// CDS with a 16-bit day and microsecond resolution.
pub const CDS2: Format = Format::Cds {
    num_day: 2,
    num_submillis: 2,
};
/// CUC with 32-bit seconds and no fraction.
pub const CUC0: Format = Format::Cuc {
    num_coarse: 4,
    num_fine: 0,
};
/// CUC with 32-bit seconds and a 1-byte fraction.
pub const CUC1: Format = Format::Cuc {
    num_coarse: 4,
    num_fine: 1,
};
/// CUC with 32-bit seconds and a 2-byte fraction.
pub const CUC2: Format = Format::Cuc {
    num_coarse: 4,
    num_fine: 2,
};
/// CUC with 32-bit seconds and a 3-byte fraction.
pub const CUC3: Format = Format::Cuc {
    num_coarse: 4,
    num_fine: 3,
};
/// CUC with 32-bit seconds and a 4-byte fraction.
pub const CUC4: Format = Format::Cuc {
    num_coarse: 4,
    num_fine: 4,
};

impl Format {
    /// Encoded size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match *self {
            Format::Cds {
                num_day,
                num_submillis,
            } => num_day + 4 + num_submillis,
            Format::Cuc {
                num_coarse,
                num_fine,
            } => num_coarse + num_fine,
        }
    }
}

/// Decode a timecode of the given format from the front of `dat`.
pub fn decode(format: &Format, dat: &[u8]) -> Result<DateTime<Utc>> {
    validate(format)?;
    let want = format.encoded_len();
    if dat.len() < want {
        return Err(Error::NotEnoughData {
            actual: dat.len(),
            minimum: want,
        });
    }
    match *format {
        Format::Cds {
            num_day,
            num_submillis,
        } => decode_cds(num_day, num_submillis, dat),
        Format::Cuc {
            num_coarse,
            num_fine,
        } => decode_cuc(num_coarse, num_fine, dat),
    }
}

/// Encode `time` in the given format.
///
/// Fails with [Error::Overflow] for times before the CCSDS epoch or past
/// what the format's day or seconds field can count.
pub fn encode(format: &Format, time: &DateTime<Utc>) -> Result<Vec<u8>> {
    validate(format)?;
    match *format {
        Format::Cds {
            num_day,
            num_submillis,
        } => encode_cds(num_day, num_submillis, time),
        Format::Cuc {
            num_coarse,
            num_fine,
        } => encode_cuc(num_coarse, num_fine, time),
    }
}

fn validate(format: &Format) -> Result<()> {
    match *format {
        Format::Cds {
            num_day,
            num_submillis,
        } => {
            if num_day != 2 && num_day != 3 {
                return Err(Error::TimecodeConfig(format!(
                    "CDS day field must be 2 or 3 bytes, got {num_day}"
                )));
            }
            if num_submillis != 0 && num_submillis != 2 {
                return Err(Error::TimecodeConfig(format!(
                    "CDS submillisecond field must be 0 or 2 bytes, got {num_submillis}"
                )));
            }
        }
        Format::Cuc {
            num_coarse,
            num_fine,
        } => {
            if !(1..=4).contains(&num_coarse) {
                return Err(Error::TimecodeConfig(format!(
                    "CUC coarse field must be 1 to 4 bytes, got {num_coarse}"
                )));
            }
            if num_fine > 4 {
                return Err(Error::TimecodeConfig(format!(
                    "CUC fine field must be 0 to 4 bytes, got {num_fine}"
                )));
            }
        }
    }
    Ok(())
}

fn decode_cds(num_day: usize, num_submillis: usize, dat: &[u8]) -> Result<DateTime<Utc>> {
    let days = be_uint(&dat[..num_day]) as i64;
    let millis = be_uint(&dat[num_day..num_day + 4]) as i64;
    let submillis = be_uint(&dat[num_day + 4..num_day + 4 + num_submillis]) as i64;
    // the 2-byte submillisecond field counts microseconds of millisecond
    let micros =
        days * 86_400_000_000 + millis * 1000 + submillis - CCSDS_UNIX_DELTA_SECS * 1_000_000;
    timestamp_from_micros(micros)
}

fn decode_cuc(num_coarse: usize, num_fine: usize, dat: &[u8]) -> Result<DateTime<Utc>> {
    let coarse = be_uint(&dat[..num_coarse]);
    let fine = be_uint(&dat[num_coarse..num_coarse + num_fine]);
    let secs = coarse as i64 - CCSDS_UNIX_DELTA_SECS;
    let nanos = ((fine * 1_000_000_000) >> (8 * num_fine as u32)) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or(Error::Overflow)
}

fn encode_cds(num_day: usize, num_submillis: usize, time: &DateTime<Utc>) -> Result<Vec<u8>> {
    let micros = time
        .timestamp_micros()
        .checked_add(CCSDS_UNIX_DELTA_SECS * 1_000_000)
        .ok_or(Error::Overflow)?;
    if micros < 0 {
        return Err(Error::Overflow);
    }
    let days = micros / 86_400_000_000;
    let micros_of_day = micros % 86_400_000_000;
    if days >> (8 * num_day as u32) != 0 {
        return Err(Error::Overflow);
    }
    let mut out = Vec::with_capacity(num_day + 4 + num_submillis);
    put_be_uint(&mut out, days as u64, num_day);
    put_be_uint(&mut out, (micros_of_day / 1000) as u64, 4);
    if num_submillis == 2 {
        put_be_uint(&mut out, (micros_of_day % 1000) as u64, 2);
    }
    Ok(out)
}

fn encode_cuc(num_coarse: usize, num_fine: usize, time: &DateTime<Utc>) -> Result<Vec<u8>> {
    let secs = time
        .timestamp()
        .checked_add(CCSDS_UNIX_DELTA_SECS)
        .ok_or(Error::Overflow)?;
    if secs < 0 || secs >> (8 * num_coarse as u32) != 0 {
        return Err(Error::Overflow);
    }
    // chrono represents a leap second as subsecond nanos >= 1e9
    let nanos = u64::from(time.timestamp_subsec_nanos().min(999_999_999));
    let fine = (nanos << (8 * num_fine as u32)) / 1_000_000_000;
    let mut out = Vec::with_capacity(num_coarse + num_fine);
    put_be_uint(&mut out, secs as u64, num_coarse);
    put_be_uint(&mut out, fine, num_fine);
    Ok(out)
}

fn timestamp_from_micros(micros: i64) -> Result<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = micros.rem_euclid(1_000_000) as u32 * 1000;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or(Error::Overflow)
}

fn be_uint(dat: &[u8]) -> u64 {
    dat.iter().fold(0, |acc, &b| acc << 8 | u64::from(b))
}

fn put_be_uint(out: &mut Vec<u8>, value: u64, len: usize) {
    for i in (0..len).rev() {
        out.push((value >> (i * 8)) as u8);
    }
}
