//! TM transfer frames (CCSDS 132.0-B).

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{Scid, Vcid};
use crate::dataunit::{DataUnit, Field};
use crate::error::{Error, Result};
use crate::spacepacket::Packet;

const VERSION: Field = Field::bits("version", 0, 2);
const SCID_FIELD: Field = Field::bits("spacecraft id", 2, 10);
const VCID_FIELD: Field = Field::bits("virtual channel id", 12, 3);
const HAS_OCF: Field = Field::bits("ocf flag", 15, 1);
const MASTER_CHANNEL_COUNT: Field = Field::uint("master channel frame count", 2, 1);
const VIRTUAL_CHANNEL_COUNT: Field = Field::uint("virtual channel frame count", 3, 1);
const HAS_SECONDARY_HEADER: Field = Field::bits("secondary header flag", 32, 1);
const SYNC_FLAG: Field = Field::bits("synchronization flag", 33, 1);
const ORDER_FLAG: Field = Field::bits("packet order flag", 34, 1);
const SEGMENT_LENGTH_ID: Field = Field::bits("segment length id", 35, 2);
const FIRST_HEADER_POINTER: Field = Field::bits("first header pointer", 37, 11);

const FIELDS: [Field; 11] = [
    VERSION,
    SCID_FIELD,
    VCID_FIELD,
    HAS_OCF,
    MASTER_CHANNEL_COUNT,
    VIRTUAL_CHANNEL_COUNT,
    HAS_SECONDARY_HEADER,
    SYNC_FLAG,
    ORDER_FLAG,
    SEGMENT_LENGTH_ID,
    FIRST_HEADER_POINTER,
];

/// Shape shared by every frame of a TM physical channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TypedBuilder)]
pub struct TmFrameConfig {
    /// Total frame length on the wire, trailer included.
    #[builder(default = 1115)]
    pub frame_len: usize,
    /// Whether frames carry a 2-byte frame error control field.
    #[builder(default = true)]
    pub has_fecf: bool,
}

impl Default for TmFrameConfig {
    fn default() -> Self {
        TmFrameConfig::builder().build()
    }
}

impl TmFrameConfig {
    fn trailer_len(&self) -> usize {
        if self.has_fecf {
            2
        } else {
            0
        }
    }

    /// Bytes of packet data each frame carries.
    #[must_use]
    pub fn data_capacity(&self) -> usize {
        self.frame_len
            .saturating_sub(TmFrame::HEADER_LEN + self.trailer_len())
    }
}

/// Decoded view of the 6-byte TM frame primary header.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct TmFrameHeader {
    pub version: u8,
    pub scid: Scid,
    pub vcid: Vcid,
    pub has_ocf: bool,
    pub master_channel_count: u8,
    pub virtual_channel_count: u8,
    pub has_secondary_header: bool,
    pub sync_flag: bool,
    pub order_flag: bool,
    pub segment_length_id: u8,
    pub first_header_pointer: u16,
}

/// The three-way split of a frame data field at packet boundaries.
#[derive(Debug, Default)]
pub struct PacketSlices<'a> {
    /// Continuation of a packet begun in an earlier frame.
    pub leading: &'a [u8],
    /// Packets wholly contained in this frame.
    pub complete: Vec<&'a [u8]>,
    /// Start of a packet finished in a later frame.
    pub trailing: &'a [u8],
}

/// A single TM transfer frame.
///
/// # Example
/// ```
/// use spacelink::framing::{TmFrame, TmFrameConfig};
///
/// let config = TmFrameConfig::builder().frame_len(64).build();
/// let mut frame = TmFrame::new(config).unwrap();
/// frame.set_scid(157).unwrap();
/// frame.set_vcid(3).unwrap();
/// frame.set_checksum().unwrap();
/// assert_eq!(frame.as_bytes().len(), 64);
/// assert!(frame.check_checksum().unwrap());
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TmFrame {
    unit: DataUnit,
    config: TmFrameConfig,
}

impl TmFrame {
    /// Size of the fixed primary header.
    pub const HEADER_LEN: usize = 6;
    /// First header pointer value meaning no packet starts in this frame.
    pub const FHP_NO_FIRST_HEADER: u16 = 0x7ff;
    /// First header pointer value marking an idle frame.
    pub const FHP_IDLE: u16 = 0x7fe;

    /// Create a zeroed frame of the configured length with the segment
    /// length id preset to its mandatory value of 0b11.
    pub fn new(config: TmFrameConfig) -> Result<TmFrame> {
        let min = Self::HEADER_LEN + config.trailer_len() + 1;
        if config.frame_len < min {
            return Err(Error::Malformed(format!(
                "frame length {} leaves no data field, need at least {min}",
                config.frame_len
            )));
        }
        let mut unit = DataUnit::new(config.frame_len);
        SEGMENT_LENGTH_ID.write_uint(&mut unit, 0b11)?;
        Ok(TmFrame { unit, config })
    }

    /// Decode a frame of exactly `config.frame_len` bytes.
    pub fn decode(dat: &[u8], config: TmFrameConfig) -> Result<TmFrame> {
        if dat.len() < config.frame_len {
            return Err(Error::NotEnoughData {
                actual: dat.len(),
                minimum: config.frame_len,
            });
        }
        if dat.len() > config.frame_len {
            return Err(Error::Malformed(format!(
                "got {} bytes for a {} byte frame",
                dat.len(),
                config.frame_len
            )));
        }
        let unit = DataUnit::from_bytes(dat);
        Field::check_all(&FIELDS, &unit)?;
        Ok(TmFrame { unit, config })
    }

    fn header_field(&self, field: Field) -> u64 {
        field
            .read_uint(&self.unit)
            .expect("header fields verified at construction")
    }

    #[must_use]
    pub fn version(&self) -> u8 {
        self.header_field(VERSION) as u8
    }

    #[must_use]
    pub fn scid(&self) -> Scid {
        self.header_field(SCID_FIELD) as Scid
    }

    #[must_use]
    pub fn vcid(&self) -> Vcid {
        self.header_field(VCID_FIELD) as Vcid
    }

    #[must_use]
    pub fn has_ocf(&self) -> bool {
        self.header_field(HAS_OCF) == 1
    }

    #[must_use]
    pub fn master_channel_count(&self) -> u8 {
        self.header_field(MASTER_CHANNEL_COUNT) as u8
    }

    #[must_use]
    pub fn virtual_channel_count(&self) -> u8 {
        self.header_field(VIRTUAL_CHANNEL_COUNT) as u8
    }

    #[must_use]
    pub fn has_secondary_header(&self) -> bool {
        self.header_field(HAS_SECONDARY_HEADER) == 1
    }

    #[must_use]
    pub fn sync_flag(&self) -> bool {
        self.header_field(SYNC_FLAG) == 1
    }

    #[must_use]
    pub fn order_flag(&self) -> bool {
        self.header_field(ORDER_FLAG) == 1
    }

    #[must_use]
    pub fn segment_length_id(&self) -> u8 {
        self.header_field(SEGMENT_LENGTH_ID) as u8
    }

    #[must_use]
    pub fn first_header_pointer(&self) -> u16 {
        self.header_field(FIRST_HEADER_POINTER) as u16
    }

    /// Whether the first header pointer marks this as an idle frame.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.first_header_pointer() == Self::FHP_IDLE
    }

    pub fn set_scid(&mut self, scid: Scid) -> Result<()> {
        SCID_FIELD.write_uint(&mut self.unit, u64::from(scid))
    }

    /// Set the virtual channel id, 0 through 7.
    pub fn set_vcid(&mut self, vcid: Vcid) -> Result<()> {
        VCID_FIELD.write_uint(&mut self.unit, u64::from(vcid))
    }

    pub fn set_master_channel_count(&mut self, count: u8) -> Result<()> {
        MASTER_CHANNEL_COUNT.write_uint(&mut self.unit, u64::from(count))
    }

    pub fn set_virtual_channel_count(&mut self, count: u8) -> Result<()> {
        VIRTUAL_CHANNEL_COUNT.write_uint(&mut self.unit, u64::from(count))
    }

    pub fn set_first_header_pointer(&mut self, fhp: u16) -> Result<()> {
        FIRST_HEADER_POINTER.write_uint(&mut self.unit, u64::from(fhp))
    }

    /// The frame data field between header and trailer.
    #[must_use]
    pub fn data_field(&self) -> &[u8] {
        &self.unit.as_bytes()[Self::HEADER_LEN..self.config.frame_len - self.config.trailer_len()]
    }

    /// Write packet bytes at `offset` within the data field.
    pub fn write_data(&mut self, offset: usize, dat: &[u8]) -> Result<()> {
        match offset.checked_add(dat.len()) {
            Some(end) if end <= self.config.data_capacity() => {
                self.unit.set_bytes(Self::HEADER_LEN + offset, dat)
            }
            _ => Err(Error::OutOfRange {
                offset,
                len: dat.len(),
                available: self.config.data_capacity(),
            }),
        }
    }

    /// Compute and store the FECF. A no-op for channels configured without
    /// one.
    pub fn set_checksum(&mut self) -> Result<()> {
        if self.config.has_fecf {
            self.unit.set_checksum()?;
        }
        Ok(())
    }

    /// Verify the FECF. Always true for channels configured without one.
    pub fn check_checksum(&self) -> Result<bool> {
        if self.config.has_fecf {
            self.unit.check_checksum()
        } else {
            Ok(true)
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.unit.as_bytes()
    }

    #[must_use]
    pub fn config(&self) -> TmFrameConfig {
        self.config
    }

    /// Snapshot of the primary header fields.
    #[must_use]
    pub fn header(&self) -> TmFrameHeader {
        TmFrameHeader {
            version: self.version(),
            scid: self.scid(),
            vcid: self.vcid(),
            has_ocf: self.has_ocf(),
            master_channel_count: self.master_channel_count(),
            virtual_channel_count: self.virtual_channel_count(),
            has_secondary_header: self.has_secondary_header(),
            sync_flag: self.sync_flag(),
            order_flag: self.order_flag(),
            segment_length_id: self.segment_length_id(),
            first_header_pointer: self.first_header_pointer(),
        }
    }

    /// Split the data field at packet boundaries using the first header
    /// pointer.
    ///
    /// For idle frames and frames continuing a single packet the whole
    /// data field comes back as `leading`.
    pub fn packet_slices(&self) -> Result<PacketSlices<'_>> {
        let data = self.data_field();
        let fhp = self.first_header_pointer();
        if fhp == Self::FHP_NO_FIRST_HEADER || fhp == Self::FHP_IDLE {
            return Ok(PacketSlices {
                leading: data,
                ..PacketSlices::default()
            });
        }
        let first = fhp as usize;
        if first >= data.len() {
            return Err(Error::Malformed(format!(
                "first header pointer {first} points past the {} byte data field",
                data.len()
            )));
        }
        let (leading, mut rest) = data.split_at(first);
        let mut complete = Vec::new();
        loop {
            match Packet::declared_total_len(rest) {
                Ok(total) if rest.len() >= total => {
                    let (packet, tail) = rest.split_at(total);
                    complete.push(packet);
                    rest = tail;
                }
                _ => break,
            }
        }
        Ok(PacketSlices {
            leading,
            complete,
            trailing: rest,
        })
    }
}

impl Display for TmFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TmFrame{{scid: {}, vcid: {}, mc: {}, vc: {}, fhp: {:#05x}}}",
            self.scid(),
            self.vcid(),
            self.master_channel_count(),
            self.virtual_channel_count(),
            self.first_header_pointer()
        )
    }
}

/// Number of frames missing between a frame with counter `last` and the
/// frame that followed it with counter `cur`.
///
/// An unchanged counter reads as a full wrap of 255 missing frames.
#[must_use]
pub fn missing_frames(cur: u8, last: u8) -> u8 {
    cur.wrapping_sub(last).wrapping_sub(1)
}
