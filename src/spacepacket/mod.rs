//! CCSDS space packets (CCSDS 133.0-B).

use std::fmt::{self, Display};
use std::io::Read;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::dataunit::{DataUnit, Field};
use crate::error::{Error, Result};
use crate::timecode::Format;

pub type Apid = u16;

/// Packet is the first packet in a packet group
pub const SEQ_FIRST: u8 = 1;
/// Packet is part of a packet group, but neither first nor last
pub const SEQ_CONTINUATION: u8 = 0;
/// Packet is the last packet in a packet group
pub const SEQ_LAST: u8 = 2;
/// Packet is not part of a packet group, i.e., standalone.
pub const SEQ_UNSEGMENTED: u8 = 3;

const VERSION: Field = Field::bits("version", 0, 3);
const TYPE_FLAG: Field = Field::bits("type", 3, 1);
const HAS_SECONDARY_HEADER: Field = Field::bits("secondary header flag", 4, 1);
const APID: Field = Field::bits("apid", 5, 11);
const SEQUENCE_FLAGS: Field = Field::bits("sequence flags", 16, 2);
const SEQUENCE_COUNT: Field = Field::bits("sequence count", 18, 14);
const LEN_MINUS1: Field = Field::bits("length minus 1", 32, 16);

const FIELDS: [Field; 7] = [
    VERSION,
    TYPE_FLAG,
    HAS_SECONDARY_HEADER,
    APID,
    SEQUENCE_FLAGS,
    SEQUENCE_COUNT,
    LEN_MINUS1,
];

/// Decoded view of the fixed 6-byte primary header.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub version: u8,
    pub type_flag: u8,
    pub has_secondary_header: bool,
    pub apid: Apid,
    /// Defines a packet's grouping. See the `SEQ_*` values.
    pub sequence_flags: u8,
    pub sequence_count: u16,
    pub len_minus1: u16,
}

impl PrimaryHeader {
    /// Size of an encoded ``PrimaryHeader``
    pub const LEN: usize = 6;
    /// Maximum sequence count, after which the count wraps to 0.
    pub const SEQ_MAX: u16 = 16383;

    /// Decode from the first [Self::LEN] bytes of `dat`.
    pub fn decode(dat: &[u8]) -> Result<Self> {
        if dat.len() < Self::LEN {
            return Err(Error::NotEnoughData {
                actual: dat.len(),
                minimum: Self::LEN,
            });
        }
        let unit = DataUnit::from_bytes(&dat[..Self::LEN]);
        Ok(PrimaryHeader {
            version: VERSION.read_uint(&unit)? as u8,
            type_flag: TYPE_FLAG.read_uint(&unit)? as u8,
            has_secondary_header: HAS_SECONDARY_HEADER.read_uint(&unit)? == 1,
            apid: APID.read_uint(&unit)? as Apid,
            sequence_flags: SEQUENCE_FLAGS.read_uint(&unit)? as u8,
            sequence_count: SEQUENCE_COUNT.read_uint(&unit)? as u16,
            len_minus1: LEN_MINUS1.read_uint(&unit)? as u16,
        })
    }
}

/// Parameters for [Packet::build].
#[derive(Debug, Clone, TypedBuilder)]
pub struct PacketParams {
    pub apid: Apid,
    #[builder(default = SEQ_UNSEGMENTED)]
    pub sequence_flags: u8,
    #[builder(default = 0)]
    pub sequence_count: u16,
    #[builder(default = false)]
    pub is_tc: bool,
    /// Append a CRC-16 packet error control trailer.
    #[builder(default = false)]
    pub has_crc: bool,
    /// Timecode secondary header written directly after the primary header.
    #[builder(default, setter(strip_option))]
    pub timecode: Option<(Format, DateTime<Utc>)>,
    #[builder(default)]
    pub user_data: Vec<u8>,
}

/// A single CCSDS space packet: the primary header plus its data field.
///
/// The data field may hold a timecode secondary header and a CRC trailer
/// depending on how the packet was built; see
/// [has_secondary_header](Packet::has_secondary_header).
///
/// # Example
/// ```
/// use spacelink::spacepacket::{Packet, PacketParams};
///
/// let packet = Packet::build(
///     PacketParams::builder()
///         .apid(100)
///         .user_data(vec![0xde, 0xad, 0xbe, 0xef])
///         .build(),
/// )
/// .unwrap();
/// assert_eq!(packet.total_len(), 10);
/// assert!(packet.is_standalone());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    unit: DataUnit,
}

impl Packet {
    /// APID marking an idle packet.
    pub const APID_IDLE: Apid = 0x7ff;
    /// Minimum total packet size: a header and one data byte.
    pub const MIN_LEN: usize = PrimaryHeader::LEN + 1;

    /// Decode a packet occupying exactly all of `dat`.
    pub fn decode(dat: &[u8]) -> Result<Packet> {
        let total = Self::declared_total_len(dat)?;
        if dat.len() != total {
            return Err(Error::Malformed(format!(
                "buffer is {} bytes but the packet declares {total}",
                dat.len()
            )));
        }
        let unit = DataUnit::from_bytes(dat);
        Field::check_all(&FIELDS, &unit)?;
        Ok(Packet { unit })
    }

    /// Total length declared by the primary header at the front of `dat`,
    /// available once [Self::MIN_LEN] bytes are held.
    pub fn declared_total_len(dat: &[u8]) -> Result<usize> {
        if dat.len() < Self::MIN_LEN {
            return Err(Error::NotEnoughData {
                actual: dat.len(),
                minimum: Self::MIN_LEN,
            });
        }
        Ok(PrimaryHeader::LEN + u16::from_be_bytes([dat[4], dat[5]]) as usize + 1)
    }

    /// Construct a packet from [PacketParams].
    ///
    /// The data field length is the sum of the timecode, user data, and CRC
    /// lengths and must be at least 1.
    pub fn build(params: PacketParams) -> Result<Packet> {
        let timecode_len = params.timecode.as_ref().map_or(0, |(f, _)| f.encoded_len());
        let crc_len = if params.has_crc { 2 } else { 0 };
        let data_len = timecode_len + params.user_data.len() + crc_len;
        if data_len == 0 {
            return Err(Error::Malformed(
                "packet data field cannot be empty".to_string(),
            ));
        }
        if data_len > u16::MAX as usize + 1 {
            return Err(Error::Overflow);
        }

        let mut unit = DataUnit::new(PrimaryHeader::LEN + data_len);
        VERSION.write_uint(&mut unit, 0)?;
        TYPE_FLAG.write_uint(&mut unit, u64::from(params.is_tc))?;
        HAS_SECONDARY_HEADER.write_uint(&mut unit, u64::from(params.timecode.is_some()))?;
        APID.write_uint(&mut unit, u64::from(params.apid))?;
        SEQUENCE_FLAGS.write_uint(&mut unit, u64::from(params.sequence_flags))?;
        SEQUENCE_COUNT.write_uint(&mut unit, u64::from(params.sequence_count))?;
        LEN_MINUS1.write_uint(&mut unit, (data_len - 1) as u64)?;

        let mut offset = PrimaryHeader::LEN;
        if let Some((format, time)) = &params.timecode {
            unit.set_time(offset, format, time)?;
            offset += format.encoded_len();
        }
        unit.set_bytes(offset, &params.user_data)?;
        if params.has_crc {
            unit.set_checksum()?;
        }
        Ok(Packet { unit })
    }

    /// Build an idle packet of exactly `total_len` bytes with a zero-filled
    /// data field.
    pub fn idle(total_len: usize, sequence_count: u16) -> Result<Packet> {
        if total_len < Self::MIN_LEN {
            return Err(Error::NotEnoughData {
                actual: total_len,
                minimum: Self::MIN_LEN,
            });
        }
        Packet::build(
            PacketParams::builder()
                .apid(Self::APID_IDLE)
                .sequence_count(sequence_count)
                .user_data(vec![0; total_len - PrimaryHeader::LEN])
                .build(),
        )
    }

    /// Read a single packet.
    pub fn read<R>(mut r: R) -> Result<Packet>
    where
        R: Read + Send,
    {
        let mut buf = vec![0u8; PrimaryHeader::LEN];
        r.read_exact(&mut buf)?;
        let data_len = u16::from_be_bytes([buf[4], buf[5]]) as usize + 1;
        buf.resize(PrimaryHeader::LEN + data_len, 0);
        r.read_exact(&mut buf[PrimaryHeader::LEN..])?;
        Packet::decode(&buf)
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

    /// Whether the type flag marks this as a telecommand packet.
    #[must_use]
    pub fn is_tc(&self) -> bool {
        self.header_field(TYPE_FLAG) == 1
    }

    #[must_use]
    pub fn has_secondary_header(&self) -> bool {
        self.header_field(HAS_SECONDARY_HEADER) == 1
    }

    #[must_use]
    pub fn apid(&self) -> Apid {
        self.header_field(APID) as Apid
    }

    #[must_use]
    pub fn sequence_flags(&self) -> u8 {
        self.header_field(SEQUENCE_FLAGS) as u8
    }

    #[must_use]
    pub fn sequence_count(&self) -> u16 {
        self.header_field(SEQUENCE_COUNT) as u16
    }

    #[must_use]
    pub fn len_minus1(&self) -> u16 {
        self.header_field(LEN_MINUS1) as u16
    }

    /// Total encoded size, header included.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.unit.len()
    }

    /// The packet data field: everything after the primary header,
    /// including any secondary header and CRC trailer.
    #[must_use]
    pub fn user_data(&self) -> &[u8] {
        &self.unit.as_bytes()[PrimaryHeader::LEN..]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.unit.as_bytes()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.unit.into_vec()
    }

    /// Decode the timecode secondary header, which sits directly after the
    /// primary header.
    pub fn timecode(&self, format: &Format) -> Result<DateTime<Utc>> {
        self.unit.get_time(PrimaryHeader::LEN, format)
    }

    /// Verify the CRC trailer against the rest of the packet.
    pub fn check_crc(&self) -> Result<bool> {
        self.unit.check_checksum()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.apid() == Self::APID_IDLE
    }

    #[must_use]
    pub fn is_first(&self) -> bool {
        self.sequence_flags() == SEQ_FIRST
    }

    #[must_use]
    pub fn is_last(&self) -> bool {
        self.sequence_flags() == SEQ_LAST
    }

    #[must_use]
    pub fn is_cont(&self) -> bool {
        self.sequence_flags() == SEQ_CONTINUATION
    }

    #[must_use]
    pub fn is_standalone(&self) -> bool {
        self.sequence_flags() == SEQ_UNSEGMENTED
    }

    /// Snapshot of the primary header fields.
    #[must_use]
    pub fn header(&self) -> PrimaryHeader {
        PrimaryHeader {
            version: self.version(),
            type_flag: u8::from(self.is_tc()),
            has_secondary_header: self.has_secondary_header(),
            apid: self.apid(),
            sequence_flags: self.sequence_flags(),
            sequence_count: self.sequence_count(),
            len_minus1: self.len_minus1(),
        }
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet{{apid: {}, seq: {}, len: {}}}",
            self.apid(),
            self.sequence_count(),
            self.total_len()
        )
    }
}

/// Calculate the number of sequence counts missing between `last` and the
/// packet that followed it with count `cur`, accounting for wrap.
#[must_use]
pub fn missing_packets(cur: u16, last: u16) -> u16 {
    let expected = if last + 1 > PrimaryHeader::SEQ_MAX {
        0
    } else {
        last + 1
    };
    if cur != expected {
        if last + 1 > cur {
            return cur + PrimaryHeader::SEQ_MAX - last;
        }
        return cur - last - 1;
    }
    0
}

pub struct PacketReaderIter<R>
where
    R: Read + Send,
{
    reader: R,
}

impl<R> Iterator for PacketReaderIter<R>
where
    R: Read + Send,
{
    type Item = Result<Packet>;

    fn next(&mut self) -> Option<Self::Item> {
        match Packet::read(&mut self.reader) {
            Ok(packet) => Some(Ok(packet)),
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Read a stream of contiguous packets from `reader`.
///
/// Iteration ends at end of stream, including mid-packet truncation.
///
/// # Example
/// ```
/// use spacelink::spacepacket::read_packets;
///
/// let dat: &[u8] = &[
///     // primary header for apid 100, unsegmented, 4 data bytes
///     0x00, 0x64, 0xc0, 0x01, 0x00, 0x03,
///     // user data
///     0xde, 0xad, 0xbe, 0xef,
/// ];
/// let packets: Vec<_> = read_packets(dat).collect::<Result<_, _>>().unwrap();
/// assert_eq!(packets.len(), 1);
/// assert_eq!(packets[0].apid(), 100);
/// assert_eq!(packets[0].user_data(), &[0xde, 0xad, 0xbe, 0xef]);
/// ```
pub fn read_packets<R>(reader: R) -> impl Iterator<Item = Result<Packet>>
where
    R: Read + Send,
{
    PacketReaderIter { reader }
}
