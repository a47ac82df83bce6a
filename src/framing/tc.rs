//! TC transfer frames and segmentation (CCSDS 232.0-B).

use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use tracing::trace;
use typed_builder::TypedBuilder;

use super::{Scid, Vcid};
use crate::dataunit::{DataUnit, Field};
use crate::error::{Error, Result};
use crate::spacepacket::{Packet, SEQ_CONTINUATION, SEQ_FIRST, SEQ_LAST, SEQ_UNSEGMENTED};

const VERSION: Field = Field::bits("version", 0, 2);
const BYPASS: Field = Field::bits("bypass flag", 2, 1);
const CONTROL_COMMAND: Field = Field::bits("control command flag", 3, 1);
const SPARE: Field = Field::bits("spare", 4, 2);
const SCID_FIELD: Field = Field::bits("spacecraft id", 6, 10);
const VCID_FIELD: Field = Field::bits("virtual channel id", 16, 6);
const FRAME_LEN_MINUS1: Field = Field::bits("frame length minus 1", 22, 10);
const SEQUENCE: Field = Field::uint("frame sequence number", 4, 1);

const FIELDS: [Field; 8] = [
    VERSION,
    BYPASS,
    CONTROL_COMMAND,
    SPARE,
    SCID_FIELD,
    VCID_FIELD,
    FRAME_LEN_MINUS1,
    SEQUENCE,
];

/// Shape shared by every frame of a TC channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TypedBuilder)]
pub struct TcFrameConfig {
    pub scid: Scid,
    /// Bypass flow control acceptance checks (type-B frame).
    #[builder(default = false)]
    pub bypass: bool,
    /// Frame data holds control information rather than packet data.
    #[builder(default = false)]
    pub control_command: bool,
    /// Whether frames carry a 2-byte frame error control field.
    #[builder(default = true)]
    pub has_fecf: bool,
    /// Upper bound on frame size, at most [TcFrame::MAX_LEN].
    #[builder(default = TcFrame::MAX_LEN)]
    pub max_frame_len: usize,
}

impl TcFrameConfig {
    fn trailer_len(&self) -> usize {
        if self.has_fecf {
            2
        } else {
            0
        }
    }
}

/// Decoded view of the 5-byte TC frame primary header.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct TcFrameHeader {
    pub version: u8,
    pub bypass: bool,
    pub control_command: bool,
    pub scid: Scid,
    pub vcid: Vcid,
    pub frame_len: usize,
    pub sequence: u8,
}

/// A single TC transfer frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcFrame {
    unit: DataUnit,
    config: TcFrameConfig,
}

impl TcFrame {
    /// Size of the fixed primary header.
    pub const HEADER_LEN: usize = 5;
    /// Largest frame the 10-bit length field can describe.
    pub const MAX_LEN: usize = 1024;

    /// Build a frame around `data` for the given virtual channel.
    pub fn build(config: TcFrameConfig, vcid: Vcid, sequence: u8, data: &[u8]) -> Result<TcFrame> {
        if data.is_empty() {
            return Err(Error::Malformed(
                "TC frame data field cannot be empty".to_string(),
            ));
        }
        let total = Self::HEADER_LEN + data.len() + config.trailer_len();
        let limit = config.max_frame_len.min(Self::MAX_LEN);
        if total > limit {
            return Err(Error::Malformed(format!(
                "frame of {total} bytes exceeds the {limit} byte limit"
            )));
        }
        let mut unit = DataUnit::new(total);
        VERSION.write_uint(&mut unit, 0)?;
        BYPASS.write_uint(&mut unit, u64::from(config.bypass))?;
        CONTROL_COMMAND.write_uint(&mut unit, u64::from(config.control_command))?;
        SCID_FIELD.write_uint(&mut unit, u64::from(config.scid))?;
        VCID_FIELD.write_uint(&mut unit, u64::from(vcid))?;
        FRAME_LEN_MINUS1.write_uint(&mut unit, (total - 1) as u64)?;
        SEQUENCE.write_uint(&mut unit, u64::from(sequence))?;
        unit.set_bytes(Self::HEADER_LEN, data)?;
        if config.has_fecf {
            unit.set_checksum()?;
        }
        Ok(TcFrame { unit, config })
    }

    /// Decode a frame from the front of `dat`, which may extend past the
    /// declared frame length with CLTU fill.
    pub fn decode(dat: &[u8], config: TcFrameConfig) -> Result<TcFrame> {
        let declared = Self::declared_len(dat)?;
        let min = Self::HEADER_LEN + config.trailer_len() + 1;
        if declared < min {
            return Err(Error::Malformed(format!(
                "declared frame length {declared} is under the {min} byte minimum"
            )));
        }
        if dat.len() < declared {
            return Err(Error::NotEnoughData {
                actual: dat.len(),
                minimum: declared,
            });
        }
        let unit = DataUnit::from_bytes(&dat[..declared]);
        Field::check_all(&FIELDS, &unit)?;
        let frame = TcFrame { unit, config };
        if config.has_fecf && !frame.unit.check_checksum()? {
            return Err(Error::Integrity("TC frame FECF mismatch".to_string()));
        }
        Ok(frame)
    }

    /// Frame length declared by the header at the front of `dat`.
    pub fn declared_len(dat: &[u8]) -> Result<usize> {
        if dat.len() < Self::HEADER_LEN {
            return Err(Error::NotEnoughData {
                actual: dat.len(),
                minimum: Self::HEADER_LEN,
            });
        }
        Ok((u16::from_be_bytes([dat[2], dat[3]]) & 0x3ff) as usize + 1)
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
    pub fn is_bypass(&self) -> bool {
        self.header_field(BYPASS) == 1
    }

    #[must_use]
    pub fn is_control_command(&self) -> bool {
        self.header_field(CONTROL_COMMAND) == 1
    }

    #[must_use]
    pub fn scid(&self) -> Scid {
        self.header_field(SCID_FIELD) as Scid
    }

    #[must_use]
    pub fn vcid(&self) -> Vcid {
        self.header_field(VCID_FIELD) as Vcid
    }

    /// Total frame length declared in the header.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        self.header_field(FRAME_LEN_MINUS1) as usize + 1
    }

    #[must_use]
    pub fn sequence(&self) -> u8 {
        self.header_field(SEQUENCE) as u8
    }

    /// The frame data field between header and trailer.
    #[must_use]
    pub fn frame_data(&self) -> &[u8] {
        &self.unit.as_bytes()[Self::HEADER_LEN..self.unit.len() - self.config.trailer_len()]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.unit.as_bytes()
    }

    /// Snapshot of the primary header fields.
    #[must_use]
    pub fn header(&self) -> TcFrameHeader {
        TcFrameHeader {
            version: self.version(),
            bypass: self.is_bypass(),
            control_command: self.is_control_command(),
            scid: self.scid(),
            vcid: self.vcid(),
            frame_len: self.frame_len(),
            sequence: self.sequence(),
        }
    }
}

impl Display for TcFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TcFrame{{scid: {}, vcid: {}, seq: {}, len: {}}}",
            self.scid(),
            self.vcid(),
            self.sequence(),
            self.frame_len()
        )
    }
}

/// The 1-byte segment header prefixed to TC frame data on channels that
/// carry segmented packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Position of this segment within its packet, using the `SEQ_*`
    /// values.
    pub sequence_flags: u8,
    /// Multiplexer access point the segment belongs to.
    pub map_id: u8,
}

impl Segment {
    /// Encoded size of a segment header.
    pub const LEN: usize = 1;

    #[must_use]
    pub fn decode(byte: u8) -> Segment {
        Segment {
            sequence_flags: byte >> 6,
            map_id: byte & 0x3f,
        }
    }

    pub fn encode(&self) -> Result<u8> {
        if self.sequence_flags > 3 || self.map_id > 0x3f {
            return Err(Error::Overflow);
        }
        Ok(self.sequence_flags << 6 | self.map_id)
    }
}

/// Configuration for [TcFramer].
#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct TcFramerConfig {
    pub frame: TcFrameConfig,
    /// Multiplexer access point written into segment headers.
    #[builder(default = 0)]
    pub map_id: u8,
    /// Whether packets are wrapped in segment headers and split across
    /// frames as needed.
    #[builder(default = true)]
    pub segmented: bool,
}

/// Packs TC space packets into TC transfer frames.
///
/// On a segmented channel each packet is cut into segments of the frame
/// data capacity, each prefixed with a [Segment] header. On an unsegmented
/// channel each packet must fit a single frame whole. Finished frames go to
/// the sink before `push_tc_packet` returns.
pub struct TcFramer<F>
where
    F: FnMut(TcFrame),
{
    config: TcFramerConfig,
    sequences: HashMap<Vcid, u8>,
    sink: F,
}

impl<F> TcFramer<F>
where
    F: FnMut(TcFrame),
{
    pub fn new(config: TcFramerConfig, sink: F) -> Self {
        TcFramer {
            config,
            sequences: HashMap::new(),
            sink,
        }
    }

    /// Frame `packet` for `vcid`, handing each finished frame to the sink.
    pub fn push_tc_packet(&mut self, vcid: Vcid, packet: &Packet) -> Result<()> {
        let capacity = self.data_capacity();
        if capacity <= Segment::LEN {
            return Err(Error::Malformed(format!(
                "frame limit of {} bytes leaves no packet capacity",
                self.config.frame.max_frame_len
            )));
        }
        let dat = packet.as_bytes();

        if !self.config.segmented {
            if dat.len() > capacity {
                return Err(Error::Malformed(format!(
                    "{} byte packet exceeds the {capacity} byte capacity of an unsegmented frame",
                    dat.len()
                )));
            }
            let sequence = self.next_sequence(vcid);
            let frame = TcFrame::build(self.config.frame, vcid, sequence, dat)?;
            trace!(vcid, sequence, "framed unsegmented packet");
            (self.sink)(frame);
            return Ok(());
        }

        let chunks: Vec<&[u8]> = dat.chunks(capacity - Segment::LEN).collect();
        let n = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            let sequence_flags = if n == 1 {
                SEQ_UNSEGMENTED
            } else if i == 0 {
                SEQ_FIRST
            } else if i == n - 1 {
                SEQ_LAST
            } else {
                SEQ_CONTINUATION
            };
            let segment = Segment {
                sequence_flags,
                map_id: self.config.map_id,
            };
            let mut data = Vec::with_capacity(Segment::LEN + chunk.len());
            data.push(segment.encode()?);
            data.extend_from_slice(chunk);
            let sequence = self.next_sequence(vcid);
            let frame = TcFrame::build(self.config.frame, vcid, sequence, &data)?;
            trace!(vcid, sequence, flags = sequence_flags, "framed packet segment");
            (self.sink)(frame);
        }
        Ok(())
    }

    fn data_capacity(&self) -> usize {
        self.config
            .frame
            .max_frame_len
            .min(TcFrame::MAX_LEN)
            .saturating_sub(TcFrame::HEADER_LEN + self.config.frame.trailer_len())
    }

    fn next_sequence(&mut self, vcid: Vcid) -> u8 {
        let seq = self.sequences.entry(vcid).or_insert(0);
        let current = *seq;
        *seq = seq.wrapping_add(1);
        current
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::spacepacket::PacketParams;

    fn config() -> TcFrameConfig {
        TcFrameConfig::builder().scid(0x2a).build()
    }

    #[test]
    fn build_and_decode() {
        let frame = TcFrame::build(config(), 9, 42, &[1, 2, 3, 4]).unwrap();
        assert_eq!(frame.as_bytes().len(), 5 + 4 + 2);

        let decoded = TcFrame::decode(frame.as_bytes(), config()).unwrap();
        assert_eq!(decoded.version(), 0);
        assert!(!decoded.is_bypass());
        assert!(!decoded.is_control_command());
        assert_eq!(decoded.scid(), 0x2a);
        assert_eq!(decoded.vcid(), 9);
        assert_eq!(decoded.sequence(), 42);
        assert_eq!(decoded.frame_len(), 11);
        assert_eq!(decoded.frame_data(), &[1, 2, 3, 4]);
        assert_eq!(decoded.header(), frame.header());
    }

    #[test]
    fn decode_trims_fill() {
        let frame = TcFrame::build(config(), 1, 0, &[0xca, 0xfe]).unwrap();
        let mut dat = frame.as_bytes().to_vec();
        dat.extend_from_slice(&[0x55; 5]);

        let decoded = TcFrame::decode(&dat, config()).unwrap();
        assert_eq!(decoded.as_bytes().len(), frame.as_bytes().len());
        assert_eq!(decoded.frame_data(), &[0xca, 0xfe]);
    }

    #[test]
    fn decode_rejects_truncation() {
        let frame = TcFrame::build(config(), 1, 0, &[0xca, 0xfe, 0xba, 0xbe]).unwrap();
        let err = TcFrame::decode(&frame.as_bytes()[..7], config()).unwrap_err();
        assert!(matches!(err, Error::NotEnoughData { .. }), "{err}");
    }

    #[test]
    fn decode_rejects_corrupt_fecf() {
        let frame = TcFrame::build(config(), 1, 0, &[0xca, 0xfe]).unwrap();
        let mut dat = frame.as_bytes().to_vec();
        dat[6] ^= 0x01;
        let err = TcFrame::decode(&dat, config()).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)), "{err}");
    }

    #[test]
    fn build_rejects_bad_vcid() {
        let err = TcFrame::build(config(), 64, 0, &[1]).unwrap_err();
        assert!(matches!(err, Error::Overflow), "{err}");
    }

    #[test]
    fn build_rejects_oversized_frame() {
        let dat = vec![0u8; TcFrame::MAX_LEN];
        let err = TcFrame::build(config(), 1, 0, &dat).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");
    }

    #[test]
    fn segment_round_trip() {
        let segment = Segment {
            sequence_flags: SEQ_LAST,
            map_id: 0x15,
        };
        assert_eq!(Segment::decode(segment.encode().unwrap()), segment);
        assert!(matches!(
            Segment {
                sequence_flags: 4,
                map_id: 0
            }
            .encode(),
            Err(Error::Overflow)
        ));
    }

    fn framer_config(max_frame_len: usize, segmented: bool) -> TcFramerConfig {
        let frame = TcFrameConfig::builder()
            .scid(0x2a)
            .has_fecf(false)
            .max_frame_len(max_frame_len)
            .build();
        TcFramerConfig::builder()
            .frame(frame)
            .map_id(5)
            .segmented(segmented)
            .build()
    }

    #[test]
    fn framer_segments_large_packet() {
        let packet = Packet::build(
            PacketParams::builder()
                .apid(77)
                .user_data((0u8..19).collect())
                .build(),
        )
        .unwrap();
        assert_eq!(packet.total_len(), 25);

        let mut frames = Vec::new();
        let mut framer = TcFramer::new(framer_config(16, true), |f| frames.push(f));
        framer.push_tc_packet(3, &packet).unwrap();

        // capacity 11, segment payload 10: 25 bytes in 3 segments
        assert_eq!(frames.len(), 3);
        let mut reassembled = Vec::new();
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence(), i as u8);
            let data = frame.frame_data();
            let segment = Segment::decode(data[0]);
            assert_eq!(segment.map_id, 5);
            reassembled.extend_from_slice(&data[1..]);
        }
        assert_eq!(Segment::decode(frames[0].frame_data()[0]).sequence_flags, SEQ_FIRST);
        assert_eq!(Segment::decode(frames[1].frame_data()[0]).sequence_flags, SEQ_CONTINUATION);
        assert_eq!(Segment::decode(frames[2].frame_data()[0]).sequence_flags, SEQ_LAST);
        assert_eq!(reassembled, packet.as_bytes());
    }

    #[test]
    fn framer_single_segment() {
        let packet = Packet::build(
            PacketParams::builder().apid(77).user_data(vec![9]).build(),
        )
        .unwrap();

        let mut frames = Vec::new();
        let mut framer = TcFramer::new(framer_config(16, true), |f| frames.push(f));
        framer.push_tc_packet(3, &packet).unwrap();

        assert_eq!(frames.len(), 1);
        let data = frames[0].frame_data();
        assert_eq!(Segment::decode(data[0]).sequence_flags, SEQ_UNSEGMENTED);
        assert_eq!(&data[1..], packet.as_bytes());
    }

    #[test]
    fn framer_unsegmented_channel() {
        let packet = Packet::build(
            PacketParams::builder()
                .apid(77)
                .user_data(vec![1, 2, 3])
                .build(),
        )
        .unwrap();

        // a RefCell sink so frames can be checked before the reject case
        let frames = RefCell::new(Vec::new());
        let mut framer =
            TcFramer::new(framer_config(32, false), |f| frames.borrow_mut().push(f));
        framer.push_tc_packet(1, &packet).unwrap();
        assert_eq!(frames.borrow().len(), 1);
        assert_eq!(frames.borrow()[0].frame_data(), packet.as_bytes());

        let big = Packet::build(
            PacketParams::builder()
                .apid(77)
                .user_data(vec![0; 40])
                .build(),
        )
        .unwrap();
        let err = framer.push_tc_packet(1, &big).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");
    }
}
