//! Recovers space packets from a TM transfer frame stream.

use std::collections::HashMap;
use std::fmt::{self, Display};

use serde::Serialize;
use tracing::{trace, warn};
use typed_builder::TypedBuilder;

use super::{missing_frames, Scid, TmFrame, TmFrameConfig, Vcid};
use crate::error::{Error, Result};
use crate::spacepacket::Packet;

/// Configuration for [Packetizer].
#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct PacketizerConfig {
    #[builder(default)]
    pub frame: TmFrameConfig,
    /// Deliver idle packets to the sink instead of dropping them.
    #[builder(default = false)]
    pub deliver_idle: bool,
}

/// A packet recovered from the frame stream and where it came from.
#[derive(Debug, Clone)]
pub struct ExtractedPacket {
    pub scid: Scid,
    pub vcid: Vcid,
    pub packet: Packet,
}

/// A carry left unfinished at end of stream: the head of a packet whose
/// remainder never arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TruncatedTail {
    pub vcid: Vcid,
    /// Bytes buffered when the stream ended.
    pub buffered: usize,
    /// Total length the packet declared, once enough of it had arrived.
    pub declared: Option<usize>,
}

/// Counters over everything a [Packetizer] has seen.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PacketizerStats {
    pub frames: u64,
    pub idle_frames: u64,
    /// Packets delivered to the sink.
    pub packets: u64,
    /// Idle packets seen, whether delivered or dropped.
    pub idle_packets: u64,
    /// Frames lost to virtual channel counter gaps.
    pub missing_frames: u64,
    pub checksum_failures: u64,
    /// Carried fragments dropped after packet boundaries went
    /// inconsistent.
    pub resyncs: u64,
}

#[derive(Debug, Default)]
struct VcTracker {
    vcid: Vcid,
    /// Bytes of the packet in flight. Always begins at a packet start.
    carry: Vec<u8>,
    /// The carried packet's declared total length, once its header is
    /// whole.
    declared: Option<usize>,
    /// Whether packet boundaries are currently known for this channel.
    sync: bool,
    last_count: Option<u8>,
}

impl VcTracker {
    fn new(vcid: Vcid) -> Self {
        VcTracker {
            vcid,
            ..VcTracker::default()
        }
    }

    /// Forget the carry and boundary knowledge, keeping the frame counter.
    fn reset(&mut self) {
        self.carry.clear();
        self.declared = None;
        self.sync = false;
    }
}

impl Display for VcTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VcTracker{{vcid: {}, carry: {}, declared: {:?}, sync: {}}}",
            self.vcid,
            self.carry.len(),
            self.declared,
            self.sync
        )
    }
}

/// Recovers space packets from TM transfer frames, per virtual channel.
///
/// Frames are accepted in downlink order. Each frame's data field is split
/// at packet boundaries using the first header pointer: bytes continuing
/// the packet in flight extend the channel's carry, whole packets are
/// delivered directly, and a packet left open at frame end becomes the new
/// carry. Every completed packet goes to the sink before
/// [push_tm_frame](Self::push_tm_frame) returns.
///
/// Frames failing the FECF and frames skipped over a counter gap drop the
/// packet in flight; extraction resumes at the next frame that starts a
/// packet. A carry that disagrees with the boundaries a frame declares is
/// dropped, never delivered.
pub struct Packetizer<F>
where
    F: FnMut(ExtractedPacket),
{
    config: PacketizerConfig,
    channels: HashMap<Vcid, VcTracker>,
    stats: PacketizerStats,
    sink: F,
}

impl<F> Packetizer<F>
where
    F: FnMut(ExtractedPacket),
{
    pub fn new(config: PacketizerConfig, sink: F) -> Self {
        Packetizer {
            config,
            channels: HashMap::new(),
            stats: PacketizerStats::default(),
            sink,
        }
    }

    /// Counters over everything pushed so far.
    #[must_use]
    pub fn stats(&self) -> PacketizerStats {
        self.stats
    }

    /// Feed one frame, delivering every packet it completes.
    pub fn push_tm_frame(&mut self, frame: &TmFrame) -> Result<()> {
        self.stats.frames += 1;
        let vcid = frame.vcid();
        let mut tracker = self
            .channels
            .remove(&vcid)
            .unwrap_or_else(|| VcTracker::new(vcid));
        let result = self.process(&mut tracker, frame);
        self.channels.insert(vcid, tracker);
        result
    }

    /// Report and clear carries left unfinished at end of stream, in vcid
    /// order.
    pub fn finish(&mut self) -> Vec<TruncatedTail> {
        let mut tails: Vec<TruncatedTail> = self
            .channels
            .values_mut()
            .filter(|tracker| !tracker.carry.is_empty())
            .map(|tracker| {
                let tail = TruncatedTail {
                    vcid: tracker.vcid,
                    buffered: tracker.carry.len(),
                    declared: tracker.declared,
                };
                tracker.reset();
                tail
            })
            .collect();
        tails.sort_unstable_by_key(|tail| tail.vcid);
        tails
    }

    fn process(&mut self, tracker: &mut VcTracker, frame: &TmFrame) -> Result<()> {
        if !frame.check_checksum()? {
            self.stats.checksum_failures += 1;
            warn!(vcid = tracker.vcid, "dropping frame with FECF mismatch");
            tracker.reset();
            return Err(Error::Integrity("TM frame FECF mismatch".to_string()));
        }

        let count = frame.virtual_channel_count();
        if let Some(last) = tracker.last_count {
            let missing = missing_frames(count, last);
            if missing > 0 {
                self.stats.missing_frames += u64::from(missing);
                warn!(
                    vcid = tracker.vcid,
                    missing, "frame counter gap, dropping carry"
                );
                tracker.reset();
            }
        }
        tracker.last_count = Some(count);

        if frame.is_idle() {
            self.stats.idle_frames += 1;
            trace!(vcid = tracker.vcid, "idle frame");
            return Ok(());
        }

        let slices = match frame.packet_slices() {
            Ok(slices) => slices,
            Err(err) => {
                warn!(vcid = tracker.vcid, "dropping frame: {err}");
                tracker.reset();
                return Err(err);
            }
        };
        let has_first_header = frame.first_header_pointer() != TmFrame::FHP_NO_FIRST_HEADER;

        self.take_leading(tracker, frame, slices.leading, has_first_header);

        for dat in &slices.complete {
            let packet = Packet::decode(dat).expect("complete slices hold whole packets");
            self.deliver(frame, packet);
        }

        if !slices.trailing.is_empty() {
            tracker.carry = slices.trailing.to_vec();
            tracker.declared = Packet::declared_total_len(&tracker.carry).ok();
        }
        if has_first_header {
            tracker.sync = true;
        }
        Ok(())
    }

    /// Fold the frame's leading fragment into the carry, delivering the
    /// packet in flight if this completes it.
    fn take_leading(
        &mut self,
        tracker: &mut VcTracker,
        frame: &TmFrame,
        leading: &[u8],
        has_first_header: bool,
    ) {
        if leading.is_empty() {
            if has_first_header && !tracker.carry.is_empty() {
                self.drop_carry(tracker, "packet cut short at a frame boundary");
            }
            return;
        }
        if !tracker.sync {
            trace!(
                vcid = tracker.vcid,
                bytes = leading.len(),
                "not synchronized, dropping leading fragment"
            );
            return;
        }
        if tracker.carry.is_empty() {
            self.drop_carry(tracker, "continuation bytes with no packet in flight");
            return;
        }
        tracker.carry.extend_from_slice(leading);
        if tracker.declared.is_none() {
            tracker.declared = Packet::declared_total_len(&tracker.carry).ok();
        }
        match tracker.declared {
            Some(declared) if tracker.carry.len() == declared => {
                let packet = Packet::decode(&tracker.carry).expect("carry holds a whole packet");
                tracker.carry.clear();
                tracker.declared = None;
                self.deliver(frame, packet);
            }
            Some(declared) if tracker.carry.len() > declared => {
                self.drop_carry(tracker, "carry overran the declared packet length");
                if !has_first_header {
                    tracker.sync = false;
                }
            }
            _ => {
                // still short of the declared length, which only adds up
                // when the whole field continues the packet
                if has_first_header {
                    self.drop_carry(tracker, "packet cut short at a frame boundary");
                }
            }
        }
    }

    fn drop_carry(&mut self, tracker: &mut VcTracker, why: &str) {
        self.stats.resyncs += 1;
        warn!(vcid = tracker.vcid, tracker = %tracker, "{why}, dropping carried bytes");
        tracker.carry.clear();
        tracker.declared = None;
    }

    fn deliver(&mut self, frame: &TmFrame, packet: Packet) {
        if packet.is_idle() {
            self.stats.idle_packets += 1;
            if !self.config.deliver_idle {
                trace!(vcid = frame.vcid(), "dropping idle packet");
                return;
            }
        }
        self.stats.packets += 1;
        trace!(vcid = frame.vcid(), packet = %packet, "delivering packet");
        (self.sink)(ExtractedPacket {
            scid: frame.scid(),
            vcid: frame.vcid(),
            packet,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Assembler, AssemblerConfig};
    use crate::spacepacket::PacketParams;

    fn frame_config(frame_len: usize) -> TmFrameConfig {
        TmFrameConfig::builder()
            .frame_len(frame_len)
            .has_fecf(false)
            .build()
    }

    fn packet(apid: u16, len: usize) -> Packet {
        Packet::build(
            PacketParams::builder()
                .apid(apid)
                .user_data((0..len - Packet::MIN_LEN + 1).map(|i| i as u8).collect())
                .build(),
        )
        .unwrap()
    }

    fn assemble(config: TmFrameConfig, packets: &[(Vcid, Packet)]) -> Vec<TmFrame> {
        let mut frames = Vec::new();
        let mut assembler = Assembler::new(
            AssemblerConfig::builder().scid(157).frame(config).build(),
            |frame| frames.push(frame),
        );
        for (vcid, packet) in packets {
            assembler.push_tm_packet(*vcid, packet).unwrap();
        }
        assembler.flush_all().unwrap();
        frames
    }

    /// A vcid-1 frame with hand-picked header fields and data, for
    /// boundary declarations no assembler would produce.
    fn raw_frame(config: TmFrameConfig, count: u8, fhp: u16, dat: &[u8]) -> TmFrame {
        let mut frame = TmFrame::new(config).unwrap();
        frame.set_scid(157).unwrap();
        frame.set_vcid(1).unwrap();
        frame.set_virtual_channel_count(count).unwrap();
        frame.set_first_header_pointer(fhp).unwrap();
        frame.write_data(0, dat).unwrap();
        frame
    }

    #[test]
    fn packets_across_frames() {
        let config = frame_config(16);
        let sent = vec![(1, packet(100, 14)), (1, packet(101, 8))];
        let frames = assemble(config, &sent);

        let mut got = Vec::new();
        let mut packetizer = Packetizer::new(
            PacketizerConfig::builder().frame(config).build(),
            |extracted| got.push(extracted),
        );
        for frame in &frames {
            packetizer.push_tm_frame(frame).unwrap();
        }
        let stats = packetizer.stats();

        assert_eq!(got.len(), 2);
        assert_eq!(got[0].scid, 157);
        assert_eq!(got[0].vcid, 1);
        assert_eq!(got[0].packet, sent[0].1);
        assert_eq!(got[1].packet, sent[1].1);

        assert_eq!(stats.frames, frames.len() as u64);
        assert_eq!(stats.packets, 2);
        assert!(stats.idle_packets >= 1);
        assert_eq!(stats.resyncs, 0);
    }

    #[test]
    fn no_first_header_extends_carry() {
        // a 24-byte packet spans three 10-byte data fields, the middle
        // frame carrying no packet start
        let config = frame_config(16);
        let sent = packet(100, 24);
        let frames = assemble(config, &[(1, sent.clone())]);
        assert_eq!(
            frames[1].first_header_pointer(),
            TmFrame::FHP_NO_FIRST_HEADER
        );

        let mut got = Vec::new();
        let mut packetizer = Packetizer::new(
            PacketizerConfig::builder().frame(config).build(),
            |extracted| got.push(extracted),
        );

        packetizer.push_tm_frame(&frames[0]).unwrap();
        assert_eq!(packetizer.stats().packets, 0);
        packetizer.push_tm_frame(&frames[1]).unwrap();
        assert_eq!(packetizer.stats().packets, 0);
        packetizer.push_tm_frame(&frames[2]).unwrap();
        assert_eq!(packetizer.stats().packets, 1);

        for frame in &frames[3..] {
            packetizer.push_tm_frame(frame).unwrap();
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].packet, sent);
    }

    #[test]
    fn checksum_failure_drops_frame_and_recovers() {
        let config = TmFrameConfig::builder().frame_len(18).build();
        // capacity 10: packet A spans frames 0 and 1, B rides with A's
        // tail in frame 1, C fills frame 2
        let frames = assemble(
            config,
            &[(1, packet(100, 13)), (1, packet(101, 7)), (1, packet(102, 10))],
        );
        assert_eq!(frames.len(), 3);

        let mut dat = frames[1].as_bytes().to_vec();
        dat[8] ^= 0x04;
        let corrupt = TmFrame::decode(&dat, config).unwrap();

        let mut got = Vec::new();
        let mut packetizer = Packetizer::new(
            PacketizerConfig::builder().frame(config).build(),
            |extracted| got.push(extracted),
        );

        packetizer.push_tm_frame(&frames[0]).unwrap();
        let err = packetizer.push_tm_frame(&corrupt).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)), "{err}");
        packetizer.push_tm_frame(&frames[2]).unwrap();
        let stats = packetizer.stats();

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].packet.apid(), 102);
        assert_eq!(stats.checksum_failures, 1);
        assert_eq!(stats.missing_frames, 1);
        assert_eq!(stats.packets, 1);
    }

    #[test]
    fn counter_gap_drops_carry() {
        let config = frame_config(16);
        let frames = assemble(config, &[(1, packet(100, 24))]);
        assert_eq!(frames.len(), 4);

        let mut got = Vec::new();
        let mut packetizer = Packetizer::new(
            PacketizerConfig::builder().frame(config).build(),
            |extracted| got.push(extracted),
        );

        packetizer.push_tm_frame(&frames[0]).unwrap();
        // frame 1 lost in transit
        packetizer.push_tm_frame(&frames[2]).unwrap();
        packetizer.push_tm_frame(&frames[3]).unwrap();
        let stats = packetizer.stats();

        assert!(got.is_empty());
        assert_eq!(stats.missing_frames, 1);
        assert_eq!(stats.packets, 0);
        assert_eq!(stats.idle_packets, 1);
    }

    #[test]
    fn carry_cut_short_is_dropped_not_delivered() {
        // frame 0 leaves 10 bytes of a declared-14 packet in flight, then
        // frame 1 declares a packet start at byte zero
        let config = frame_config(16);
        let p = packet(100, 14);
        let q = packet(101, 10);
        let f0 = raw_frame(config, 0, 0, &p.as_bytes()[..10]);
        let f1 = raw_frame(config, 1, 0, q.as_bytes());

        let mut got = Vec::new();
        let mut packetizer = Packetizer::new(
            PacketizerConfig::builder().frame(config).build(),
            |extracted| got.push(extracted),
        );
        packetizer.push_tm_frame(&f0).unwrap();
        packetizer.push_tm_frame(&f1).unwrap();
        let stats = packetizer.stats();

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].packet, q);
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.missing_frames, 0);
    }

    #[test]
    fn carry_overrun_is_dropped_and_extraction_recovers() {
        // frame 1's first header pointer stretches the carried packet to
        // 16 bytes against a declared total of 14
        let config = frame_config(16);
        let p = packet(100, 14);
        let q = packet(101, 14);
        let mut mid = vec![0x55; 6];
        mid.extend_from_slice(&q.as_bytes()[..4]);
        let f0 = raw_frame(config, 0, 0, &p.as_bytes()[..10]);
        let f1 = raw_frame(config, 1, 6, &mid);
        let f2 = raw_frame(config, 2, TmFrame::FHP_NO_FIRST_HEADER, &q.as_bytes()[4..]);

        let mut got = Vec::new();
        let mut packetizer = Packetizer::new(
            PacketizerConfig::builder().frame(config).build(),
            |extracted| got.push(extracted),
        );
        packetizer.push_tm_frame(&f0).unwrap();
        packetizer.push_tm_frame(&f1).unwrap();
        packetizer.push_tm_frame(&f2).unwrap();
        let stats = packetizer.stats();

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].packet, q);
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.packets, 1);
    }

    #[test]
    fn continuation_without_packet_in_flight_resyncs() {
        // frame 0 closes its packet exactly at the frame boundary, yet
        // frame 1 leads with 7 continuation bytes
        let config = frame_config(16);
        let a = packet(100, 10);
        let c = packet(101, 10);
        let mut dat = vec![0xbb; 7];
        dat.extend_from_slice(&c.as_bytes()[..3]);
        let f0 = raw_frame(config, 0, 0, a.as_bytes());
        let f1 = raw_frame(config, 1, 7, &dat);

        let mut got = Vec::new();
        let mut packetizer = Packetizer::new(
            PacketizerConfig::builder().frame(config).build(),
            |extracted| got.push(extracted),
        );
        packetizer.push_tm_frame(&f0).unwrap();
        packetizer.push_tm_frame(&f1).unwrap();
        let stats = packetizer.stats();

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].packet, a);
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.packets, 1);
    }

    #[test]
    fn idle_delivery_configurable() {
        let config = frame_config(16);
        let frames = assemble(config, &[(1, packet(100, 8))]);

        let mut got = Vec::new();
        let mut packetizer = Packetizer::new(
            PacketizerConfig::builder().frame(config).deliver_idle(true).build(),
            |extracted| got.push(extracted),
        );
        for frame in &frames {
            packetizer.push_tm_frame(frame).unwrap();
        }
        let stats = packetizer.stats();

        let idle: Vec<_> = got.iter().filter(|e| e.packet.is_idle()).collect();
        assert!(!idle.is_empty());
        assert_eq!(stats.packets, got.len() as u64);
    }

    #[test]
    fn finish_reports_truncated_tail() {
        let config = frame_config(16);
        let frames = assemble(config, &[(3, packet(100, 24))]);

        let mut packetizer = Packetizer::new(
            PacketizerConfig::builder().frame(config).build(),
            |_| {},
        );
        packetizer.push_tm_frame(&frames[0]).unwrap();

        let tails = packetizer.finish();
        assert_eq!(
            tails,
            vec![TruncatedTail {
                vcid: 3,
                buffered: 10,
                declared: Some(24),
            }]
        );
        assert!(packetizer.finish().is_empty());
    }
}
