//! Packs space packets into a TM transfer frame stream.

use std::collections::HashMap;
use std::mem;

use tracing::{debug, trace};
use typed_builder::TypedBuilder;

use super::{Scid, TmFrame, TmFrameConfig, Vcid};
use crate::error::Result;
use crate::spacepacket::{Packet, PrimaryHeader};

/// Configuration for [Assembler].
#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct AssemblerConfig {
    /// Spacecraft id stamped on every frame.
    pub scid: Scid,
    #[builder(default)]
    pub frame: TmFrameConfig,
}

#[derive(Debug)]
struct VcState {
    vcid: Vcid,
    frame: TmFrame,
    /// Write position within the current frame's data field.
    offset: usize,
    /// Data field offset of the first packet to start in the current
    /// frame, if any has.
    first_header: Option<u16>,
    frame_count: u8,
    idle_count: u16,
}

/// Packs space packets into fixed-size TM transfer frames per virtual
/// channel.
///
/// Packets are laid into each frame's data field back to back. A frame is
/// handed to the sink the moment it fills; [flush](Self::flush) pads the
/// frame in progress with an idle packet so it can be emitted on demand.
/// Packets may span any number of frames. The first header pointer and the
/// master and virtual channel frame counters are maintained on every
/// emitted frame.
pub struct Assembler<F>
where
    F: FnMut(TmFrame),
{
    config: AssemblerConfig,
    channels: HashMap<Vcid, VcState>,
    master_count: u8,
    sink: F,
}

impl<F> Assembler<F>
where
    F: FnMut(TmFrame),
{
    pub fn new(config: AssemblerConfig, sink: F) -> Self {
        Assembler {
            config,
            channels: HashMap::new(),
            master_count: 0,
            sink,
        }
    }

    /// Append `packet` to a virtual channel, emitting every frame that
    /// fills.
    pub fn push_tm_packet(&mut self, vcid: Vcid, packet: &Packet) -> Result<()> {
        let mut state = match self.channels.remove(&vcid) {
            Some(state) => state,
            None => self.fresh_state(vcid)?,
        };
        trace!(vcid, packet = %packet, offset = state.offset, "packing packet");
        let result = self.fill(&mut state, packet.as_bytes(), true);
        self.channels.insert(vcid, state);
        result
    }

    /// Pad the frame in progress for `vcid` with an idle packet and emit
    /// it. A no-op for an empty or unknown channel.
    ///
    /// When the remaining room is too small for a whole idle packet, the
    /// idle packet spans into one further frame, which is emitted as well.
    pub fn flush(&mut self, vcid: Vcid) -> Result<()> {
        let Some(mut state) = self.channels.remove(&vcid) else {
            return Ok(());
        };
        let result = self.flush_state(&mut state);
        self.channels.insert(vcid, state);
        result
    }

    /// Flush every channel, in vcid order.
    pub fn flush_all(&mut self) -> Result<()> {
        let mut vcids: Vec<Vcid> = self.channels.keys().copied().collect();
        vcids.sort_unstable();
        for vcid in vcids {
            self.flush(vcid)?;
        }
        Ok(())
    }

    fn fresh_state(&self, vcid: Vcid) -> Result<VcState> {
        Ok(VcState {
            vcid,
            frame: self.fresh_frame(vcid)?,
            offset: 0,
            first_header: None,
            frame_count: 0,
            idle_count: 0,
        })
    }

    fn fresh_frame(&self, vcid: Vcid) -> Result<TmFrame> {
        let mut frame = TmFrame::new(self.config.frame)?;
        frame.set_scid(self.config.scid)?;
        frame.set_vcid(vcid)?;
        Ok(frame)
    }

    fn fill(&mut self, state: &mut VcState, mut dat: &[u8], starts_packet: bool) -> Result<()> {
        let capacity = self.config.frame.data_capacity();
        if starts_packet && state.first_header.is_none() {
            state.first_header = Some(state.offset as u16);
        }
        while !dat.is_empty() {
            let take = (capacity - state.offset).min(dat.len());
            let (chunk, rest) = dat.split_at(take);
            state.frame.write_data(state.offset, chunk)?;
            state.offset += take;
            dat = rest;
            if state.offset == capacity {
                self.emit(state)?;
            }
        }
        Ok(())
    }

    fn emit(&mut self, state: &mut VcState) -> Result<()> {
        let mut frame = mem::replace(&mut state.frame, self.fresh_frame(state.vcid)?);
        frame.set_master_channel_count(self.master_count)?;
        frame.set_virtual_channel_count(state.frame_count)?;
        let fhp = state
            .first_header
            .take()
            .unwrap_or(TmFrame::FHP_NO_FIRST_HEADER);
        frame.set_first_header_pointer(fhp)?;
        frame.set_checksum()?;
        trace!(
            vcid = state.vcid,
            mc = self.master_count,
            vc = state.frame_count,
            fhp,
            "emitting frame"
        );
        self.master_count = self.master_count.wrapping_add(1);
        state.frame_count = state.frame_count.wrapping_add(1);
        state.offset = 0;
        (self.sink)(frame);
        Ok(())
    }

    fn flush_state(&mut self, state: &mut VcState) -> Result<()> {
        if state.offset == 0 {
            return Ok(());
        }
        let capacity = self.config.frame.data_capacity();
        let remaining = capacity - state.offset;
        let idle_len = if remaining >= Packet::MIN_LEN {
            remaining
        } else {
            remaining + capacity
        };
        let idle = Packet::idle(idle_len, state.idle_count)?;
        state.idle_count = (state.idle_count + 1) & PrimaryHeader::SEQ_MAX;
        debug!(vcid = state.vcid, idle_len, "flushing with idle packet");
        self.fill(state, idle.as_bytes(), true)
    }
}
