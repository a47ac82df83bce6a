//! TM and TC transfer framing.
//!
//! On the downlink side [Assembler] packs space packets into TM transfer
//! frames and [Packetizer] recovers them from a frame stream. On the uplink
//! side [TcFramer] wraps telecommand packets in TC transfer frames ready
//! for CLTU coding.

mod assembler;
mod packetizer;
mod tc;
mod tm;

pub use assembler::*;
pub use packetizer::*;
pub use tc::*;
pub use tm::*;

use std::io::Read;

use tracing::warn;
use typed_builder::TypedBuilder;

use crate::error::{Error, Result};

/// Spacecraft identifier.
pub type Scid = u16;
/// Virtual channel identifier.
pub type Vcid = u16;

/// Layout of the fixed-size records in a frame dump file.
#[derive(Clone, Copy, Debug, TypedBuilder)]
pub struct FrameDumpConfig {
    /// Total bytes per record, any leading annotation included.
    pub record_len: usize,
    /// Annotation bytes preceding the frame in each record.
    #[builder(default = 0)]
    pub header_len: usize,
}

/// Iterate fixed-size frame records from `reader`, yielding frame bytes
/// with the per-record annotation stripped.
///
/// A trailing partial record is logged and dropped.
pub fn read_frame_records<R>(
    reader: R,
    config: FrameDumpConfig,
) -> impl Iterator<Item = Result<Vec<u8>>>
where
    R: Read + Send,
{
    FrameRecordIter {
        reader,
        config,
        done: false,
    }
}

struct FrameRecordIter<R>
where
    R: Read + Send,
{
    reader: R,
    config: FrameDumpConfig,
    done: bool,
}

impl<R> Iterator for FrameRecordIter<R>
where
    R: Read + Send,
{
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.config.header_len >= self.config.record_len {
            self.done = true;
            return Some(Err(Error::Malformed(format!(
                "record header of {} bytes leaves no frame in a {} byte record",
                self.config.header_len, self.config.record_len
            ))));
        }
        let mut buf = vec![0u8; self.config.record_len];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(Error::Io(err)));
                }
            }
        }
        if filled == 0 {
            self.done = true;
            return None;
        }
        if filled < buf.len() {
            warn!(
                got = filled,
                want = buf.len(),
                "dropping partial trailing record"
            );
            self.done = true;
            return None;
        }
        Some(Ok(buf.split_off(self.config.header_len)))
    }
}
