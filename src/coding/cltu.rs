//! Communications Link Transmission Unit framing (CCSDS 231.0-B).

use super::Bch;
use crate::error::{Error, Result};

/// Bytes marking the start of a CLTU.
pub const START_SEQUENCE: [u8; 2] = [0xeb, 0x90];
/// Sequence closing a CLTU, one code block of fill.
pub const TAIL_SEQUENCE: [u8; 8] = [0x55; 8];
/// Byte used to pad the final information block.
pub const FILL_BYTE: u8 = 0x55;

/// Encoder and decoder for CLTUs.
///
/// A CLTU wraps a TC transfer frame for the uplink: a start sequence, the
/// frame cut into 7-byte information blocks each closed by a BCH parity
/// byte, the final block padded with [FILL_BYTE], then a fixed tail
/// sequence.
///
/// # Example
/// ```
/// use spacelink::coding::CltuCodec;
///
/// let codec = CltuCodec::default();
/// let cltu = codec.encode(&[0x12, 0x34, 0x56]).unwrap();
/// assert_eq!(cltu.len(), 2 + 8 + 8);
/// assert_eq!(&codec.decode(&cltu).unwrap()[..3], &[0x12, 0x34, 0x56]);
/// ```
pub struct CltuCodec {
    bch: Bch,
}

impl CltuCodec {
    #[must_use]
    pub fn new(bch: Bch) -> Self {
        CltuCodec { bch }
    }

    /// Encode `frame` into a CLTU.
    pub fn encode(&self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.is_empty() {
            return Err(Error::Malformed("cannot encode an empty frame".to_string()));
        }
        let nblocks = (frame.len() + Bch::DATA_LEN - 1) / Bch::DATA_LEN;
        let mut cltu = Vec::with_capacity(
            START_SEQUENCE.len() + nblocks * Bch::BLOCK_LEN + TAIL_SEQUENCE.len(),
        );
        cltu.extend_from_slice(&START_SEQUENCE);
        for chunk in frame.chunks(Bch::DATA_LEN) {
            let mut state = self.bch.encode_start();
            for &byte in chunk {
                cltu.push(byte);
                state = self.bch.encode_step(state, byte);
            }
            for _ in chunk.len()..Bch::DATA_LEN {
                cltu.push(FILL_BYTE);
                state = self.bch.encode_step(state, FILL_BYTE);
            }
            cltu.push(self.bch.encode_stop(state));
        }
        cltu.extend_from_slice(&TAIL_SEQUENCE);
        Ok(cltu)
    }

    /// Decode a CLTU back to its information bytes.
    ///
    /// The returned bytes include any fill used to pad the final block; the
    /// frame layer trims to the frame's declared length.
    pub fn decode(&self, cltu: &[u8]) -> Result<Vec<u8>> {
        let body = self.validate(cltu)?;
        let mut dat = Vec::with_capacity(body.len() / Bch::BLOCK_LEN * Bch::DATA_LEN);
        for block in body.chunks_exact(Bch::BLOCK_LEN) {
            dat.extend_from_slice(&block[..Bch::DATA_LEN]);
        }
        Ok(dat)
    }

    /// Validate CLTU structure and block parity without extracting data.
    pub fn check(&self, cltu: &[u8]) -> Result<()> {
        self.validate(cltu).map(|_| ())
    }

    fn validate<'a>(&self, cltu: &'a [u8]) -> Result<&'a [u8]> {
        let overhead = START_SEQUENCE.len() + TAIL_SEQUENCE.len();
        if cltu.len() < overhead + Bch::BLOCK_LEN || (cltu.len() - overhead) % Bch::BLOCK_LEN != 0
        {
            return Err(Error::Malformed(format!(
                "CLTU length must be {} plus a positive multiple of {}, got {}",
                overhead,
                Bch::BLOCK_LEN,
                cltu.len()
            )));
        }
        if cltu[..START_SEQUENCE.len()] != START_SEQUENCE {
            return Err(Error::Malformed(format!(
                "bad start sequence {:02x}{:02x}",
                cltu[0], cltu[1]
            )));
        }
        if cltu[cltu.len() - TAIL_SEQUENCE.len()..] != TAIL_SEQUENCE {
            return Err(Error::Malformed("bad tail sequence".to_string()));
        }
        let body = &cltu[START_SEQUENCE.len()..cltu.len() - TAIL_SEQUENCE.len()];
        for (i, block) in body.chunks_exact(Bch::BLOCK_LEN).enumerate() {
            if self.bch.check_byte(&block[..Bch::DATA_LEN]) != block[Bch::DATA_LEN] {
                return Err(Error::Integrity(format!(
                    "BCH parity mismatch in block {i}"
                )));
            }
        }
        Ok(body)
    }
}

impl Default for CltuCodec {
    fn default() -> Self {
        CltuCodec::new(Bch::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        let codec = CltuCodec::default();
        let cltu = codec.encode(&[0u8; 7]).unwrap();
        let expected = hex::decode("eb9000000000000000fe5555555555555555").unwrap();
        assert_eq!(cltu, expected);
        assert_eq!(codec.decode(&cltu).unwrap(), [0u8; 7]);
    }

    #[test]
    fn round_trip_with_fill() {
        let codec = CltuCodec::default();
        for len in [1usize, 6, 7, 8, 14, 247] {
            let frame: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let cltu = codec.encode(&frame).unwrap();
            let nblocks = (len + Bch::DATA_LEN - 1) / Bch::DATA_LEN;
            assert_eq!(cltu.len(), 2 + nblocks * Bch::BLOCK_LEN + 8, "len {len}");
            codec.check(&cltu).unwrap();
            let decoded = codec.decode(&cltu).unwrap();
            assert_eq!(&decoded[..len], &frame[..], "len {len}");
            assert!(decoded[len..].iter().all(|&b| b == FILL_BYTE), "len {len}");
        }
    }

    #[test]
    fn rejects_empty_frame() {
        let codec = CltuCodec::default();
        assert!(matches!(codec.encode(&[]), Err(Error::Malformed(_))));
    }

    #[test]
    fn rejects_bad_structure() {
        let codec = CltuCodec::default();
        let cltu = codec.encode(&[0xaa; 14]).unwrap();

        // truncated
        let err = codec.decode(&cltu[..cltu.len() - 3]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");

        // bad start sequence
        let mut corrupt = cltu.clone();
        corrupt[0] = 0x00;
        let err = codec.decode(&corrupt).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)), "{err}");
        assert!(matches!(codec.check(&corrupt), Err(Error::Malformed(_))));

        // bad tail sequence
        let mut corrupt = cltu.clone();
        let n = corrupt.len();
        corrupt[n - 1] = 0xaa;
        assert!(matches!(codec.decode(&corrupt), Err(Error::Malformed(_))));

        // too short to hold any block
        assert!(matches!(
            codec.decode(&[0xeb, 0x90, 0x55]),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn rejects_corrupt_block() {
        let codec = CltuCodec::default();
        let cltu = codec.encode(&(0u8..21).collect::<Vec<u8>>()).unwrap();

        // flip a data bit in the second code block
        let mut corrupt = cltu.clone();
        corrupt[2 + Bch::BLOCK_LEN + 3] ^= 0x10;
        let err = codec.decode(&corrupt).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)), "{err}");
        assert!(err.to_string().contains("block 1"), "{err}");
        assert!(matches!(codec.check(&corrupt), Err(Error::Integrity(_))));
    }
}
