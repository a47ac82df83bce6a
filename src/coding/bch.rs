//! BCH(63,56) block code used by CLTU channel coding (CCSDS 231.0-B).

/// Encoder and checker for the CCSDS BCH(63,56) code.
///
/// Each code block carries 7 information bytes followed by 1 parity byte
/// holding the 7 complemented check bits and a filler bit of 0. Parity is
/// generated by the polynomial x^7 + x^6 + x^2 + 1 with bits fed most
/// significant first.
///
/// Construction builds a state transition table so streaming encode costs
/// one lookup per byte.
pub struct Bch {
    table: Box<[[u8; 256]; 128]>,
}

impl Bch {
    /// Information bytes per code block.
    pub const DATA_LEN: usize = 7;
    /// Total bytes per code block, information plus parity.
    pub const BLOCK_LEN: usize = 8;

    /// Remaining generator terms applied on feedback: x^6 + x^2 + 1.
    const POLY_MASK: u8 = 0x45;

    #[must_use]
    pub fn new() -> Self {
        let mut table = Box::new([[0u8; 256]; 128]);
        for state in 0..128u8 {
            for byte in 0..=255u8 {
                table[state as usize][byte as usize] = step(state, byte);
            }
        }
        Bch { table }
    }

    /// Shift register state at the start of a block.
    #[must_use]
    pub fn encode_start(&self) -> u8 {
        0
    }

    /// Advance the shift register by one information byte.
    #[must_use]
    pub fn encode_step(&self, state: u8, byte: u8) -> u8 {
        self.table[(state & 0x7f) as usize][byte as usize]
    }

    /// Finish a block, producing the parity byte.
    #[must_use]
    pub fn encode_stop(&self, state: u8) -> u8 {
        (!state & 0x7f) << 1
    }

    /// Parity byte over the information bytes of one block.
    #[must_use]
    pub fn check_byte(&self, dat: &[u8]) -> u8 {
        let mut state = self.encode_start();
        for &byte in dat {
            state = self.encode_step(state, byte);
        }
        self.encode_stop(state)
    }

    /// Encode one information block into a code block.
    #[must_use]
    pub fn encode_block(&self, dat: &[u8; 7]) -> [u8; 8] {
        let mut block = [0u8; 8];
        block[..Self::DATA_LEN].copy_from_slice(dat);
        block[Self::DATA_LEN] = self.check_byte(dat);
        block
    }

    /// Whether a code block's parity byte matches its information bytes.
    #[must_use]
    pub fn verify_block(&self, block: &[u8; 8]) -> bool {
        self.check_byte(&block[..Self::DATA_LEN]) == block[Self::DATA_LEN]
    }
}

impl Default for Bch {
    fn default() -> Self {
        Self::new()
    }
}

/// Clock one byte through the parity shift register, most significant bit
/// first.
fn step(mut state: u8, byte: u8) -> u8 {
    for i in (0..8).rev() {
        let bit = byte >> i & 1;
        let feedback = bit ^ (state >> 6 & 1);
        state = state << 1 & 0x7f;
        if feedback != 0 {
            state ^= Bch::POLY_MASK;
        }
    }
    state
}
