use crc::{Crc, CRC_16_IBM_3740};

/// CRC-16 used for TM and TC frame error control fields and the space
/// packet error control trailer. This is CRC-16/IBM-3740: the CCITT
/// polynomial 0x1021 with initial value 0xFFFF and no reflection.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Compute the CRC-16 of `dat`.
#[must_use]
pub fn crc16(dat: &[u8]) -> u16 {
    CRC16.checksum(dat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_value() {
        assert_eq!(crc16(b"123456789"), 0x29b1);
    }

    #[test]
    fn empty_input() {
        assert_eq!(crc16(b""), 0xffff);
    }
}
