//! Segment checksum.
//!
//! The bootloader verifies every segment with CRC-16/CCITT-FALSE
//! (poly 0x1021, init 0xFFFF, no reflection, no final XOR). The `crc`
//! catalogue lists this variant as CRC-16/IBM-3740.

use crc::{CRC_16_IBM_3740, Crc};

const CRC16_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Compute the segment CRC over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16_CCITT.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vectors() {
        assert_eq!(crc16(b""), 0xFFFF);
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(&[0x00]), 0xE1F0);
    }

    #[test]
    fn test_segment_vector() {
        let data: Vec<u8> = (0u8..40).collect();
        assert_eq!(crc16(&data), 0x0476);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data = b"segment payload spanning several chunks";
        let mut digest = CRC16_CCITT.digest();
        for part in data.chunks(7) {
            digest.update(part);
        }
        assert_eq!(digest.finalize(), crc16(data));
    }
}
