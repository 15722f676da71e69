//! Checksum primitives for both wire protocols. Table-driven via the `crc`
//! crate; the tests hold these to parity with independent bitwise
//! implementations of both polynomials.

use crc::{Crc, CRC_16_MODBUS, CRC_32_ISO_HDLC};

/// Modbus CRC-16: polynomial 0xA001 (reflected), initial 0xFFFF, no final
/// xor. Used by the RTU engine and the gateway frame trailer alike.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

#[inline]
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn crc16_bitwise(data: &[u8]) -> u16 {
        let mut crc = 0xFFFFu16;

        for &byte in data {
            crc ^= u16::from(byte);
            for _ in 0..8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xA001;
                } else {
                    crc >>= 1;
                }
            }
        }

        crc
    }

    fn crc32_bitwise(data: &[u8]) -> u32 {
        let mut crc = 0xFFFF_FFFFu32;

        for &byte in data {
            crc ^= u32::from(byte);
            for _ in 0..8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
            }
        }

        !crc
    }

    #[test]
    fn test_crc16_reference_vector() {
        // Read-holding-registers request body, the canonical check value
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x0A];

        assert_eq!(crc16(&data), 0xCDC5);
        assert_eq!(crc16(&data).to_le_bytes(), [0xC5, 0xCD]);
    }

    #[test]
    fn test_crc16_empty_input() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_crc16_parity_with_bitwise_reference() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x51C6);

        for size in 0..=300 {
            let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
            assert_eq!(crc16(&data), crc16_bitwise(&data), "size {}", size);
        }
    }

    #[test]
    fn test_crc32_parity_with_bitwise_reference() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xC32C);

        for size in 0..=300 {
            let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
            assert_eq!(crc32(&data), crc32_bitwise(&data), "size {}", size);
        }
    }

    #[test]
    fn test_crc16_incremental_digest_matches_oneshot() {
        let data = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];

        let mut digest = CRC16.digest();
        digest.update(&data[..3]);
        digest.update(&data[3..]);

        assert_eq!(digest.finalize(), crc16(&data));
    }
}
