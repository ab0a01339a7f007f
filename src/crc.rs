//! Modbus CRC-16: polynomial 0xA001, initial value 0xFFFF, reflected
//! input/output, stored low-byte-first on the wire.

use crc::{Algorithm, Crc};

/// The `crc` crate's `CRC_16_MODBUS` built-in uses the same
/// poly/init/refin/refout/xorout parameters the protocol requires.
const MODBUS: Algorithm<u16> = crc::CRC_16_MODBUS;

/// Computes the CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    Crc::<u16>::new(&MODBUS).checksum(data)
}

/// Validates a frame whose last two bytes are a little-endian CRC-16
/// trailer over everything before it. Returns `Ok(())` when the trailer
/// matches, `Err((expected, actual))` otherwise.
pub fn crc16_validate(frame: &[u8]) -> Result<(), (u16, u16)> {
    debug_assert!(frame.len() >= 2);
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let actual = u16::from_le_bytes([trailer[0], trailer[1]]);
    if expected == actual {
        Ok(())
    } else {
        Err((expected, actual))
    }
}

/// Appends the little-endian CRC-16 trailer of `body` to `out`, returning
/// the number of bytes appended (always 2).
pub fn append_crc(body: &[u8], out: &mut [u8]) -> usize {
    let crc = crc16(body);
    let bytes = crc.to_le_bytes();
    out[0] = bytes[0];
    out[1] = bytes[1];
    2
}
