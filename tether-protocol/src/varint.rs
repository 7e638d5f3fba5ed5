//! Variable-length unsigned integers.
//!
//! Encoding (1-4 bytes, least significant group first):
//!
//! ```text
//! byte 0..=2: [c|d d d d d d d]   c = another byte follows, d = 7 data bits
//! byte 3:     [d d d d d d d d]   8 data bits, never followed
//! ```
//!
//! The fourth byte carries a full eight bits, giving a range of `0..=2^29 - 1`.

use crate::error::ProtocolError;
use bytes::BufMut;

/// Maximum encoded size in bytes.
pub const MAX_VARINT_LEN: usize = 4;

/// Largest encodable value.
pub const MAX_VARINT_VALUE: u32 = (1 << 29) - 1;

/// Returns the number of bytes `value` occupies once encoded.
pub fn encoded_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        _ => 4,
    }
}

/// Appends the encoding of `value` to `buf`.
pub fn encode<B: BufMut>(value: u32, buf: &mut B) -> Result<(), ProtocolError> {
    if value > MAX_VARINT_VALUE {
        return Err(ProtocolError::VarintOverflow(value));
    }

    let mut rest = value;
    for _ in 0..MAX_VARINT_LEN - 1 {
        if rest < 0x80 {
            buf.put_u8(rest as u8);
            return Ok(());
        }
        buf.put_u8((rest as u8 & 0x7F) | 0x80);
        rest >>= 7;
    }
    buf.put_u8(rest as u8);
    Ok(())
}

/// Decodes a value from the front of `buf` without consuming anything.
///
/// Returns the value and its encoded length, or `None` if `buf` ends before
/// the encoding does.
pub fn decode(buf: &[u8]) -> Option<(u32, usize)> {
    let mut value = 0u32;
    for i in 0..MAX_VARINT_LEN {
        let byte = *buf.get(i)?;
        if i == MAX_VARINT_LEN - 1 {
            value |= u32::from(byte) << (7 * i);
            return Some((value, MAX_VARINT_LEN));
        }
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
