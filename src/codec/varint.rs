//! Unsigned LEB128 varints
//!
//! Seven payload bits per byte, low group first; the high bit marks a
//! continuation. A `u64` takes at most 10 bytes.

use bytes::BufMut;

/// Longest encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

pub fn put_varint(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a varint from the front of `buf`
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// input ends mid-varint or the value overflows a `u64`.
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        let group = u64::from(byte & 0x7F);
        let shift = 7 * i as u32;
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return None;
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
