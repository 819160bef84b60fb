//! Variable-length integers as stored in cells.
//!
//! Big-endian groups of 7 bits, high bit set on every byte but the last. A ninth
//! byte, when present, contributes all 8 bits, so any u64 fits in at most 9 bytes.

use crate::common::{LodeError, Result};

/// Longest encoding of a varint
pub const MAX_VARINT_LEN: usize = 9;

/// Decodes a varint from the front of `buf`, returning (value, bytes consumed).
pub fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let byte = *buf
            .get(i)
            .ok_or_else(|| LodeError::corrupt("varint runs past end of cell"))?;
        if i == MAX_VARINT_LEN - 1 {
            return Ok(((value << 8) | byte as u64, MAX_VARINT_LEN));
        }
        value = (value << 7) | (byte & 0x7f) as u64;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    unreachable!("loop returns on the ninth byte")
}

/// Number of bytes `value` occupies once encoded.
pub fn varint_len(value: u64) -> usize {
    if value > 0x00ff_ffff_ffff_ffff {
        return MAX_VARINT_LEN;
    }
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Appends the encoding of `value` to `out`.
pub fn put_varint(out: &mut Vec<u8>, value: u64) {
    if value > 0x00ff_ffff_ffff_ffff {
        // Eight 7-bit groups followed by a full final byte.
        let high = value >> 8;
        for shift in (0..8).rev() {
            out.push(((high >> (shift * 7)) & 0x7f) as u8 | 0x80);
        }
        out.push(value as u8);
        return;
    }
    let len = varint_len(value);
    for i in (0..len).rev() {
        let group = ((value >> (i * 7)) & 0x7f) as u8;
        out.push(if i == 0 { group } else { group | 0x80 });
    }
}
