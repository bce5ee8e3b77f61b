//! Big-endian field helpers and the 1..9-byte varint codec.
//!
//! Every multi-byte integer in the database file, rollback journal, and WAL
//! is big-endian. These helpers panic-free-decode from slices that the
//! caller has already bounds-checked against a fixed layout.

/// Read a big-endian u16 at `offset`.
#[inline]
#[must_use]
pub fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Read a big-endian u32 at `offset`.
#[inline]
#[must_use]
pub fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Read a big-endian i32 at `offset`.
#[inline]
#[must_use]
pub fn get_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Write a big-endian u16 at `offset`.
#[inline]
pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Write a big-endian u32 at `offset`.
#[inline]
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Write a big-endian i32 at `offset`.
#[inline]
pub fn put_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Decode a variable-length integer.
///
/// The format packs 7 bits per byte, high bit set on all but the last byte;
/// a ninth byte, if reached, contributes all 8 bits. Returns the value and
/// the number of bytes consumed, or `None` if the buffer ends mid-varint.
#[must_use]
pub fn get_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &b) in buf.iter().take(9).enumerate() {
        if i == 8 {
            // Ninth byte: all eight bits.
            return Some(((value << 8) | u64::from(b), 9));
        }
        value = (value << 7) | u64::from(b & 0x7F);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Encode a variable-length integer into `out`, returning the byte count.
///
/// `out` must be at least 9 bytes.
pub fn put_varint(out: &mut [u8], value: u64) -> usize {
    if value <= 0x7F {
        out[0] = value as u8;
        return 1;
    }
    if value > 0x00FF_FFFF_FFFF_FFFF {
        // Needs the full 9 bytes; the last byte carries 8 bits.
        out[8] = value as u8;
        let mut v = value >> 8;
        for i in (0..8).rev() {
            out[i] = (v as u8 & 0x7F) | 0x80;
            v >>= 7;
        }
        return 9;
    }
    let mut tmp = [0u8; 9];
    let mut n = 0;
    let mut v = value;
    while v != 0 {
        tmp[n] = (v as u8 & 0x7F) | 0x80;
        v >>= 7;
        n += 1;
    }
    tmp[0] &= 0x7F;
    for i in 0..n {
        out[i] = tmp[n - 1 - i];
    }
    n
}
