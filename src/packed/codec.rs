//! Little-endian and LEB128 helpers shared by the packed structures.
//!
//! Readers never panic on short input: out-of-range reads come back as
//! [`TreeError::MalformedPacked`].

use crate::error::{Result, TreeError};

pub(crate) fn malformed(what: impl Into<String>) -> TreeError {
    TreeError::MalformedPacked(what.into())
}

#[inline]
pub(crate) fn read_u16(bytes: &[u8], at: usize) -> Result<u16> {
    let mut buf = [0u8; 2];
    let src = bytes.get(at..at + 2).ok_or_else(|| malformed(format!("u16 at {at} past end")))?;
    buf.copy_from_slice(src);
    Ok(u16::from_le_bytes(buf))
}

#[inline]
pub(crate) fn read_u32(bytes: &[u8], at: usize) -> Result<u32> {
    let mut buf = [0u8; 4];
    let src = bytes.get(at..at + 4).ok_or_else(|| malformed(format!("u32 at {at} past end")))?;
    buf.copy_from_slice(src);
    Ok(u32::from_le_bytes(buf))
}

#[inline]
pub(crate) fn read_u64(bytes: &[u8], at: usize) -> Result<u64> {
    let mut buf = [0u8; 8];
    let src = bytes.get(at..at + 8).ok_or_else(|| malformed(format!("u64 at {at} past end")))?;
    buf.copy_from_slice(src);
    Ok(u64::from_le_bytes(buf))
}

#[inline]
pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn put_uint(out: &mut Vec<u8>, value: u64, width: usize) {
    out.extend_from_slice(&value.to_le_bytes()[..width]);
}

/// Largest value representable in `width` bytes.
#[inline]
pub(crate) const fn max_for_width(width: usize) -> u64 {
    if width >= 8 { u64::MAX } else { (1u64 << (width * 8)) - 1 }
}

#[inline]
pub(crate) fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

#[inline]
pub(crate) fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        #[allow(clippy::cast_possible_truncation)]
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    #[allow(clippy::cast_possible_truncation)]
    out.push(value as u8);
}

/// Decodes one LEB128 value starting at `at`; returns the value and the number of bytes read.
#[inline]
pub(crate) fn read_varint(bytes: &[u8], at: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut pos = at;
    loop {
        let byte = *bytes.get(pos).ok_or_else(|| malformed(format!("varint at {at} runs past end")))?;
        pos += 1;
        if shift == 63 && byte > 1 {
            return Err(malformed(format!("varint at {at} overflows u64")));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, pos - at));
        }
        shift += 7;
        if shift > 63 {
            return Err(malformed(format!("varint at {at} is too long")));
        }
    }
}

// The accessors below read structures whose layout was checked when they were decoded.

#[inline]
pub(crate) fn u32_at(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

#[inline]
pub(crate) fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

#[inline]
pub(crate) fn uint_at(bytes: &[u8], at: usize, width: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(&bytes[at..at + width]);
    u64::from_le_bytes(buf)
}

/// Decodes one LEB128 value; stops quietly at the end of input.
#[inline]
pub(crate) fn varint_at(bytes: &[u8], at: usize) -> (u64, usize) {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut pos = at;
    while let Some(&byte) = bytes.get(pos) {
        pos += 1;
        if shift < 64 {
            value |= u64::from(byte & 0x7f) << shift;
        }
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    (value, pos - at)
}

#[inline]
pub(crate) fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed(format!("{what} {value} does not fit in 32 bits")))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn varint_boundaries() {
        for (value, len) in [(0u64, 1), (127, 1), (128, 2), (16_383, 2), (16_384, 3), (u64::MAX, 10)] {
            let mut out = Vec::new();
            put_varint(&mut out, value);
            assert_eq!(out.len(), len, "value {value}");
            assert_eq!(varint_len(value), len);
            assert_eq!(read_varint(&out, 0).unwrap(), (value, len));
        }
    }

    #[test]
    fn truncated_input_is_malformed() {
        assert!(read_varint(&[0x80, 0x80], 0).is_err());
        assert!(read_varint(&[0xff; 11], 0).is_err());
        assert!(read_u32(&[1, 2, 3], 0).is_err());
        assert!(read_u64(&[0; 8], 1).is_err());
    }

    #[test]
    fn width_limits() {
        assert_eq!(max_for_width(1), 0xff);
        assert_eq!(max_for_width(4), 0xffff_ffff);
        assert_eq!(max_for_width(8), u64::MAX);
    }

    proptest! {
        #[test]
        fn uint_widths(value in any::<u64>(), width in 1usize..=8) {
            let value = value & max_for_width(width);
            let mut out = vec![0xaa];
            put_uint(&mut out, value, width);
            prop_assert_eq!(out.len(), width + 1);
            let bytes = value.to_le_bytes();
            prop_assert_eq!(&out[1..], &bytes[..width]);
        }
    }
}
