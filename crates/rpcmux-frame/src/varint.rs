//! Unsigned LEB128 varints, limited to 32 bits.

use bytes::{Buf, BufMut};

use crate::error::{FrameError, Result};

/// A 32-bit varint never needs more than 5 bytes.
pub const MAX_VARINT32_LEN: usize = 5;

/// Append `value` as a varint.
pub fn put_varint32(dst: &mut impl BufMut, mut value: u32) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Read a varint, advancing `src` past it.
///
/// Fails on truncated input and on encodings that overflow 32 bits.
pub fn get_varint32(src: &mut impl Buf) -> Result<u32> {
    let mut value: u32 = 0;
    for index in 0..MAX_VARINT32_LEN {
        if !src.has_remaining() {
            return Err(FrameError::malformed("truncated varint"));
        }
        let byte = src.get_u8();
        if index == MAX_VARINT32_LEN - 1 && byte > 0x0F {
            return Err(FrameError::malformed("varint overflows 32 bits"));
        }
        value |= u32::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(FrameError::malformed("varint overflows 32 bits"))
}

/// Number of bytes `value` occupies when encoded.
pub fn varint32_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn small_values_take_one_byte() {
        let mut buf = BytesMut::new();
        put_varint32(&mut buf, 0);
        put_varint32(&mut buf, 127);
        assert_eq!(buf.as_ref(), &[0x00, 0x7F]);
    }

    #[test]
    fn boundaries_roundtrip() {
        for value in [0, 1, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, u32::MAX] {
            let mut buf = BytesMut::new();
            put_varint32(&mut buf, value);
            assert_eq!(buf.len(), varint32_len(value), "length for {value}");

            let mut src = buf.freeze();
            assert_eq!(get_varint32(&mut src).unwrap(), value);
            assert!(src.is_empty());
        }
    }

    #[test]
    fn truncated_input_is_malformed() {
        let mut src: &[u8] = &[0x80, 0x80];
        assert!(matches!(
            get_varint32(&mut src),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn overflow_is_malformed() {
        let mut src: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0x1F];
        assert!(matches!(
            get_varint32(&mut src),
            Err(FrameError::Malformed(_))
        ));

        let mut src: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0x8F, 0x01];
        assert!(matches!(
            get_varint32(&mut src),
            Err(FrameError::Malformed(_))
        ));
    }
}
