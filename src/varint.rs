//! Unsigned varint (LEB128-style) encoding used by block, index, and manifest framing.
//!
//! Each byte carries 7 bits of payload plus a continuation bit in the high
//! order position, little-endian in the sense that the least-significant
//! group comes first. This is the same shape used by the rest of the
//! LevelDB-family table formats this crate's block layout is grounded on.

use bytes::BufMut;

/// Maximum number of bytes a `u64` varint can occupy.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `value` to `buf` as an unsigned varint.
pub fn put_varint64<B: BufMut>(buf: &mut B, mut value: u64) {
    loop {
        if value < 0x80 {
            buf.put_u8(value as u8);
            break;
        }
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
}

/// Appends `value` to `buf` as an unsigned varint.
pub fn put_varint32<B: BufMut>(buf: &mut B, value: u32) {
    put_varint64(buf, u64::from(value));
}

/// Returns the number of bytes `value` would occupy when varint-encoded.
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Error produced when decoding a malformed or truncated varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarintDecodeError;

/// Decodes an unsigned varint from the front of `buf`.
///
/// On success, returns the decoded value and the remaining, unconsumed slice.
pub fn get_varint64(buf: &[u8]) -> Result<(u64, &[u8]), VarintDecodeError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(VarintDecodeError);
        }
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, &buf[i + 1..]));
        }
        shift += 7;
    }
    Err(VarintDecodeError)
}

/// Decodes an unsigned varint from the front of `buf`, returning a `u32`.
///
/// Returns an error if the decoded value overflows `u32`.
pub fn get_varint32(buf: &[u8]) -> Result<(u32, &[u8]), VarintDecodeError> {
    let (value, rest) = get_varint64(buf)?;
    let value = u32::try_from(value).map_err(|_| VarintDecodeError)?;
    Ok((value, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_values_round_trip() {
        for &v in &[0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint64(&mut buf, v);
            assert_eq!(buf.len(), varint_len(v));
            let (decoded, rest) = get_varint64(&buf).expect("decode");
            assert_eq!(decoded, v);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut buf = Vec::new();
        put_varint64(&mut buf, u64::MAX);
        buf.truncate(buf.len() - 1);
        assert_eq!(get_varint64(&buf), Err(VarintDecodeError));
    }

    #[test]
    fn trailing_bytes_are_preserved() {
        let mut buf = Vec::new();
        put_varint32(&mut buf, 42);
        buf.extend_from_slice(b"tail");
        let (value, rest) = get_varint32(&buf).expect("decode");
        assert_eq!(value, 42);
        assert_eq!(rest, b"tail");
    }

    proptest! {
        #[test]
        fn round_trips_for_any_u64(v in any::<u64>()) {
            let mut buf = Vec::new();
            put_varint64(&mut buf, v);
            let (decoded, rest) = get_varint64(&buf).unwrap();
            prop_assert_eq!(decoded, v);
            prop_assert!(rest.is_empty());
        }
    }
}
