//! Codec utilities for TDS protocol encoding and decoding.
//!
//! Strings on the wire are UTF-16LE with a length prefix counted in
//! characters: one byte for `B_VARCHAR`, two bytes for `US_VARCHAR`.

use bytes::{Buf, BufMut};

use crate::error::{ProtocolError, Result};

/// Fail with [`ProtocolError::IncompletePacket`] unless `needed` bytes remain.
#[inline]
pub fn ensure_remaining(src: &impl Buf, needed: usize) -> Result<()> {
    if src.remaining() < needed {
        return Err(ProtocolError::IncompletePacket {
            expected: needed,
            actual: src.remaining(),
        });
    }
    Ok(())
}

/// Read a `B_VARCHAR`: 1-byte character count followed by UTF-16LE.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String> {
    ensure_remaining(src, 1)?;
    let len = src.get_u8() as usize;
    read_utf16_string(src, len)
}

/// Read a `US_VARCHAR`: 2-byte character count followed by UTF-16LE.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String> {
    ensure_remaining(src, 2)?;
    let len = src.get_u16_le() as usize;
    read_utf16_string(src, len)
}

/// Read a UTF-16LE string of `char_count` code units.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Result<String> {
    ensure_remaining(src, char_count * 2)?;
    let units: Vec<u16> = (0..char_count).map(|_| src.get_u16_le()).collect();
    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidUtf16)
}

/// Decode a UTF-16LE byte slice with no length prefix.
pub fn decode_utf16_bytes(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::InvalidUtf16);
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|_| ProtocolError::InvalidUtf16)
}

/// Write a `B_VARCHAR`.
pub fn write_b_varchar(dst: &mut impl BufMut, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = u8::try_from(units.len()).map_err(|_| ProtocolError::StringTooLong {
        len: units.len(),
        max: u8::MAX as usize,
    })?;
    dst.put_u8(len);
    units.iter().for_each(|&u| dst.put_u16_le(u));
    Ok(())
}

/// Write a `US_VARCHAR`.
pub fn write_us_varchar(dst: &mut impl BufMut, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = u16::try_from(units.len()).map_err(|_| ProtocolError::StringTooLong {
        len: units.len(),
        max: u16::MAX as usize,
    })?;
    dst.put_u16_le(len);
    units.iter().for_each(|&u| dst.put_u16_le(u));
    Ok(())
}

/// Write a UTF-16LE string without length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for c in s.encode_utf16() {
        dst.put_u16_le(c);
    }
}

/// Byte length of a string once UTF-16 encoded.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

/// Byte length of a `B_VARCHAR` including its prefix.
#[must_use]
pub fn b_varchar_len(s: &str) -> usize {
    1 + utf16_byte_len(s)
}

/// Byte length of a `US_VARCHAR` including its prefix.
#[must_use]
pub fn us_varchar_len(s: &str) -> usize {
    2 + utf16_byte_len(s)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_b_varchar_roundtrip() {
        let original = "Hello, 世界!";
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, original).unwrap();
        assert_eq!(buf.len(), b_varchar_len(original));

        let mut cursor = buf.freeze();
        assert_eq!(read_b_varchar(&mut cursor).unwrap(), original);
    }

    #[test]
    fn test_us_varchar_empty() {
        let mut buf = BytesMut::new();
        write_us_varchar(&mut buf, "").unwrap();
        assert_eq!(&buf[..], &[0, 0]);

        let mut cursor = &buf[..];
        assert_eq!(read_us_varchar(&mut cursor).unwrap(), "");
    }

    #[test]
    fn test_truncated_string_is_incomplete() {
        // Claims 3 characters, carries one.
        let data = [0x03, b'a', 0x00];
        let mut cursor = &data[..];
        let err = read_b_varchar(&mut cursor).unwrap_err();
        assert!(err.is_incomplete());
    }

    #[test]
    fn test_b_varchar_too_long() {
        let long = "x".repeat(256);
        let mut buf = BytesMut::new();
        assert!(matches!(
            write_b_varchar(&mut buf, &long),
            Err(ProtocolError::StringTooLong { len: 256, max: 255 })
        ));
    }

    #[test]
    fn test_decode_utf16_bytes() {
        assert_eq!(decode_utf16_bytes(&[b'h', 0, b'i', 0]).unwrap(), "hi");
        assert_eq!(
            decode_utf16_bytes(&[b'h', 0, b'i']),
            Err(ProtocolError::InvalidUtf16)
        );
    }
}
