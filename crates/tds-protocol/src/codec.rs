//! String codec helpers shared by the login, request and token modules.
//!
//! TDS 7.x carries every string as UTF-16LE with lengths counted in
//! characters. TDS 4.2 and 5.0 use the session charset with lengths counted
//! in bytes. The helpers take the [`CodecOptions`] of the session and pick
//! the right form.

use bytes::{Buf, BufMut};
use tds_types::{CodecOptions, decode_utf16};

use crate::error::ProtocolError;

/// Fail with [`ProtocolError::Incomplete`] unless `n` bytes are buffered.
pub fn need(src: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        return Err(ProtocolError::Incomplete {
            needed: n - src.remaining(),
        });
    }
    Ok(())
}

/// Read a string with a 1-byte length prefix.
pub fn read_b_varchar(src: &mut impl Buf, opts: &CodecOptions) -> Result<String, ProtocolError> {
    need(src, 1)?;
    let len = src.get_u8() as usize;
    read_string(src, len, opts)
}

/// Read a string with a 2-byte length prefix.
pub fn read_us_varchar(src: &mut impl Buf, opts: &CodecOptions) -> Result<String, ProtocolError> {
    need(src, 2)?;
    let len = src.get_u16_le() as usize;
    read_string(src, len, opts)
}

/// Read a string of `len` units (characters for UTF-16, bytes otherwise).
pub fn read_string(
    src: &mut impl Buf,
    len: usize,
    opts: &CodecOptions,
) -> Result<String, ProtocolError> {
    let byte_len = if opts.unicode { len * 2 } else { len };
    need(src, byte_len)?;
    let raw = src.copy_to_bytes(byte_len);
    if opts.unicode {
        decode_utf16(&raw).map_err(|_| ProtocolError::StringEncoding("invalid UTF-16".into()))
    } else {
        let (text, _) = opts.charset.decode_without_bom_handling(&raw);
        Ok(text.into_owned())
    }
}

/// Encode a string in the session's wire form, without a length prefix.
///
/// Returns the bytes and the length in wire units.
pub fn encode_string(s: &str, opts: &CodecOptions) -> Result<(Vec<u8>, usize), ProtocolError> {
    if opts.unicode {
        let mut out = Vec::with_capacity(s.len() * 2);
        let mut units = 0;
        for c in s.encode_utf16() {
            out.extend_from_slice(&c.to_le_bytes());
            units += 1;
        }
        Ok((out, units))
    } else {
        let (bytes, _, unmappable) = opts.charset.encode(s);
        if unmappable {
            return Err(ProtocolError::StringEncoding(format!(
                "'{s}' cannot be represented in {}",
                opts.charset.name()
            )));
        }
        let bytes = bytes.into_owned();
        let units = bytes.len();
        Ok((bytes, units))
    }
}

/// Write a string with a 1-byte length prefix.
pub fn write_b_varchar(
    dst: &mut impl BufMut,
    s: &str,
    opts: &CodecOptions,
) -> Result<(), ProtocolError> {
    let (bytes, units) = encode_string(s, opts)?;
    let len = u8::try_from(units).map_err(|_| ProtocolError::FieldTooLong {
        field: "b_varchar",
        len: units,
        max: u8::MAX as usize,
    })?;
    dst.put_u8(len);
    dst.put_slice(&bytes);
    Ok(())
}

/// Write a string with a 2-byte length prefix.
pub fn write_us_varchar(
    dst: &mut impl BufMut,
    s: &str,
    opts: &CodecOptions,
) -> Result<(), ProtocolError> {
    let (bytes, units) = encode_string(s, opts)?;
    let len = u16::try_from(units).map_err(|_| ProtocolError::FieldTooLong {
        field: "us_varchar",
        len: units,
        max: u16::MAX as usize,
    })?;
    dst.put_u16_le(len);
    dst.put_slice(&bytes);
    Ok(())
}

/// Write a UTF-16LE string without length prefix.
pub fn write_utf16_string(dst: &mut impl BufMut, s: &str) {
    for c in s.encode_utf16() {
        dst.put_u16_le(c);
    }
}

/// Calculate the byte length of a UTF-16 encoded string.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_b_varchar_unicode() {
        let opts = CodecOptions::tds7(true);
        let mut buf = BytesMut::new();
        write_b_varchar(&mut buf, "Hello, 世界!", &opts).unwrap();
        assert_eq!(buf[0], 10);

        let mut cursor = buf.freeze();
        assert_eq!(read_b_varchar(&mut cursor, &opts).unwrap(), "Hello, 世界!");
    }

    #[test]
    fn test_us_varchar_legacy_charset() {
        let opts = CodecOptions::legacy();
        let mut buf = BytesMut::new();
        write_us_varchar(&mut buf, "café", &opts).unwrap();
        // windows-1252 encodes é as a single byte
        assert_eq!(&buf[..], &[4, 0, b'c', b'a', b'f', 0xE9]);

        let mut cursor = &buf[..];
        assert_eq!(read_us_varchar(&mut cursor, &opts).unwrap(), "café");
    }

    #[test]
    fn test_short_read_is_incomplete() {
        let opts = CodecOptions::tds7(true);
        let mut cursor: &[u8] = &[3, b'a', 0];
        let err = read_b_varchar(&mut cursor, &opts).unwrap_err();
        assert!(err.is_incomplete());
    }

    #[test]
    fn test_b_varchar_too_long() {
        let opts = CodecOptions::tds7(true);
        let long = "x".repeat(256);
        let mut buf = BytesMut::new();
        assert!(matches!(
            write_b_varchar(&mut buf, &long, &opts),
            Err(ProtocolError::FieldTooLong { len: 256, .. })
        ));
    }

    #[test]
    fn test_unmappable_legacy_string() {
        let opts = CodecOptions::legacy();
        assert!(matches!(
            encode_string("世界", &opts),
            Err(ProtocolError::StringEncoding(_))
        ));
    }

    #[test]
    fn test_utf16_byte_len() {
        assert_eq!(utf16_byte_len("Hello"), 10);
        assert_eq!(utf16_byte_len("世界"), 4);
    }
}
