//! Little-endian primitives shared by the persisted table formats.
//!
//! Strings are stored as `int32 byteLength` followed by UTF-16LE code units,
//! zero-padded so the next field starts on a 4-byte boundary.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Bytes occupied by an `int32` field.
pub const INT32_SIZE: usize = 4;

/// Cap on unknown trailing header bytes accepted from disk.
pub const MAX_EXTRA_DATA_SIZE: usize = 8192;

/// Cursor over an in-memory table image.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns the unread tail and moves to the end.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Reads exactly `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if fewer than `len` bytes remain.
    pub fn read_bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Corrupted {
                reason: format!(
                    "{what}: needs {len} bytes at offset {}, only {} remain",
                    self.pos,
                    self.remaining()
                ),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads a little-endian `int32`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] on a short read.
    pub fn read_i32(&mut self, what: &str) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.read_bytes(INT32_SIZE, what)?))
    }

    /// Reads a little-endian `int32` that must not be negative.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] on a short read or a negative value.
    pub fn read_length(&mut self, what: &str) -> Result<usize> {
        let value = self.read_i32(what)?;
        usize::try_from(value)
            .map_err(|_| Error::Corrupted { reason: format!("{what} is negative: {value}") })
    }

    /// Reads a little-endian `int16`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] on a short read.
    pub fn read_i16(&mut self, what: &str) -> Result<i16> {
        Ok(LittleEndian::read_i16(self.read_bytes(2, what)?))
    }

    /// Reads a byte-length-prefixed, DWORD-padded UTF-16 string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the length is negative, odd, exceeds
    /// the buffer, or the code units are not valid UTF-16.
    pub fn read_unicode_string(&mut self, what: &str) -> Result<String> {
        let byte_len = self.read_length(what)?;
        if byte_len % 2 != 0 {
            return Err(Error::Corrupted {
                reason: format!("{what}: odd UTF-16 byte length {byte_len}"),
            });
        }
        let raw = self.read_bytes(byte_len, what)?;
        let units: Vec<u16> = raw.chunks_exact(2).map(LittleEndian::read_u16).collect();
        let value = String::from_utf16(&units)
            .map_err(|_| Error::Corrupted { reason: format!("{what}: invalid UTF-16") })?;
        self.read_bytes(padding_for(byte_len), what)?;
        Ok(value)
    }
}

/// Zero bytes needed after `len` bytes to reach a 4-byte boundary.
pub fn padding_for(len: usize) -> usize {
    (INT32_SIZE - len % INT32_SIZE) % INT32_SIZE
}

/// Appends a little-endian `int32`.
pub fn write_i32(buf: &mut Vec<u8>, value: i32) {
    let mut raw = [0u8; INT32_SIZE];
    LittleEndian::write_i32(&mut raw, value);
    buf.extend_from_slice(&raw);
}

/// Appends a little-endian `int16`.
pub fn write_i16(buf: &mut Vec<u8>, value: i16) {
    let mut raw = [0u8; 2];
    LittleEndian::write_i16(&mut raw, value);
    buf.extend_from_slice(&raw);
}

/// Appends a length as `int32`.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if `len` does not fit in an `int32`.
pub fn write_length(buf: &mut Vec<u8>, len: usize) -> Result<()> {
    let value = i32::try_from(len).map_err(|_| Error::InvalidArgument {
        reason: format!("length {len} exceeds the int32 range"),
    })?;
    write_i32(buf, value);
    Ok(())
}

/// Appends a byte-length-prefixed, DWORD-padded UTF-16 string.
///
/// # Errors
///
/// Returns [`Error::InvalidArgument`] if the encoded string is too long.
pub fn write_unicode_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let units: Vec<u16> = value.encode_utf16().collect();
    let byte_len = units.len() * 2;
    write_length(buf, byte_len)?;
    for unit in units {
        let mut raw = [0u8; 2];
        LittleEndian::write_u16(&mut raw, unit);
        buf.extend_from_slice(&raw);
    }
    buf.resize(buf.len() + padding_for(byte_len), 0);
    Ok(())
}

/// Encoded size of [`write_unicode_string`] output.
pub fn unicode_string_size(value: &str) -> usize {
    let byte_len = value.encode_utf16().count() * 2;
    INT32_SIZE + byte_len + padding_for(byte_len)
}

/// Validates the extra-bytes count derived from a header length field.
///
/// # Errors
///
/// Returns [`Error::Corrupted`] if the header is shorter than its fixed part
/// or claims more than [`MAX_EXTRA_DATA_SIZE`] unknown bytes.
pub fn extra_data_len(header_len: usize, fixed_len: usize, what: &str) -> Result<usize> {
    if header_len < fixed_len {
        return Err(Error::Corrupted {
            reason: format!("{what}: header length {header_len} below minimum {fixed_len}"),
        });
    }
    let extra = header_len - fixed_len;
    if extra > MAX_EXTRA_DATA_SIZE {
        return Err(Error::Corrupted {
            reason: format!("{what}: {extra} extra header bytes exceed {MAX_EXTRA_DATA_SIZE}"),
        });
    }
    Ok(extra)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unicode_string_is_dword_padded() {
        let mut buf = Vec::new();
        write_unicode_string(&mut buf, "abc").unwrap();
        // 4 length + 6 payload + 2 padding
        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[0..4], &6i32.to_le_bytes());
        assert_eq!(&buf[10..12], &[0, 0]);
        assert_eq!(unicode_string_size("abc"), 12);
    }

    #[test]
    fn test_unicode_string_even_length_has_no_padding() {
        let mut buf = Vec::new();
        write_unicode_string(&mut buf, "ab").unwrap();
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_read_unicode_string_non_ascii() {
        let mut buf = Vec::new();
        write_unicode_string(&mut buf, "\u{6}DataSpaces").unwrap();
        write_i32(&mut buf, 7);

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_unicode_string("name").unwrap(), "\u{6}DataSpaces");
        assert_eq!(reader.read_i32("tail").unwrap(), 7);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_read_unicode_string_rejects_odd_length() {
        let mut buf = Vec::new();
        write_i32(&mut buf, 3);
        buf.extend_from_slice(&[0x41, 0, 0x42, 0]);
        let err = ByteReader::new(&buf).read_unicode_string("label").unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }

    #[test]
    fn test_read_length_rejects_negative() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -8);
        let err = ByteReader::new(&buf).read_length("header length").unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }

    #[test]
    fn test_short_read_is_corrupted() {
        let err = ByteReader::new(&[1, 2]).read_i32("count").unwrap_err();
        assert!(matches!(err, Error::Corrupted { .. }));
    }

    #[test]
    fn test_extra_data_len_cap() {
        assert_eq!(extra_data_len(8, 8, "map").unwrap(), 0);
        assert_eq!(extra_data_len(8 + MAX_EXTRA_DATA_SIZE, 8, "map").unwrap(), MAX_EXTRA_DATA_SIZE);
        assert!(extra_data_len(9 + MAX_EXTRA_DATA_SIZE, 8, "map").is_err());
        assert!(extra_data_len(4, 8, "map").is_err());
    }
}
