//! Native protocol primitives.
//!
//! LEB128 varints, varint-prefixed strings and little-endian scalars.
//! Writers append to a `BytesMut`; [`WireReader`] parses a borrowed slice and
//! reports [`WireError::Incomplete`] when the slice ends mid-value, so stream
//! decoders can wait for more bytes and retry from the packet start.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Upper bound for a single string or blob on the wire (1 GiB).
pub const MAX_STRING_LEN: u64 = 1 << 30;

/// Errors raised while parsing wire primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// The buffer ended before the value did.
    #[error("unexpected end of buffer")]
    Incomplete,
    /// The bytes can never form a valid value.
    #[error("{0}")]
    Malformed(String),
}

pub type WireResult<T> = Result<T, WireError>;

/// Append-side primitives for `BytesMut`.
pub trait WireWrite {
    fn put_uvarint(&mut self, value: u64);
    fn put_varint(&mut self, value: i64);
    fn put_str(&mut self, value: &str);
    fn put_blob(&mut self, value: &[u8]);
    fn put_bool(&mut self, value: bool);
}

impl WireWrite for BytesMut {
    #[inline]
    fn put_uvarint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.put_u8((value as u8) | 0x80);
            value >>= 7;
        }
        self.put_u8(value as u8);
    }

    /// Zigzag-encoded signed varint.
    #[inline]
    fn put_varint(&mut self, value: i64) {
        self.put_uvarint(((value << 1) ^ (value >> 63)) as u64);
    }

    #[inline]
    fn put_str(&mut self, value: &str) {
        self.put_blob(value.as_bytes());
    }

    #[inline]
    fn put_blob(&mut self, value: &[u8]) {
        self.put_uvarint(value.len() as u64);
        self.extend_from_slice(value);
    }

    #[inline]
    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }
}

/// Cursor over a borrowed byte slice.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unconsumed tail of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn advance(&mut self, n: usize) -> WireResult<()> {
        if self.remaining() < n {
            return Err(WireError::Incomplete);
        }
        self.pos += n;
        Ok(())
    }

    pub fn bytes(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::Incomplete);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> WireResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn bool(&mut self) -> WireResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::Malformed(format!("invalid bool byte {}", other))),
        }
    }

    pub fn i32_le(&mut self) -> WireResult<i32> {
        let b = self.bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u32_le(&mut self) -> WireResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn uvarint(&mut self) -> WireResult<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::Malformed("varint longer than 10 bytes".to_string()))
    }

    pub fn varint(&mut self) -> WireResult<i64> {
        let raw = self.uvarint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    pub fn blob(&mut self) -> WireResult<&'a [u8]> {
        let len = self.uvarint()?;
        if len > MAX_STRING_LEN {
            return Err(WireError::Malformed(format!("string length {} exceeds limit", len)));
        }
        self.bytes(len as usize)
    }

    pub fn string(&mut self) -> WireResult<String> {
        let raw = self.blob()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| WireError::Malformed("string is not valid UTF-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_layout() {
        let mut buf = BytesMut::new();
        buf.put_uvarint(0);
        buf.put_uvarint(127);
        buf.put_uvarint(128);
        buf.put_uvarint(54327);
        assert_eq!(&buf[..4], &[0x00, 0x7f, 0x80, 0x01]);

        let mut r = WireReader::new(&buf);
        assert_eq!(r.uvarint().unwrap(), 0);
        assert_eq!(r.uvarint().unwrap(), 127);
        assert_eq!(r.uvarint().unwrap(), 128);
        assert_eq!(r.uvarint().unwrap(), 54327);
        assert!(r.is_empty());
    }

    #[test]
    fn test_signed_varint_zigzag() {
        let mut buf = BytesMut::new();
        buf.put_varint(-1);
        buf.put_varint(i64::MIN);
        assert_eq!(buf[0], 0x01);

        let mut r = WireReader::new(&buf);
        assert_eq!(r.varint().unwrap(), -1);
        assert_eq!(r.varint().unwrap(), i64::MIN);
    }

    #[test]
    fn test_truncated_string_is_incomplete() {
        let mut buf = BytesMut::new();
        buf.put_str("default");
        let mut r = WireReader::new(&buf[..4]);
        assert_eq!(r.string(), Err(WireError::Incomplete));
    }

    #[test]
    fn test_overlong_varint_is_malformed() {
        let buf = [0xffu8; 11];
        let mut r = WireReader::new(&buf);
        assert!(matches!(r.uvarint(), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_invalid_bool() {
        let mut r = WireReader::new(&[2]);
        assert!(matches!(r.bool(), Err(WireError::Malformed(_))));
    }
}
