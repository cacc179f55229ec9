//! Cursor-based big-endian reader and growable writer.
//!
//! Every protocol structure in the stack is built from these two types.
//! Reads never panic: running past the end yields [`OscarError::Truncated`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoding::{Charset, TextCodec};
use crate::error::OscarError;

// ── ByteReader ───────────────────────────────────────────────────

/// Reads fixed-width integers and byte runs from a borrowed buffer.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current cursor offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// `true` while the cursor has not reached the end of the buffer.
    pub fn has_more_data(&self) -> bool {
        self.pos < self.data.len()
    }

    pub fn read_u8(&mut self) -> Result<u8, OscarError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, OscarError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, OscarError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Borrow the next `len` bytes and advance past them.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], OscarError> {
        if len > self.remaining() {
            return Err(OscarError::Truncated {
                wanted: len,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..self.pos])
    }

    /// Read a fixed-size array, e.g. an 8-byte cookie.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], OscarError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// A byte run prefixed by a one-byte length.
    pub fn read_u8_prefixed(&mut self) -> Result<&'a [u8], OscarError> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    /// A byte run prefixed by a two-byte length.
    pub fn read_u16_prefixed(&mut self) -> Result<&'a [u8], OscarError> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    /// Read `len` bytes and decode them with `charset`.
    pub fn read_string(
        &mut self,
        len: usize,
        charset: Charset,
        codec: &dyn TextCodec,
    ) -> Result<String, OscarError> {
        let raw = self.read_bytes(len)?;
        Ok(codec.decode(raw, charset))
    }

    /// A one-byte-length-prefixed name, decoded as ASCII/UTF-8.
    ///
    /// Screen names and room cookies on the wire are always 7-bit.
    pub fn read_name(&mut self) -> Result<String, OscarError> {
        let raw = self.read_u8_prefixed()?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Everything after the cursor; the reader ends up exhausted.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, len: usize) -> Result<(), OscarError> {
        self.read_bytes(len).map(|_| ())
    }
}

// ── ByteWriter ───────────────────────────────────────────────────

/// Appends big-endian primitives to a growable buffer.
#[derive(Debug, Clone, Default)]
pub struct ByteWriter {
    buf: BytesMut,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    /// Write `data` behind a one-byte length. Longer runs are truncated
    /// to 255 bytes.
    pub fn write_u8_prefixed(&mut self, data: &[u8]) -> &mut Self {
        let len = data.len().min(u8::MAX as usize);
        self.write_u8(len as u8).write_bytes(&data[..len])
    }

    /// Write `data` behind a two-byte length, truncating at 65535 bytes.
    pub fn write_u16_prefixed(&mut self, data: &[u8]) -> &mut Self {
        let len = data.len().min(u16::MAX as usize);
        self.write_u16(len as u16).write_bytes(&data[..len])
    }

    /// Encode `text` with `charset` and append the raw bytes.
    pub fn write_string(
        &mut self,
        text: &str,
        charset: Charset,
        codec: &dyn TextCodec,
    ) -> Result<&mut Self, OscarError> {
        let raw = codec.encode(text, charset)?;
        Ok(self.write_bytes(&raw))
    }

    /// A one-byte-length-prefixed 7-bit name.
    pub fn write_name(&mut self, name: &str) -> &mut Self {
        self.write_u8_prefixed(name.as_bytes())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

// ── Tests ────────────────────────────────────────────────────────
