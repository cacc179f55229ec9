//! Type-length-value containers.
//!
//! ```text
//! [u16 type][u16 length][value bytes] [u16 type][u16 length][value] ...
//! ```
//!
//! A container is an ordered run of entries with duplicates permitted and
//! no outer length, unless it is nested inside another entry's value.
//! Typed accessors on [`TlvBlock`] are lenient: an absent or wrongly sized
//! entry reads as the type's default, never as an error.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::buffer::{ByteReader, ByteWriter};
use crate::encoding::{Charset, TextCodec};
use crate::error::OscarError;

/// One decoded entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub kind: u16,
    pub value: Bytes,
}

impl Tlv {
    pub fn new(kind: u16, value: impl Into<Bytes>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

// ── TlvBlock (read side) ─────────────────────────────────────────

/// A parsed container, entries kept in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvBlock {
    entries: Vec<Tlv>,
}

impl TlvBlock {
    /// Parse a whole buffer as a container.
    ///
    /// A trailing entry whose length runs past the buffer is dropped and
    /// parsing stops there; everything before it is kept.
    pub fn parse(data: &[u8]) -> Self {
        let mut reader = ByteReader::new(data);
        let mut entries = Vec::new();
        while reader.remaining() >= 4 {
            match read_entry(&mut reader) {
                Ok(tlv) => entries.push(tlv),
                Err(e) => {
                    tracing::debug!("dropping malformed trailing TLV: {e}");
                    break;
                }
            }
        }
        Self { entries }
    }

    /// Read exactly `count` entries from `reader`.
    pub fn read_counted(reader: &mut ByteReader<'_>, count: usize) -> Result<Self, OscarError> {
        let mut entries = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            entries.push(read_entry(reader)?);
        }
        Ok(Self { entries })
    }

    /// Read a block prefixed by a u16 entry count.
    pub fn read_count_prefixed(reader: &mut ByteReader<'_>) -> Result<Self, OscarError> {
        let count = reader.read_u16()? as usize;
        Self::read_counted(reader, count)
    }

    /// Read a block prefixed by a u16 byte length.
    pub fn read_length_prefixed(reader: &mut ByteReader<'_>) -> Result<Self, OscarError> {
        let raw = reader.read_u16_prefixed()?;
        Ok(Self::parse(raw))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tlv> {
        self.entries.iter()
    }

    /// The value of the first entry of `kind`.
    pub fn read(&self, kind: u16) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.value.as_ref())
    }

    /// Values of every entry of `kind`, in order.
    pub fn read_all(&self, kind: u16) -> impl Iterator<Item = &[u8]> {
        self.entries
            .iter()
            .filter(move |t| t.kind == kind)
            .map(|t| t.value.as_ref())
    }

    pub fn exists(&self, kind: u16) -> bool {
        self.entries.iter().any(|t| t.kind == kind)
    }

    pub fn read_u8(&self, kind: u16) -> u8 {
        match self.read(kind) {
            Some([b]) => *b,
            _ => 0,
        }
    }

    pub fn read_u16(&self, kind: u16) -> u16 {
        match self.read(kind) {
            Some([a, b]) => u16::from_be_bytes([*a, *b]),
            _ => 0,
        }
    }

    pub fn read_u32(&self, kind: u16) -> u32 {
        match self.read(kind) {
            Some([a, b, c, d]) => u32::from_be_bytes([*a, *b, *c, *d]),
            _ => 0,
        }
    }

    /// Decode the entry as text; absent entries read as `""`.
    pub fn read_string(&self, kind: u16, charset: Charset, codec: &dyn TextCodec) -> String {
        self.read(kind)
            .map(|raw| codec.decode(raw, charset))
            .unwrap_or_default()
    }

    /// A 7-bit string entry such as a charset name or address.
    pub fn read_ascii(&self, kind: u16) -> String {
        self.read(kind)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default()
    }

    /// A u32 count of seconds since the Unix epoch; absent reads as the epoch.
    pub fn read_timestamp(&self, kind: u16) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.read_u32(kind) as u64)
    }

    /// Parse the entry's value as a nested container.
    pub fn read_nested(&self, kind: u16) -> Option<TlvBlock> {
        self.read(kind).map(TlvBlock::parse)
    }
}

impl From<Vec<Tlv>> for TlvBlock {
    fn from(entries: Vec<Tlv>) -> Self {
        Self { entries }
    }
}

fn read_entry(reader: &mut ByteReader<'_>) -> Result<Tlv, OscarError> {
    let kind = reader.read_u16()?;
    let value = reader.read_u16_prefixed()?;
    Ok(Tlv::new(kind, Bytes::copy_from_slice(value)))
}

// ── TlvWriter (write side) ───────────────────────────────────────

/// Builds a container; entries serialize in insertion order.
#[derive(Debug, Clone, Default)]
pub struct TlvWriter {
    entries: Vec<Tlv>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn write(&mut self, kind: u16, value: &[u8]) -> &mut Self {
        self.entries.push(Tlv::new(kind, Bytes::copy_from_slice(value)));
        self
    }

    pub fn write_u8(&mut self, kind: u16, v: u8) -> &mut Self {
        self.write(kind, &[v])
    }

    pub fn write_u16(&mut self, kind: u16, v: u16) -> &mut Self {
        self.write(kind, &v.to_be_bytes())
    }

    pub fn write_u32(&mut self, kind: u16, v: u32) -> &mut Self {
        self.write(kind, &v.to_be_bytes())
    }

    pub fn write_str(&mut self, kind: u16, s: &str) -> &mut Self {
        self.write(kind, s.as_bytes())
    }

    pub fn write_timestamp(&mut self, kind: u16, at: SystemTime) -> &mut Self {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
            .unwrap_or(0);
        self.write_u32(kind, secs)
    }

    /// A zero-length presence flag.
    pub fn write_empty(&mut self, kind: u16) -> &mut Self {
        self.write(kind, &[])
    }

    /// Embed another container's serialized bytes as this entry's value.
    pub fn write_nested(&mut self, kind: u16, inner: &TlvWriter) -> &mut Self {
        let bytes = inner.serialize();
        self.write(kind, &bytes)
    }

    /// Open a nested scope under `kind`.
    ///
    /// The scope serializes into this container exactly once when `build`
    /// returns `Ok`; on `Err` nothing is written and the error propagates.
    pub fn scope<F>(&mut self, kind: u16, build: F) -> Result<&mut Self, OscarError>
    where
        F: FnOnce(&mut TlvWriter) -> Result<(), OscarError>,
    {
        let mut inner = TlvWriter::new();
        build(&mut inner)?;
        Ok(self.write_nested(kind, &inner))
    }

    /// Entries as `type+length+value` triples, no outer wrapper.
    pub fn serialize(&self) -> Bytes {
        let mut w = ByteWriter::with_capacity(self.encoded_len());
        self.write_into(&mut w);
        w.into_bytes()
    }

    /// Append the entries to an existing writer.
    pub fn write_into(&self, w: &mut ByteWriter) {
        for tlv in &self.entries {
            w.write_u16(tlv.kind).write_u16_prefixed(&tlv.value);
        }
    }

    /// Append a u16 entry count followed by the entries.
    pub fn write_counted_into(&self, w: &mut ByteWriter) {
        w.write_u16(self.entries.len() as u16);
        self.write_into(w);
    }

    fn encoded_len(&self) -> usize {
        self.entries.iter().map(|t| 4 + t.value.len()).sum()
    }
}

// ── Tests ────────────────────────────────────────────────────────
