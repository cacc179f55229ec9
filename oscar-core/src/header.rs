//! Fixed-size headers: the 6-byte frame header and the 10-byte
//! sub-message header.
//!
//! ```text
//! frame:       [0x2A][u8 channel][u16 sequence][u16 body length]
//! sub-message: [u16 family][u16 subtype][u16 flags][u32 request id]
//! ```

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::OscarError;
use crate::flags::SnacFlags;
use crate::message::Channel;

/// Every frame starts with this byte.
pub const FRAME_MARKER: u8 = 0x2A;

/// Encoded size of [`FrameHeader`].
pub const FRAME_HEADER_LEN: usize = 6;

/// Encoded size of [`SnacHeader`].
pub const SNAC_HEADER_LEN: usize = 10;

// ── FrameHeader ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel: Channel,
    pub sequence: u16,
    pub length: u16,
}

impl FrameHeader {
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_LEN] {
        let seq = self.sequence.to_be_bytes();
        let len = self.length.to_be_bytes();
        [
            FRAME_MARKER,
            self.channel as u8,
            seq[0],
            seq[1],
            len[0],
            len[1],
        ]
    }

    /// Parse the first six bytes of `bytes`.
    ///
    /// A wrong marker is reported before anything else so the caller can
    /// tear the connection down without reading further.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OscarError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(OscarError::Truncated {
                wanted: FRAME_HEADER_LEN,
                remaining: bytes.len(),
            });
        }
        if bytes[0] != FRAME_MARKER {
            return Err(OscarError::InvalidMarker(bytes[0]));
        }
        Ok(Self {
            channel: Channel::try_from(bytes[1])?,
            sequence: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }
}

// ── SnacHeader ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnacHeader {
    pub family: u16,
    pub subtype: u16,
    pub flags: SnacFlags,
    pub request_id: u32,
}

impl SnacHeader {
    pub fn new(family: u16, subtype: u16, request_id: u32) -> Self {
        Self {
            family,
            subtype,
            flags: SnacFlags::empty(),
            request_id,
        }
    }

    pub fn write(&self, w: &mut ByteWriter) {
        w.write_u16(self.family)
            .write_u16(self.subtype)
            .write_u16(self.flags.bits())
            .write_u32(self.request_id);
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self, OscarError> {
        Ok(Self {
            family: r.read_u16()?,
            subtype: r.read_u16()?,
            flags: SnacFlags::from_bits_retain(r.read_u16()?),
            request_id: r.read_u32()?,
        })
    }

    /// The `(family, subtype)` dispatch key.
    pub fn key(&self) -> (u16, u16) {
        (self.family, self.subtype)
    }
}
