//! Frames and the sub-messages they carry.

use bytes::Bytes;

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::OscarError;
use crate::flags::SnacFlags;
use crate::header::{SNAC_HEADER_LEN, SnacHeader};
use crate::message::{Channel, family};
use crate::tlv::TlvWriter;

/// Version word sent on the negotiation channel in both directions.
pub const PROTOCOL_VERSION: u32 = 0x0000_0001;

/// TLV carrying the authorization token in the open handshake.
pub const TLV_AUTH_TOKEN: u16 = 0x0006;

/// Default ceiling on a frame body.
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;

// ── Frame ────────────────────────────────────────────────────────

/// One frame on the wire.
///
/// `sequence` is filled in by the codec on encode; the value set by the
/// caller is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: Channel,
    pub sequence: u16,
    pub body: Bytes,
}

impl Frame {
    pub fn new(channel: Channel, body: impl Into<Bytes>) -> Self {
        Self {
            channel,
            sequence: 0,
            body: body.into(),
        }
    }

    pub fn keepalive() -> Self {
        Self::new(Channel::KeepAlive, Bytes::new())
    }

    /// The client's open-handshake frame, optionally presenting a token.
    pub fn hello(token: Option<&[u8]>) -> Self {
        let mut w = ByteWriter::with_capacity(8);
        w.write_u32(PROTOCOL_VERSION);
        if let Some(token) = token {
            let mut tlvs = TlvWriter::new();
            tlvs.write(TLV_AUTH_TOKEN, token);
            tlvs.write_into(&mut w);
        }
        Self::new(Channel::Negotiate, w.into_bytes())
    }

    /// An empty sign-off frame.
    pub fn close() -> Self {
        Self::new(Channel::Close, Bytes::new())
    }

    pub fn data(snac: &Snac) -> Self {
        Self::new(Channel::Data, snac.to_bytes())
    }
}

// ── Snac ─────────────────────────────────────────────────────────

/// A typed sub-message: header plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snac {
    pub header: SnacHeader,
    pub body: Bytes,
}

impl Snac {
    pub fn new(family: u16, subtype: u16, request_id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            header: SnacHeader::new(family, subtype, request_id),
            body: body.into(),
        }
    }

    pub fn family(&self) -> u16 {
        self.header.family
    }

    pub fn subtype(&self) -> u16 {
        self.header.subtype
    }

    pub fn request_id(&self) -> u32 {
        self.header.request_id
    }

    pub fn is_error(&self) -> bool {
        self.header.subtype == family::ERROR_SUBTYPE
    }

    /// The error code of an error reply, if the body carries one.
    pub fn error_code(&self) -> Option<u16> {
        if !self.is_error() {
            return None;
        }
        ByteReader::new(&self.body).read_u16().ok()
    }

    pub fn reader(&self) -> ByteReader<'_> {
        ByteReader::new(&self.body)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut w = ByteWriter::with_capacity(SNAC_HEADER_LEN + self.body.len());
        self.header.write(&mut w);
        w.write_bytes(&self.body);
        w.into_bytes()
    }

    /// Parse a data-channel frame body.
    ///
    /// The extra-info block flagged by `HAS_EXTRA_INFO` is skipped so
    /// handlers always see the plain body.
    pub fn parse(frame_body: &[u8]) -> Result<Self, OscarError> {
        let mut r = ByteReader::new(frame_body);
        let header = SnacHeader::read(&mut r)?;
        if header.flags.contains(SnacFlags::HAS_EXTRA_INFO) {
            let extra = r.read_u16()? as usize;
            r.skip(extra)?;
        }
        Ok(Self {
            header,
            body: Bytes::copy_from_slice(r.read_rest()),
        })
    }
}
