//! Rendezvous blocks and the channel-2 ICBM envelopes that carry them.
//!
//! ```text
//! block:   [u16 kind][8B cookie][16B capability][TLVs]
//! to host: [8B cookie][u16 channel=2][u8 name len][name][TLV 0x0005 block][TLV 0x0003]
//! to us:   [8B cookie][u16 channel][user info][TLVs incl. 0x0005 block]
//! ```

use std::net::Ipv4Addr;

use bytes::Bytes;

use crate::buffer::{ByteReader, ByteWriter};
use crate::encoding::{Charset, TextCodec, encode_narrowest};
use crate::error::OscarError;
use crate::rendezvous::{Capability, Cookie};
use crate::tlv::{TlvBlock, TlvWriter};
use crate::user::UserInfo;

/// ICBM channel carrying rendezvous blocks.
pub const RENDEZVOUS_CHANNEL: u16 = 0x0002;

const TLV_REQUEST_HOST_ACK: u16 = 0x0003;
const TLV_RENDEZVOUS_DATA: u16 = 0x0005;

// Block attributes.
const TLV_PROXY_IP: u16 = 0x0002;
const TLV_CLIENT_IP: u16 = 0x0003;
const TLV_VERIFIED_IP: u16 = 0x0004;
const TLV_PORT: u16 = 0x0005;
const TLV_STAGE: u16 = 0x000A;
const TLV_ERROR_CODE: u16 = 0x000B;
const TLV_INVITATION: u16 = 0x000C;
const TLV_CHARSET: u16 = 0x000D;
const TLV_LANGUAGE: u16 = 0x000E;
const TLV_USE_PROXY: u16 = 0x0010;
const TLV_IP_CHECK: u16 = 0x0016;
const TLV_PORT_CHECK: u16 = 0x0017;
const TLV_SERVICE_DATA: u16 = 0x2711;

// ── RendezvousKind ───────────────────────────────────────────────

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RendezvousKind {
    Propose = 0x0000,
    Cancel = 0x0001,
    Accept = 0x0002,
}

impl TryFrom<u16> for RendezvousKind {
    type Error = OscarError;

    fn try_from(value: u16) -> Result<Self, OscarError> {
        match value {
            0x0000 => Ok(Self::Propose),
            0x0001 => Ok(Self::Cancel),
            0x0002 => Ok(Self::Accept),
            _ => Err(OscarError::UnknownVariant {
                type_name: "RendezvousKind",
                value: value as u32,
            }),
        }
    }
}

// ── RendezvousMessage ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousMessage {
    pub kind: RendezvousKind,
    pub cookie: Cookie,
    pub capability: Capability,
    /// 1 = direct, 2 and 3 = proxy stages.
    pub stage: u16,
    pub proxy_ip: Option<Ipv4Addr>,
    pub client_ip: Option<Ipv4Addr>,
    pub verified_ip: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub use_proxy: bool,
    /// Error or cancel reason; zero is the default "no error".
    pub error_code: u16,
    pub invitation: Option<String>,
    pub language: Option<String>,
    /// Feature payload, opaque to the engine.
    pub service_data: Option<Bytes>,
}

impl RendezvousMessage {
    pub fn new(kind: RendezvousKind, cookie: Cookie, capability: Capability) -> Self {
        Self {
            kind,
            cookie,
            capability,
            stage: 1,
            proxy_ip: None,
            client_ip: None,
            verified_ip: None,
            port: None,
            use_proxy: false,
            error_code: 0,
            invitation: None,
            language: None,
            service_data: None,
        }
    }

    pub fn cancel(cookie: Cookie, capability: Capability, reason: u16) -> Self {
        Self {
            error_code: reason,
            ..Self::new(RendezvousKind::Cancel, cookie, capability)
        }
    }

    pub fn accept(cookie: Cookie, capability: Capability) -> Self {
        Self::new(RendezvousKind::Accept, cookie, capability)
    }

    pub fn encode_block(&self, codec: &dyn TextCodec) -> Result<Bytes, OscarError> {
        let mut w = ByteWriter::with_capacity(64);
        w.write_u16(self.kind as u16);
        self.cookie.write(&mut w);
        self.capability.write(&mut w);

        let mut tlvs = TlvWriter::new();
        if self.kind == RendezvousKind::Propose {
            tlvs.write_u16(TLV_STAGE, self.stage);
        }
        if let Some(ip) = self.proxy_ip {
            tlvs.write_u32(TLV_PROXY_IP, u32::from(ip));
        }
        if let Some(ip) = self.client_ip {
            tlvs.write_u32(TLV_CLIENT_IP, u32::from(ip));
        }
        if let Some(ip) = self.verified_ip {
            tlvs.write_u32(TLV_VERIFIED_IP, u32::from(ip));
        }
        if let Some(ip) = self.proxy_ip.or(self.client_ip) {
            tlvs.write_u32(TLV_IP_CHECK, !u32::from(ip));
        }
        if let Some(port) = self.port {
            tlvs.write_u16(TLV_PORT, port);
            tlvs.write_u16(TLV_PORT_CHECK, !port);
        }
        if self.use_proxy {
            tlvs.write_empty(TLV_USE_PROXY);
        }
        if self.error_code != 0 || self.kind == RendezvousKind::Cancel {
            tlvs.write_u16(TLV_ERROR_CODE, self.error_code);
        }
        if let Some(text) = &self.invitation {
            let (charset, raw) = encode_narrowest(text, codec)?;
            tlvs.write(TLV_INVITATION, &raw);
            tlvs.write_str(TLV_CHARSET, charset.wire_name());
        }
        if let Some(language) = &self.language {
            tlvs.write_str(TLV_LANGUAGE, language);
        }
        if let Some(data) = &self.service_data {
            tlvs.write(TLV_SERVICE_DATA, data);
        }
        tlvs.write_into(&mut w);
        Ok(w.into_bytes())
    }

    pub fn parse_block(data: &[u8], codec: &dyn TextCodec) -> Result<Self, OscarError> {
        let mut r = ByteReader::new(data);
        let kind = RendezvousKind::try_from(r.read_u16()?)?;
        let cookie = Cookie::read(&mut r)?;
        let capability = Capability::read(&mut r)?;
        let tlvs = TlvBlock::parse(r.read_rest());

        let ip = |kind: u16| match tlvs.read(kind) {
            Some(raw) if raw.len() == 4 => Some(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3])),
            _ => None,
        };
        let invitation = tlvs.read(TLV_INVITATION).map(|raw| {
            let charset = Charset::from_wire_name(&tlvs.read_ascii(TLV_CHARSET))
                .unwrap_or(Charset::Utf8);
            codec.decode(raw, charset)
        });

        Ok(Self {
            kind,
            cookie,
            capability,
            stage: if tlvs.exists(TLV_STAGE) {
                tlvs.read_u16(TLV_STAGE)
            } else {
                1
            },
            proxy_ip: ip(TLV_PROXY_IP),
            client_ip: ip(TLV_CLIENT_IP),
            verified_ip: ip(TLV_VERIFIED_IP),
            port: tlvs
                .read(TLV_PORT)
                .filter(|raw| raw.len() == 2)
                .map(|raw| u16::from_be_bytes([raw[0], raw[1]])),
            use_proxy: tlvs.exists(TLV_USE_PROXY),
            error_code: tlvs.read_u16(TLV_ERROR_CODE),
            invitation,
            language: tlvs
                .read(TLV_LANGUAGE)
                .map(|raw| String::from_utf8_lossy(raw).into_owned()),
            service_data: tlvs.read(TLV_SERVICE_DATA).map(Bytes::copy_from_slice),
        })
    }

    /// Body of an ICBM channel-2 message to `peer`.
    pub fn to_icbm(&self, peer: &str, codec: &dyn TextCodec) -> Result<Bytes, OscarError> {
        let block = self.encode_block(codec)?;
        let mut w = ByteWriter::with_capacity(block.len() + 32);
        self.cookie.write(&mut w);
        w.write_u16(RENDEZVOUS_CHANNEL).write_name(peer);
        let mut tlvs = TlvWriter::new();
        tlvs.write(TLV_RENDEZVOUS_DATA, &block);
        if self.kind == RendezvousKind::Propose {
            tlvs.write_empty(TLV_REQUEST_HOST_ACK);
        }
        tlvs.write_into(&mut w);
        Ok(w.into_bytes())
    }
}

// ── Incoming ─────────────────────────────────────────────────────

/// A rendezvous block delivered by the server, with its sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRendezvous {
    pub sender: UserInfo,
    pub message: RendezvousMessage,
}

impl IncomingRendezvous {
    /// Parse an ICBM message-to-client body. Other channels yield `None`.
    pub fn parse(body: &[u8], codec: &dyn TextCodec) -> Result<Option<Self>, OscarError> {
        let mut r = ByteReader::new(body);
        let _cookie = Cookie::read(&mut r)?;
        if r.read_u16()? != RENDEZVOUS_CHANNEL {
            return Ok(None);
        }
        let sender = UserInfo::read(&mut r)?;
        let tlvs = TlvBlock::parse(r.read_rest());
        let block = tlvs
            .read(TLV_RENDEZVOUS_DATA)
            .ok_or(OscarError::ProtocolViolation("rendezvous message without data block"))?;
        Ok(Some(Self {
            sender,
            message: RendezvousMessage::parse_block(block, codec)?,
        }))
    }

    /// Encode as the server would deliver it.
    pub fn to_icbm(&self, codec: &dyn TextCodec) -> Result<Bytes, OscarError> {
        let block = self.message.encode_block(codec)?;
        let mut w = ByteWriter::new();
        self.message.cookie.write(&mut w);
        w.write_u16(RENDEZVOUS_CHANNEL);
        self.sender.write(&mut w);
        let mut tlvs = TlvWriter::new();
        tlvs.write(TLV_RENDEZVOUS_DATA, &block);
        tlvs.write_into(&mut w);
        Ok(w.into_bytes())
    }
}

/// ICBM client error: the peer's client rejected a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    pub cookie: Cookie,
    pub channel: u16,
    pub peer: String,
    pub reason: u16,
}

impl ClientError {
    pub fn parse(body: &[u8]) -> Result<Self, OscarError> {
        let mut r = ByteReader::new(body);
        Ok(Self {
            cookie: Cookie::read(&mut r)?,
            channel: r.read_u16()?,
            peer: r.read_name()?,
            reason: r.read_u16()?,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut w = ByteWriter::new();
        self.cookie.write(&mut w);
        w.write_u16(self.channel)
            .write_name(&self.peer)
            .write_u16(self.reason);
        w.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::DefaultTextCodec;

    fn cookie() -> Cookie {
        Cookie([1, 2, 3, 4, 5, 6, 7, 8])
    }

    #[test]
    fn propose_block_carries_addresses() {
        let msg = RendezvousMessage {
            client_ip: Some(Ipv4Addr::new(192, 168, 1, 2)),
            verified_ip: Some(Ipv4Addr::new(203, 0, 113, 9)),
            port: Some(5190),
            invitation: Some("take this".into()),
            ..RendezvousMessage::new(RendezvousKind::Propose, cookie(), Capability::FILE_TRANSFER)
        };
        let raw = msg.encode_block(&DefaultTextCodec).unwrap();
        assert_eq!(&raw[..2], &[0x00, 0x00]);
        assert_eq!(&raw[2..10], cookie().as_bytes());

        let parsed = RendezvousMessage::parse_block(&raw, &DefaultTextCodec).unwrap();
        assert_eq!(parsed, msg);

        let tlvs = TlvBlock::parse(&raw[26..]);
        assert_eq!(tlvs.read_u32(TLV_IP_CHECK), !0xC0A8_0102);
        assert_eq!(tlvs.read_u16(TLV_PORT_CHECK), !5190);
    }

    #[test]
    fn proxy_propose_marks_use_proxy() {
        let msg = RendezvousMessage {
            stage: 2,
            proxy_ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
            port: Some(4443),
            use_proxy: true,
            ..RendezvousMessage::new(RendezvousKind::Propose, cookie(), Capability::DIRECT_IM)
        };
        let parsed =
            RendezvousMessage::parse_block(&msg.encode_block(&DefaultTextCodec).unwrap(), &DefaultTextCodec)
                .unwrap();
        assert!(parsed.use_proxy);
        assert_eq!(parsed.stage, 2);
        assert_eq!(parsed.proxy_ip, Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[test]
    fn cancel_always_carries_reason() {
        let raw = RendezvousMessage::cancel(cookie(), Capability::CHAT, 0)
            .encode_block(&DefaultTextCodec)
            .unwrap();
        let tlvs = TlvBlock::parse(&raw[26..]);
        assert!(tlvs.exists(TLV_ERROR_CODE));
    }

    #[test]
    fn incoming_envelope_roundtrip() {
        let incoming = IncomingRendezvous {
            sender: UserInfo::new("buddy"),
            message: RendezvousMessage::accept(cookie(), Capability::FILE_TRANSFER),
        };
        let body = incoming.to_icbm(&DefaultTextCodec).unwrap();
        let parsed = IncomingRendezvous::parse(&body, &DefaultTextCodec).unwrap().unwrap();
        assert_eq!(parsed, incoming);
    }

    #[test]
    fn other_channels_are_ignored() {
        let mut w = ByteWriter::new();
        cookie().write(&mut w);
        w.write_u16(0x0001);
        UserInfo::new("buddy").write(&mut w);
        assert!(IncomingRendezvous::parse(w.as_slice(), &DefaultTextCodec)
            .unwrap()
            .is_none());
    }

    #[test]
    fn outgoing_envelope_layout() {
        let msg = RendezvousMessage::new(RendezvousKind::Propose, cookie(), Capability::CHAT);
        let body = msg.to_icbm("pal", &DefaultTextCodec).unwrap();
        let mut r = ByteReader::new(&body);
        assert_eq!(Cookie::read(&mut r).unwrap(), cookie());
        assert_eq!(r.read_u16().unwrap(), RENDEZVOUS_CHANNEL);
        assert_eq!(r.read_name().unwrap(), "pal");
        let tlvs = TlvBlock::parse(r.read_rest());
        assert!(tlvs.exists(TLV_REQUEST_HOST_ACK));
        assert!(tlvs.exists(TLV_RENDEZVOUS_DATA));
    }

    #[test]
    fn client_error_roundtrip() {
        let err = ClientError {
            cookie: cookie(),
            channel: 2,
            peer: "pal".into(),
            reason: 3,
        };
        assert_eq!(ClientError::parse(&err.encode()).unwrap(), err);
    }
}
