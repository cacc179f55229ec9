//! Rendezvous proxy handshake.
//!
//! ```text
//! [u16 length][u16 0x044A][u16 command][u32 0][u16 flags][body]
//! ```
//!
//! `length` counts every byte after itself. Packets are read with exact
//! reads so nothing past the final `Ready` is consumed from the stream.

use std::net::Ipv4Addr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::OscarError;
use crate::rendezvous::{Capability, Cookie};
use crate::tlv::TlvWriter;

pub const PROXY_VERSION: u16 = 0x044A;

const HEADER_AFTER_LEN: usize = 10;
const TLV_CAPABILITY: u16 = 0x0001;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    Error = 0x0001,
    InitSend = 0x0002,
    Ack = 0x0003,
    InitReceive = 0x0004,
    Ready = 0x0005,
}

impl TryFrom<u16> for ProxyCommand {
    type Error = OscarError;

    fn try_from(value: u16) -> Result<Self, OscarError> {
        match value {
            0x0001 => Ok(Self::Error),
            0x0002 => Ok(Self::InitSend),
            0x0003 => Ok(Self::Ack),
            0x0004 => Ok(Self::InitReceive),
            0x0005 => Ok(Self::Ready),
            _ => Err(OscarError::UnknownVariant {
                type_name: "ProxyCommand",
                value: value as u32,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPacket {
    pub command: ProxyCommand,
    pub flags: u16,
    pub body: Bytes,
}

impl ProxyPacket {
    pub fn new(command: ProxyCommand, body: impl Into<Bytes>) -> Self {
        Self {
            command,
            flags: 0,
            body: body.into(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut w = ByteWriter::with_capacity(2 + HEADER_AFTER_LEN + self.body.len());
        w.write_u16((HEADER_AFTER_LEN + self.body.len()) as u16)
            .write_u16(PROXY_VERSION)
            .write_u16(self.command as u16)
            .write_u32(0)
            .write_u16(self.flags)
            .write_bytes(&self.body);
        w.into_bytes()
    }

    pub async fn read_from<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Self, OscarError> {
        let len = stream.read_u16().await? as usize;
        if len < HEADER_AFTER_LEN {
            return Err(OscarError::ProtocolViolation("proxy packet shorter than its header"));
        }
        let mut rest = vec![0u8; len];
        stream.read_exact(&mut rest).await?;
        let mut r = ByteReader::new(&rest);
        if r.read_u16()? != PROXY_VERSION {
            return Err(OscarError::ProtocolViolation("unexpected proxy protocol version"));
        }
        let command = ProxyCommand::try_from(r.read_u16()?)?;
        r.skip(4)?;
        let flags = r.read_u16()?;
        Ok(Self {
            command,
            flags,
            body: Bytes::copy_from_slice(r.read_rest()),
        })
    }

    pub async fn write_to<S: AsyncWrite + Unpin>(&self, stream: &mut S) -> Result<(), OscarError> {
        stream.write_all(&self.to_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Turn an error packet into an `Err`.
    fn reject_error(self) -> Result<Self, OscarError> {
        if self.command == ProxyCommand::Error {
            let code = ByteReader::new(&self.body).read_u16().unwrap_or(0);
            return Err(OscarError::Proxy(code));
        }
        Ok(self)
    }
}

fn capability_tlv(capability: &Capability, w: &mut ByteWriter) {
    let mut tlvs = TlvWriter::new();
    tlvs.write(TLV_CAPABILITY, &capability.0);
    tlvs.write_into(w);
}

/// Where the proxy will hold our end of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyAck {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// Ask the proxy to host a stream and wait for its address.
pub async fn init_send<S>(
    stream: &mut S,
    screen_name: &str,
    cookie: Cookie,
    capability: &Capability,
) -> Result<ProxyAck, OscarError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut body = ByteWriter::new();
    body.write_name(screen_name);
    cookie.write(&mut body);
    capability_tlv(capability, &mut body);
    ProxyPacket::new(ProxyCommand::InitSend, body.into_bytes())
        .write_to(stream)
        .await?;

    let reply = ProxyPacket::read_from(stream).await?.reject_error()?;
    if reply.command != ProxyCommand::Ack {
        return Err(OscarError::ProtocolViolation("proxy answered init-send without an ack"));
    }
    let mut r = ByteReader::new(&reply.body);
    let port = r.read_u16()?;
    let ip = Ipv4Addr::from(r.read_u32()?);
    Ok(ProxyAck { ip, port })
}

/// Join a stream another client registered, waiting for `Ready`.
pub async fn init_receive<S>(
    stream: &mut S,
    screen_name: &str,
    port: u16,
    cookie: Cookie,
    capability: &Capability,
) -> Result<(), OscarError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut body = ByteWriter::new();
    body.write_name(screen_name).write_u16(port);
    cookie.write(&mut body);
    capability_tlv(capability, &mut body);
    ProxyPacket::new(ProxyCommand::InitReceive, body.into_bytes())
        .write_to(stream)
        .await?;
    await_ready(stream).await
}

/// Wait until the proxy reports both ends joined.
pub async fn await_ready<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(), OscarError> {
    let packet = ProxyPacket::read_from(stream).await?.reject_error()?;
    match packet.command {
        ProxyCommand::Ready => Ok(()),
        _ => Err(OscarError::ProtocolViolation("expected proxy ready")),
    }
}
