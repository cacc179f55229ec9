//! Service request and redirect bodies (generic family `0x0001`, subtypes
//! `0x0004` and `0x0005`).

use bytes::Bytes;

use crate::buffer::ByteWriter;
use crate::error::OscarError;
use crate::service::ServiceKey;
use crate::tlv::{TlvBlock, TlvWriter};

/// Room block attached to a chat service request.
pub const TLV_ROOM: u16 = 0x0001;
pub const TLV_ADDRESS: u16 = 0x0005;
pub const TLV_TOKEN: u16 = 0x0006;
pub const TLV_FAMILY: u16 = 0x000D;

/// Port assumed when a redirect address has none.
pub const DEFAULT_PORT: u16 = 5190;

/// Body of a service request for `key`.
pub fn service_request(key: &ServiceKey) -> Bytes {
    let mut w = ByteWriter::with_capacity(16);
    w.write_u16(key.family());
    if let ServiceKey::ChatRoom(room) = key {
        let mut block = ByteWriter::new();
        room.write_block(&mut block);
        let mut tlvs = TlvWriter::new();
        tlvs.write(TLV_ROOM, block.as_slice());
        tlvs.write_into(&mut w);
    }
    w.into_bytes()
}

/// Where the server sent us for a requested service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub family: u16,
    /// `host:port`, with the default port filled in.
    pub address: String,
    pub token: Bytes,
}

impl Redirect {
    pub fn parse(body: &[u8]) -> Result<Self, OscarError> {
        let tlvs = TlvBlock::parse(body);
        let address = tlvs.read_ascii(TLV_ADDRESS);
        if address.is_empty() {
            return Err(OscarError::ProtocolViolation("redirect without an address"));
        }
        Ok(Self {
            family: tlvs.read_u16(TLV_FAMILY),
            address: with_default_port(&address),
            token: tlvs
                .read(TLV_TOKEN)
                .map(Bytes::copy_from_slice)
                .unwrap_or_default(),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut tlvs = TlvWriter::new();
        tlvs.write_u16(TLV_FAMILY, self.family)
            .write_str(TLV_ADDRESS, &self.address)
            .write(TLV_TOKEN, &self.token);
        tlvs.serialize()
    }
}

fn with_default_port(address: &str) -> String {
    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{address}:{DEFAULT_PORT}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteReader;
    use crate::service::RoomKey;

    #[test]
    fn family_request_is_bare_family() {
        assert_eq!(
            service_request(&ServiceKey::Family(0x0013)).as_ref(),
            &[0x00, 0x13]
        );
    }

    #[test]
    fn chat_request_carries_room_block() {
        let room = RoomKey {
            exchange: 4,
            cookie: "!aol://2719:10-4-lobby".into(),
            instance: 0,
        };
        let body = service_request(&ServiceKey::ChatRoom(room.clone()));
        let mut r = ByteReader::new(&body);
        assert_eq!(r.read_u16().unwrap(), 0x000E);
        let tlvs = TlvBlock::parse(r.read_rest());
        let block = tlvs.read(TLV_ROOM).unwrap();
        assert_eq!(RoomKey::read_block(&mut ByteReader::new(block)).unwrap(), room);
    }

    #[test]
    fn redirect_fills_default_port() {
        let mut tlvs = TlvWriter::new();
        tlvs.write_u16(TLV_FAMILY, 0x000E)
            .write_str(TLV_ADDRESS, "10.0.0.5")
            .write(TLV_TOKEN, b"tok");
        let redirect = Redirect::parse(&tlvs.serialize()).unwrap();
        assert_eq!(redirect.address, "10.0.0.5:5190");
        assert_eq!(redirect.family, 0x000E);
        assert_eq!(redirect.token.as_ref(), b"tok");

        let again = Redirect::parse(&redirect.encode()).unwrap();
        assert_eq!(again, redirect);
    }

    #[test]
    fn redirect_without_address_is_rejected() {
        let mut tlvs = TlvWriter::new();
        tlvs.write_u16(TLV_FAMILY, 0x0004);
        assert!(Redirect::parse(&tlvs.serialize()).is_err());
    }
}
