//! Chat message bodies (family `0x000E`, subtypes `0x0005` and `0x0006`).
//!
//! ```text
//! [8B cookie][u16 channel = 3][TLVs]
//!   0x0001  public (empty)
//!   0x0003  sender user-info            (incoming only)
//!   0x0005  message block
//!             0x0001 text  0x0002 charset  0x0003 language
//!             0x0004 content type  0x0005 transfer encoding
//!   0x0006  reflect to sender (empty)   (outgoing only)
//! ```

use bytes::Bytes;

use crate::buffer::{ByteReader, ByteWriter};
use crate::encoding::{Charset, TextCodec, encode_narrowest};
use crate::error::OscarError;
use crate::rendezvous::Cookie;
use crate::tlv::{TlvBlock, TlvWriter};
use crate::user::UserInfo;

pub const CHAT_CHANNEL: u16 = 0x0003;

const TLV_PUBLIC: u16 = 0x0001;
const TLV_SENDER: u16 = 0x0003;
const TLV_MESSAGE: u16 = 0x0005;
const TLV_REFLECT: u16 = 0x0006;

const MSG_TEXT: u16 = 0x0001;
const MSG_CHARSET: u16 = 0x0002;
const MSG_LANGUAGE: u16 = 0x0003;
const MSG_CONTENT_TYPE: u16 = 0x0004;
const MSG_ENCODING: u16 = 0x0005;

pub const CONTENT_TYPE: &str = "text/x-aolrtf";
pub const TRANSFER_ENCODING: &str = "binary";

/// Body of an outgoing room message.
pub fn encode_message(
    cookie: Cookie,
    text: &str,
    language: &str,
    codec: &dyn TextCodec,
) -> Result<Bytes, OscarError> {
    let (charset, raw) = encode_narrowest(text, codec)?;
    let mut block = TlvWriter::new();
    block
        .write(MSG_TEXT, &raw)
        .write_str(MSG_CHARSET, charset.wire_name())
        .write_str(MSG_LANGUAGE, language)
        .write_str(MSG_CONTENT_TYPE, CONTENT_TYPE)
        .write_str(MSG_ENCODING, TRANSFER_ENCODING);

    let mut tlvs = TlvWriter::new();
    tlvs.write_empty(TLV_PUBLIC)
        .write_empty(TLV_REFLECT)
        .write_nested(TLV_MESSAGE, &block);

    let mut w = ByteWriter::new();
    cookie.write(&mut w);
    w.write_u16(CHAT_CHANNEL);
    tlvs.write_into(&mut w);
    Ok(w.into_bytes())
}

/// A message someone posted to the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub cookie: Cookie,
    pub sender: UserInfo,
    pub text: String,
    pub charset: Charset,
    pub language: String,
}

impl ChatMessage {
    pub fn parse(body: &[u8], codec: &dyn TextCodec) -> Result<Self, OscarError> {
        let mut r = ByteReader::new(body);
        let cookie = Cookie::read(&mut r)?;
        let _channel = r.read_u16()?;
        let tlvs = TlvBlock::parse(r.read_rest());

        let sender = tlvs
            .read(TLV_SENDER)
            .ok_or(OscarError::ProtocolViolation("chat message without a sender"))?;
        let sender = UserInfo::read(&mut ByteReader::new(sender))?;
        let block = tlvs
            .read_nested(TLV_MESSAGE)
            .ok_or(OscarError::ProtocolViolation("chat message without a message block"))?;

        let charset = Charset::from_wire_name(&block.read_ascii(MSG_CHARSET)).unwrap_or(Charset::Utf8);
        let text = codec.decode(block.read(MSG_TEXT).unwrap_or_default(), charset);
        Ok(Self {
            cookie,
            sender,
            text,
            charset,
            language: block.read_ascii(MSG_LANGUAGE),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::DefaultTextCodec;

    fn incoming(sender: &str, charset: &str, raw: &[u8]) -> Vec<u8> {
        let mut info = ByteWriter::new();
        UserInfo::new(sender).write(&mut info);
        let mut block = TlvWriter::new();
        block
            .write(MSG_TEXT, raw)
            .write_str(MSG_CHARSET, charset)
            .write_str(MSG_LANGUAGE, "en");
        let mut tlvs = TlvWriter::new();
        tlvs.write_empty(TLV_PUBLIC)
            .write(TLV_SENDER, info.as_slice())
            .write_nested(TLV_MESSAGE, &block);

        let mut w = ByteWriter::new();
        Cookie([5; 8]).write(&mut w);
        w.write_u16(CHAT_CHANNEL);
        tlvs.write_into(&mut w);
        w.into_vec()
    }

    #[test]
    fn outgoing_layout() {
        let body = encode_message(Cookie([1; 8]), "hi", "en", &DefaultTextCodec).unwrap();
        let mut r = ByteReader::new(&body);
        assert_eq!(Cookie::read(&mut r).unwrap(), Cookie([1; 8]));
        assert_eq!(r.read_u16().unwrap(), CHAT_CHANNEL);

        let tlvs = TlvBlock::parse(r.read_rest());
        let kinds: Vec<u16> = tlvs.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TLV_PUBLIC, TLV_REFLECT, TLV_MESSAGE]);
        let block = tlvs.read_nested(TLV_MESSAGE).unwrap();
        assert_eq!(block.read(MSG_TEXT), Some(&b"hi"[..]));
        assert_eq!(block.read_ascii(MSG_CHARSET), "us-ascii");
        assert_eq!(block.read_ascii(MSG_ENCODING), "binary");
    }

    #[test]
    fn wide_text_uses_unicode() {
        let body = encode_message(Cookie([1; 8]), "日本", "ja", &DefaultTextCodec).unwrap();
        let tlvs = TlvBlock::parse(&body[10..]);
        let block = tlvs.read_nested(TLV_MESSAGE).unwrap();
        assert_eq!(block.read_ascii(MSG_CHARSET), "unicode-2-0");
        assert_eq!(block.read(MSG_TEXT), Some(&[0x65, 0xE5, 0x67, 0x2C][..]));
    }

    #[test]
    fn incoming_latin1() {
        let raw = incoming("Alice", "iso-8859-1", &[b'c', b'a', b'f', 0xE9]);
        let msg = ChatMessage::parse(&raw, &DefaultTextCodec).unwrap();
        assert_eq!(msg.sender.name, "Alice");
        assert_eq!(msg.text, "café");
        assert_eq!(msg.charset, Charset::Latin1);
        assert_eq!(msg.language, "en");
        assert_eq!(msg.cookie, Cookie([5; 8]));
    }

    #[test]
    fn unknown_charset_is_lossy_utf8() {
        let raw = incoming("Alice", "x-klingon", &[b'o', b'k', 0xFF]);
        let msg = ChatMessage::parse(&raw, &DefaultTextCodec).unwrap();
        assert_eq!(msg.text, "ok\u{FFFD}");
    }

    #[test]
    fn missing_sender_is_rejected() {
        let mut w = ByteWriter::new();
        Cookie([5; 8]).write(&mut w);
        w.write_u16(CHAT_CHANNEL);
        assert!(ChatMessage::parse(w.as_slice(), &DefaultTextCodec).is_err());
    }
}
