//! Text charsets used by chat and rendezvous messages.
//!
//! Conversion is behind the [`TextCodec`] trait so an application can plug
//! in a fuller encoding library; [`DefaultTextCodec`] covers the charsets the
//! protocol names on the wire.

use std::fmt;

use crate::error::OscarError;

/// Charsets tagged on chat and invitation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Charset {
    Ascii,
    Latin1,
    /// UTF-16 big-endian, tagged `unicode-2-0` on the wire.
    Utf16Be,
    Utf8,
}

impl Charset {
    /// The charset name as it appears in TLVs.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Charset::Ascii => "us-ascii",
            Charset::Latin1 => "iso-8859-1",
            Charset::Utf16Be => "unicode-2-0",
            Charset::Utf8 => "utf-8",
        }
    }

    /// Parse a wire name; unknown names yield `None`.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        let lower = name.trim().trim_matches('"').to_ascii_lowercase();
        match lower.as_str() {
            "us-ascii" | "ascii" => Some(Charset::Ascii),
            "iso-8859-1" | "latin1" => Some(Charset::Latin1),
            "unicode-2-0" | "utf-16be" => Some(Charset::Utf16Be),
            "utf-8" | "utf8" => Some(Charset::Utf8),
            _ => None,
        }
    }

    /// The narrowest charset that carries `text` without loss.
    pub fn narrowest_for(text: &str) -> Self {
        if text.is_ascii() {
            Charset::Ascii
        } else if text.chars().all(|c| (c as u32) <= 0xFF) {
            Charset::Latin1
        } else {
            Charset::Utf16Be
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

// ── TextCodec ────────────────────────────────────────────────────

/// Text conversion service.
pub trait TextCodec: Send + Sync {
    /// Encode `text`; fails if a character has no representation.
    fn encode(&self, text: &str, charset: Charset) -> Result<Vec<u8>, OscarError>;

    /// Decode `raw`; undecodable bytes are replaced, never rejected.
    fn decode(&self, raw: &[u8], charset: Charset) -> String;
}

/// Built-in conversions for the four wire charsets.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTextCodec;

impl TextCodec for DefaultTextCodec {
    fn encode(&self, text: &str, charset: Charset) -> Result<Vec<u8>, OscarError> {
        match charset {
            Charset::Ascii => {
                if !text.is_ascii() {
                    return Err(OscarError::Unencodable("us-ascii"));
                }
                Ok(text.as_bytes().to_vec())
            }
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(c as u32).map_err(|_| OscarError::Unencodable("iso-8859-1")))
                .collect(),
            Charset::Utf16Be => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
        }
    }

    fn decode(&self, raw: &[u8], charset: Charset) -> String {
        match charset {
            Charset::Ascii | Charset::Utf8 => String::from_utf8_lossy(raw).into_owned(),
            Charset::Latin1 => raw.iter().map(|&b| b as char).collect(),
            Charset::Utf16Be => {
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }
}

/// Encode `text` in the narrowest lossless charset.
pub fn encode_narrowest(
    text: &str,
    codec: &dyn TextCodec,
) -> Result<(Charset, Vec<u8>), OscarError> {
    let charset = Charset::narrowest_for(text);
    let raw = codec.encode(text, charset)?;
    Ok((charset, raw))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowest_charset_selection() {
        assert_eq!(Charset::narrowest_for("hello"), Charset::Ascii);
        assert_eq!(Charset::narrowest_for("café"), Charset::Latin1);
        assert_eq!(Charset::narrowest_for("日本"), Charset::Utf16Be);
    }

    #[test]
    fn utf16_round_trip() {
        let codec = DefaultTextCodec;
        let raw = codec.encode("日本", Charset::Utf16Be).unwrap();
        assert_eq!(raw, vec![0x65, 0xE5, 0x67, 0x2C]);
        assert_eq!(codec.decode(&raw, Charset::Utf16Be), "日本");
    }

    #[test]
    fn latin1_rejects_wide_characters() {
        let codec = DefaultTextCodec;
        assert!(codec.encode("日", Charset::Latin1).is_err());
        assert!(codec.encode("é", Charset::Ascii).is_err());
    }

    #[test]
    fn wire_names_parse_case_insensitively() {
        assert_eq!(Charset::from_wire_name("US-ASCII"), Some(Charset::Ascii));
        assert_eq!(
            Charset::from_wire_name("\"unicode-2-0\""),
            Some(Charset::Utf16Be)
        );
        assert_eq!(Charset::from_wire_name("koi8-r"), None);
    }
}
