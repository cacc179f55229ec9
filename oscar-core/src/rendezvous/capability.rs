//! Sixteen-byte capability tags naming the feature a rendezvous is for.
//!
//! Tags this crate does not know are carried through untouched.

use std::fmt;

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::OscarError;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability(pub [u8; 16]);

impl Capability {
    /// Direct instant messaging.
    pub const DIRECT_IM: Capability = Capability([
        0x09, 0x46, 0x13, 0x45, 0x4C, 0x7F, 0x11, 0xD1, 0x82, 0x22, 0x44, 0x45, 0x53, 0x54, 0x00,
        0x00,
    ]);

    /// Sending a file.
    pub const FILE_TRANSFER: Capability = Capability([
        0x09, 0x46, 0x13, 0x43, 0x4C, 0x7F, 0x11, 0xD1, 0x82, 0x22, 0x44, 0x45, 0x53, 0x54, 0x00,
        0x00,
    ]);

    /// Fetching a shared file listing.
    pub const GET_FILE: Capability = Capability([
        0x09, 0x46, 0x13, 0x48, 0x4C, 0x7F, 0x11, 0xD1, 0x82, 0x22, 0x44, 0x45, 0x53, 0x54, 0x00,
        0x00,
    ]);

    /// Chat room invitation.
    pub const CHAT: Capability = Capability([
        0x74, 0x8F, 0x24, 0x20, 0x62, 0x87, 0x11, 0xD1, 0x82, 0x22, 0x44, 0x45, 0x53, 0x54, 0x00,
        0x00,
    ]);

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self, OscarError> {
        Ok(Self(r.read_array::<16>()?))
    }

    pub fn write(&self, w: &mut ByteWriter) {
        w.write_bytes(&self.0);
    }

    /// Whether accepting this feature opens an out-of-band socket.
    pub fn needs_transport(&self) -> bool {
        *self != Self::CHAT
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{b:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::DIRECT_IM => f.write_str("Capability(DIRECT_IM)"),
            Self::FILE_TRANSFER => f.write_str("Capability(FILE_TRANSFER)"),
            Self::GET_FILE => f.write_str("Capability(GET_FILE)"),
            Self::CHAT => f.write_str("Capability(CHAT)"),
            _ => write!(f, "Capability({self})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_display() {
        assert_eq!(
            Capability::FILE_TRANSFER.to_string(),
            "09461343-4C7F-11D1-8222-444553540000"
        );
    }

    #[test]
    fn only_chat_skips_transport() {
        assert!(!Capability::CHAT.needs_transport());
        assert!(Capability::FILE_TRANSFER.needs_transport());
        assert!(Capability([0xAB; 16]).needs_transport());
    }
}
