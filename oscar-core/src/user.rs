//! The user-info block that identifies a remote party in buddy, chat and
//! rendezvous traffic.
//!
//! ```text
//! [u8 name length][name][u16 warning level][u16 TLV count][TLVs]
//! ```

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::OscarError;
use crate::tlv::{TlvBlock, TlvWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub warning_level: u16,
    pub attributes: TlvBlock,
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            warning_level: 0,
            attributes: TlvBlock::default(),
        }
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self, OscarError> {
        let name = r.read_name()?;
        let warning_level = r.read_u16()?;
        let attributes = TlvBlock::read_count_prefixed(r)?;
        Ok(Self {
            name,
            warning_level,
            attributes,
        })
    }

    pub fn write(&self, w: &mut ByteWriter) {
        let mut tlvs = TlvWriter::new();
        for tlv in self.attributes.iter() {
            tlvs.write(tlv.kind, &tlv.value);
        }
        w.write_name(&self.name).write_u16(self.warning_level);
        tlvs.write_counted_into(w);
    }

    /// The comparison form of the name.
    pub fn normalized(&self) -> String {
        normalize_name(&self.name)
    }
}

/// Screen names compare case-insensitively with spaces ignored.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::Tlv;

    #[test]
    fn reads_block_and_stops_at_end() {
        let mut w = ByteWriter::new();
        let mut info = UserInfo::new("Some Body");
        info.warning_level = 25;
        info.attributes = TlvBlock::from(vec![Tlv::new(0x0001, vec![0x00, 0x10])]);
        info.write(&mut w);
        w.write_u8(0xFF);

        let mut r = ByteReader::new(w.as_slice());
        let parsed = UserInfo::read(&mut r).unwrap();
        assert_eq!(parsed, info);
        assert_eq!(r.read_u8().unwrap(), 0xFF);
    }

    #[test]
    fn names_normalize() {
        assert_eq!(normalize_name("Some Body"), "somebody");
        assert_eq!(UserInfo::new("SOMEBODY").normalized(), "somebody");
    }
}
