//! Chat room descriptor and membership.
//!
//! A room is named either by its URI-style identifier,
//! `scheme://<ignored>:<instance>-<exchange>-<room name>`, or by a
//! room-info block from the server:
//!
//! ```text
//! [u16 exchange][u8 len][full name][u16 instance][u8 detail][u16 count][TLVs]
//! ```

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::buffer::ByteReader;
use crate::error::OscarError;
use crate::flags::RoomFlags;
use crate::service::RoomKey;
use crate::tlv::TlvBlock;
use crate::user::{UserInfo, normalize_name};

pub const TLV_QUALIFIED_NAME: u16 = 0x006A;
pub const TLV_FLAGS: u16 = 0x00C9;
pub const TLV_CREATED: u16 = 0x00CA;
pub const TLV_MAX_MESSAGE_LEN: u16 = 0x00D1;
pub const TLV_MAX_OCCUPANTS: u16 = 0x00D2;
pub const TLV_ROOM_NAME: u16 = 0x00D3;
pub const TLV_CREATE_PERMISSION: u16 = 0x00D5;
pub const TLV_CHARSET: u16 = 0x00D6;
pub const TLV_LANGUAGE: u16 = 0x00D7;
pub const TLV_CHARSET_2: u16 = 0x00D8;
pub const TLV_LANGUAGE_2: u16 = 0x00D9;
pub const TLV_CONTENT_TYPE: u16 = 0x00DB;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRoom {
    pub exchange: u16,
    pub instance: u16,
    /// Full name as the server knows it; doubles as the room cookie.
    pub name: String,
    pub display_name: String,
    pub flags: RoomFlags,
    pub created: SystemTime,
    pub max_message_len: u16,
    pub max_occupants: u16,
    pub create_permission: u8,
    pub charsets: Vec<String>,
    pub languages: Vec<String>,
    pub content_type: String,
    members: BTreeMap<String, String>,
}

impl ChatRoom {
    fn bare(exchange: u16, instance: u16, name: String) -> Self {
        let display_name = uri_room_name(&name).unwrap_or(&name).to_string();
        Self {
            exchange,
            instance,
            name,
            display_name,
            flags: RoomFlags::empty(),
            created: SystemTime::UNIX_EPOCH,
            max_message_len: 0,
            max_occupants: 0,
            create_permission: 0,
            charsets: Vec::new(),
            languages: Vec::new(),
            content_type: String::new(),
            members: BTreeMap::new(),
        }
    }

    pub fn from_uri(uri: &str) -> Result<Self, OscarError> {
        let (instance, exchange, _) =
            parse_uri(uri).ok_or_else(|| OscarError::MalformedIdentifier(uri.to_string()))?;
        Ok(Self::bare(exchange, instance, uri.to_string()))
    }

    pub fn from_info_block(r: &mut ByteReader<'_>) -> Result<Self, OscarError> {
        let exchange = r.read_u16()?;
        let name = r.read_name()?;
        let instance = r.read_u16()?;
        let _detail = r.read_u8()?;
        let attributes = TlvBlock::read_count_prefixed(r)?;

        let mut room = Self::bare(exchange, instance, name);
        room.apply_attributes(&attributes);
        Ok(room)
    }

    fn apply_attributes(&mut self, tlvs: &TlvBlock) {
        self.flags = RoomFlags::from_bits_retain(tlvs.read_u16(TLV_FLAGS));
        self.created = tlvs.read_timestamp(TLV_CREATED);
        self.max_message_len = tlvs.read_u16(TLV_MAX_MESSAGE_LEN);
        self.max_occupants = tlvs.read_u16(TLV_MAX_OCCUPANTS);
        self.create_permission = tlvs.read_u8(TLV_CREATE_PERMISSION);
        self.content_type = tlvs.read_ascii(TLV_CONTENT_TYPE);
        self.charsets = [TLV_CHARSET, TLV_CHARSET_2]
            .into_iter()
            .map(|kind| tlvs.read_ascii(kind))
            .filter(|s| !s.is_empty())
            .collect();
        self.languages = [TLV_LANGUAGE, TLV_LANGUAGE_2]
            .into_iter()
            .map(|kind| tlvs.read_ascii(kind))
            .filter(|s| !s.is_empty())
            .collect();

        let explicit = [TLV_QUALIFIED_NAME, TLV_ROOM_NAME]
            .into_iter()
            .map(|kind| tlvs.read_ascii(kind))
            .find(|s| !s.is_empty());
        if let Some(display) = explicit {
            self.display_name = display;
        }
    }

    /// Take the descriptive fields of `info`. Identity (exchange, instance,
    /// full name) and membership stay as they were, so [`key`](Self::key)
    /// never changes.
    pub fn update_info(&mut self, info: ChatRoom) {
        let ChatRoom {
            display_name,
            flags,
            created,
            max_message_len,
            max_occupants,
            create_permission,
            charsets,
            languages,
            content_type,
            ..
        } = info;
        self.display_name = display_name;
        self.flags = flags;
        self.created = created;
        self.max_message_len = max_message_len;
        self.max_occupants = max_occupants;
        self.create_permission = create_permission;
        self.charsets = charsets;
        self.languages = languages;
        self.content_type = content_type;
    }

    pub fn key(&self) -> RoomKey {
        RoomKey {
            exchange: self.exchange,
            cookie: self.name.clone(),
            instance: self.instance,
        }
    }

    // ── Membership ───────────────────────────────────────────────

    /// Add `users`, returning the names that were not already present.
    pub fn join(&mut self, users: &[UserInfo]) -> Vec<String> {
        let mut added = Vec::new();
        for user in users {
            let key = user.normalized();
            if !self.members.contains_key(&key) {
                self.members.insert(key, user.name.clone());
                added.push(user.name.clone());
            }
        }
        added
    }

    /// Remove `users`, returning the names that were present.
    pub fn leave(&mut self, users: &[UserInfo]) -> Vec<String> {
        users
            .iter()
            .filter_map(|user| self.members.remove(&user.normalized()))
            .collect()
    }

    pub fn is_member(&self, name: &str) -> bool {
        self.members.contains_key(&normalize_name(name))
    }

    pub fn members(&self) -> Vec<String> {
        self.members.values().cloned().collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// `(instance, exchange, room name)` of a URI-style identifier.
fn parse_uri(uri: &str) -> Option<(u16, u16, &str)> {
    let (_, rest) = uri.split_once("://")?;
    let (_, tail) = rest.split_once(':')?;
    let mut parts = tail.splitn(3, '-');
    let instance = parts.next()?.parse().ok()?;
    let exchange = parts.next()?.parse().ok()?;
    let name = parts.next().filter(|n| !n.is_empty())?;
    Some((instance, exchange, name))
}

fn uri_room_name(uri: &str) -> Option<&str> {
    parse_uri(uri).map(|(_, _, name)| name)
}

/// Consecutive user-info blocks, as carried by join and leave notices.
pub fn read_users(r: &mut ByteReader<'_>) -> Result<Vec<UserInfo>, OscarError> {
    let mut users = Vec::new();
    while r.has_more_data() {
        users.push(UserInfo::read(r)?);
    }
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteWriter;
    use crate::tlv::TlvWriter;

    fn info_block(name: &str, tlvs: &TlvWriter) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u16(4).write_name(name).write_u16(7).write_u8(2);
        tlvs.write_counted_into(&mut w);
        w.into_vec()
    }

    #[test]
    fn uri_identifier() {
        let room = ChatRoom::from_uri("aol://2719:10-4-Rust Lovers").unwrap();
        assert_eq!(room.instance, 10);
        assert_eq!(room.exchange, 4);
        assert_eq!(room.display_name, "Rust Lovers");
        assert_eq!(room.key().cookie, "aol://2719:10-4-Rust Lovers");
    }

    #[test]
    fn room_name_may_contain_dashes() {
        let room = ChatRoom::from_uri("aol://x:1-4-tea-and-cake").unwrap();
        assert_eq!(room.display_name, "tea-and-cake");
    }

    #[test]
    fn malformed_uri() {
        for uri in ["lobby", "aol://x:1-4", "aol://x:a-4-lobby", "aol://nocolon"] {
            assert!(matches!(
                ChatRoom::from_uri(uri),
                Err(OscarError::MalformedIdentifier(_))
            ));
        }
    }

    #[test]
    fn display_name_falls_back_to_uri_segment() {
        let mut tlvs = TlvWriter::new();
        tlvs.write_u16(TLV_MAX_OCCUPANTS, 50);
        let raw = info_block("scheme://x:7-4-lobby", &tlvs);
        let room = ChatRoom::from_info_block(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(room.display_name, "lobby");
        assert_eq!(room.max_occupants, 50);
        assert_eq!(room.instance, 7);
    }

    #[test]
    fn display_name_falls_back_to_full_name() {
        let raw = info_block("plain room", &TlvWriter::new());
        let room = ChatRoom::from_info_block(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(room.display_name, "plain room");
    }

    #[test]
    fn attributes_are_read() {
        let mut tlvs = TlvWriter::new();
        tlvs.write_str(TLV_QUALIFIED_NAME, "Lobby")
            .write_u16(TLV_FLAGS, 0x0003)
            .write_u16(TLV_MAX_MESSAGE_LEN, 1024)
            .write_u8(TLV_CREATE_PERMISSION, 2)
            .write_str(TLV_CHARSET, "us-ascii")
            .write_str(TLV_LANGUAGE, "en")
            .write_str(TLV_CONTENT_TYPE, "text/x-aolrtf");
        let raw = info_block("scheme://x:7-4-lobby", &tlvs);
        let room = ChatRoom::from_info_block(&mut ByteReader::new(&raw)).unwrap();
        assert_eq!(room.display_name, "Lobby");
        assert_eq!(room.flags, RoomFlags::EVILABLE | RoomFlags::NAV_ONLY);
        assert_eq!(room.max_message_len, 1024);
        assert_eq!(room.create_permission, 2);
        assert_eq!(room.charsets, vec!["us-ascii".to_string()]);
        assert_eq!(room.languages, vec!["en".to_string()]);
        assert_eq!(room.content_type, "text/x-aolrtf");
    }

    #[test]
    fn join_then_leave() {
        let mut room = ChatRoom::from_uri("scheme://x:7-4-lobby").unwrap();
        let a = UserInfo::new("Alice");
        let b = UserInfo::new("Bob");
        assert_eq!(room.join(&[a.clone(), b.clone()]), vec!["Alice", "Bob"]);
        assert_eq!(room.leave(&[a]), vec!["Alice"]);
        assert_eq!(room.members(), vec!["Bob"]);
    }

    #[test]
    fn membership_is_unique_by_normalized_name() {
        let mut room = ChatRoom::from_uri("scheme://x:7-4-lobby").unwrap();
        room.join(&[UserInfo::new("Bob Smith")]);
        assert!(room.join(&[UserInfo::new("bobsmith")]).is_empty());
        assert_eq!(room.member_count(), 1);
        assert!(room.is_member("BOB SMITH"));
        assert!(room.leave(&[UserInfo::new("nobody")]).is_empty());
    }

    #[test]
    fn update_keeps_members() {
        let mut room = ChatRoom::from_uri("scheme://x:7-4-lobby").unwrap();
        room.join(&[UserInfo::new("Bob")]);
        let mut tlvs = TlvWriter::new();
        tlvs.write_str(TLV_QUALIFIED_NAME, "The Lobby");
        let raw = info_block("scheme://x:7-4-lobby", &tlvs);
        room.update_info(ChatRoom::from_info_block(&mut ByteReader::new(&raw)).unwrap());
        assert_eq!(room.display_name, "The Lobby");
        assert_eq!(room.members(), vec!["Bob"]);

        let key = room.key();
        let raw = info_block("another name", &TlvWriter::new());
        room.update_info(ChatRoom::from_info_block(&mut ByteReader::new(&raw)).unwrap());
        assert_eq!(room.key(), key);
        assert_eq!(room.display_name, "another name");
    }
}
