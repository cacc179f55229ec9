//! Frame channels and sub-message family/subtype identifiers.
//!
//! Unknown wire values fail `TryFrom` with an error rather than a panic.

use crate::error::OscarError;
use std::fmt;

// ── Channel ──────────────────────────────────────────────────────

/// The channel selector in every frame header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Open handshake (version + authorization token).
    Negotiate = 0x01,
    /// Carries sub-messages.
    Data = 0x02,
    /// Peer-signaled fatal condition.
    Error = 0x03,
    /// Close / sign-off handshake.
    Close = 0x04,
    /// Empty periodic frames.
    KeepAlive = 0x05,
}

impl TryFrom<u8> for Channel {
    type Error = OscarError;

    fn try_from(value: u8) -> Result<Self, OscarError> {
        match value {
            0x01 => Ok(Channel::Negotiate),
            0x02 => Ok(Channel::Data),
            0x03 => Ok(Channel::Error),
            0x04 => Ok(Channel::Close),
            0x05 => Ok(Channel::KeepAlive),
            other => Err(OscarError::UnknownChannel(other)),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── Families ─────────────────────────────────────────────────────

/// Family identifiers for the services this crate speaks.
///
/// - `0x0001`: Generic service controls (redirect, rates, pause)
/// - `0x0004`: ICBM (instant messages, rendezvous)
/// - `0x000D`: Chat navigation
/// - `0x000E`: Chat room
pub mod family {
    pub const OSERVICE: u16 = 0x0001;
    pub const LOCATE: u16 = 0x0002;
    pub const BUDDY: u16 = 0x0003;
    pub const ICBM: u16 = 0x0004;
    pub const CHAT_NAV: u16 = 0x000D;
    pub const CHAT: u16 = 0x000E;
    pub const FEEDBAG: u16 = 0x0013;

    /// Subtype `0x0001` is the error reply in every family.
    pub const ERROR_SUBTYPE: u16 = 0x0001;
}

// ── OserviceSubtype ──────────────────────────────────────────────

/// Generic service control subtypes (family `0x0001`).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OserviceSubtype {
    Error = 0x0001,
    ClientOnline = 0x0002,
    HostOnline = 0x0003,
    ServiceRequest = 0x0004,
    ServiceResponse = 0x0005,
    RateParamsQuery = 0x0006,
    RateParamsReply = 0x0007,
    RateParamsSubAdd = 0x0008,
    RateParamChange = 0x000A,
    PauseRequest = 0x000B,
    PauseAck = 0x000C,
    Resume = 0x000D,
    Motd = 0x0013,
}

impl TryFrom<u16> for OserviceSubtype {
    type Error = OscarError;

    fn try_from(value: u16) -> Result<Self, OscarError> {
        match value {
            0x0001 => Ok(OserviceSubtype::Error),
            0x0002 => Ok(OserviceSubtype::ClientOnline),
            0x0003 => Ok(OserviceSubtype::HostOnline),
            0x0004 => Ok(OserviceSubtype::ServiceRequest),
            0x0005 => Ok(OserviceSubtype::ServiceResponse),
            0x0006 => Ok(OserviceSubtype::RateParamsQuery),
            0x0007 => Ok(OserviceSubtype::RateParamsReply),
            0x0008 => Ok(OserviceSubtype::RateParamsSubAdd),
            0x000A => Ok(OserviceSubtype::RateParamChange),
            0x000B => Ok(OserviceSubtype::PauseRequest),
            0x000C => Ok(OserviceSubtype::PauseAck),
            0x000D => Ok(OserviceSubtype::Resume),
            0x0013 => Ok(OserviceSubtype::Motd),
            _ => Err(OscarError::UnknownVariant {
                type_name: "OserviceSubtype",
                value: value as u32,
            }),
        }
    }
}

// ── IcbmSubtype ──────────────────────────────────────────────────

/// ICBM subtypes used by the rendezvous engine (family `0x0004`).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcbmSubtype {
    Error = 0x0001,
    ChannelMsgToHost = 0x0006,
    ChannelMsgToClient = 0x0007,
    ClientError = 0x000B,
}

impl TryFrom<u16> for IcbmSubtype {
    type Error = OscarError;

    fn try_from(value: u16) -> Result<Self, OscarError> {
        match value {
            0x0001 => Ok(IcbmSubtype::Error),
            0x0006 => Ok(IcbmSubtype::ChannelMsgToHost),
            0x0007 => Ok(IcbmSubtype::ChannelMsgToClient),
            0x000B => Ok(IcbmSubtype::ClientError),
            _ => Err(OscarError::UnknownVariant {
                type_name: "IcbmSubtype",
                value: value as u32,
            }),
        }
    }
}

// ── ChatSubtype ──────────────────────────────────────────────────

/// Chat room subtypes (family `0x000E`).
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatSubtype {
    Error = 0x0001,
    RoomInfoUpdate = 0x0002,
    UsersJoined = 0x0003,
    UsersLeft = 0x0004,
    ChannelMsgToHost = 0x0005,
    ChannelMsgToClient = 0x0006,
}

impl TryFrom<u16> for ChatSubtype {
    type Error = OscarError;

    fn try_from(value: u16) -> Result<Self, OscarError> {
        match value {
            0x0001 => Ok(ChatSubtype::Error),
            0x0002 => Ok(ChatSubtype::RoomInfoUpdate),
            0x0003 => Ok(ChatSubtype::UsersJoined),
            0x0004 => Ok(ChatSubtype::UsersLeft),
            0x0005 => Ok(ChatSubtype::ChannelMsgToHost),
            0x0006 => Ok(ChatSubtype::ChannelMsgToClient),
            _ => Err(OscarError::UnknownVariant {
                type_name: "ChatSubtype",
                value: value as u32,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_roundtrip() {
        for ch in [
            Channel::Negotiate,
            Channel::Data,
            Channel::Error,
            Channel::Close,
            Channel::KeepAlive,
        ] {
            assert_eq!(Channel::try_from(ch as u8).unwrap(), ch);
        }
    }

    #[test]
    fn channel_invalid() {
        assert!(matches!(
            Channel::try_from(0x06),
            Err(OscarError::UnknownChannel(0x06))
        ));
    }

    #[test]
    fn oservice_subtype_invalid() {
        assert!(OserviceSubtype::try_from(0xDEAD).is_err());
        assert_eq!(
            OserviceSubtype::try_from(0x0005).unwrap(),
            OserviceSubtype::ServiceResponse
        );
    }
}
