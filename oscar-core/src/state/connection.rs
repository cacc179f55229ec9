//! Per-connection lifecycle.
//!
//! The phase decides which frame channels are acceptable, checks the
//! server's version frame before the client may answer it, and records
//! why the connection ended.

use std::time::{Duration, Instant};

use crate::error::OscarError;
use crate::message::Channel;
use crate::network::CloseReason;
use crate::packet::PROTOCOL_VERSION;

// ── ConnectionPhase ──────────────────────────────────────────────

/// The current phase of one physical connection.
///
/// ```text
///  Disconnected ──► Connecting ──► Negotiating ──► Established
///       ▲  ▲             │          (version)           │
///       │  │             ▼               │              │ local close
///       │  └─────── any failure, ◄───────┴──────────────┤
///       │           server close                        ▼
///       └──────────────────────────────────────────── Closing
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No socket. `reason` is set once a connection has ended.
    Disconnected { reason: Option<CloseReason> },

    /// Socket connect in progress.
    Connecting,

    /// Socket is up; waiting for the server's version frame, then
    /// answering it with ours.
    Negotiating { version_seen: bool },

    /// Data-channel traffic allowed.
    Established { since: Instant },

    /// Our close frame is queued; nothing else will be written.
    Closing,
}

impl Default for ConnectionPhase {
    fn default() -> Self {
        Self::Disconnected { reason: None }
    }
}

impl std::fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected { reason: None } => write!(f, "Disconnected"),
            Self::Disconnected { reason: Some(r) } => write!(f, "Disconnected ({r})"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Negotiating { .. } => write!(f, "Negotiating"),
            Self::Established { .. } => write!(f, "Established"),
            Self::Closing => write!(f, "Closing"),
        }
    }
}

impl ConnectionPhase {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }

    /// Why the connection ended, once it has.
    pub fn close_reason(&self) -> Option<&CloseReason> {
        match self {
            Self::Disconnected { reason } => reason.as_ref(),
            _ => None,
        }
    }

    pub fn established_duration(&self) -> Option<Duration> {
        match self {
            Self::Established { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    /// Whether a frame on `channel` is meaningful in this phase.
    ///
    /// Before the handshake only negotiation, keepalive and close frames
    /// make sense; once established, a second negotiation frame does not.
    pub fn permits(&self, channel: Channel) -> bool {
        match self {
            Self::Negotiating { .. } => matches!(
                channel,
                Channel::Negotiate | Channel::KeepAlive | Channel::Close
            ),
            Self::Established { .. } => channel != Channel::Negotiate,
            Self::Closing => channel == Channel::Close,
            Self::Disconnected { .. } | Self::Connecting => false,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), OscarError> {
        match self {
            Self::Disconnected { .. } => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(OscarError::InvalidTransition(
                "cannot connect: not in Disconnected state",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn begin_negotiation(&mut self) -> Result<(), OscarError> {
        match self {
            Self::Connecting => {
                *self = Self::Negotiating {
                    version_seen: false,
                };
                Ok(())
            }
            _ => Err(OscarError::InvalidTransition(
                "cannot negotiate: not in Connecting state",
            )),
        }
    }

    /// The server's version frame arrived.
    pub fn server_version(&mut self, version: u32) -> Result<(), OscarError> {
        match self {
            Self::Negotiating {
                version_seen: false,
            } if version == PROTOCOL_VERSION => {
                *self = Self::Negotiating { version_seen: true };
                Ok(())
            }
            Self::Negotiating {
                version_seen: false,
            } => Err(OscarError::ProtocolViolation(
                "unsupported protocol version in open handshake",
            )),
            _ => Err(OscarError::InvalidTransition(
                "version frame outside the open handshake",
            )),
        }
    }

    /// Our answer went out. Valid from `Negotiating` once the server's
    /// version has been seen.
    pub fn establish(&mut self) -> Result<(), OscarError> {
        match self {
            Self::Negotiating { version_seen: true } => {
                *self = Self::Established {
                    since: Instant::now(),
                };
                Ok(())
            }
            Self::Negotiating {
                version_seen: false,
            } => Err(OscarError::InvalidTransition(
                "cannot establish: server version not seen",
            )),
            _ => Err(OscarError::InvalidTransition(
                "cannot establish: not in Negotiating state",
            )),
        }
    }

    /// We are sending a close frame.
    ///
    /// Closing an already-closing connection is a no-op.
    pub fn begin_close(&mut self) -> Result<(), OscarError> {
        match self {
            Self::Connecting | Self::Negotiating { .. } | Self::Established { .. } => {
                *self = Self::Closing;
                Ok(())
            }
            Self::Closing => Ok(()),
            Self::Disconnected { .. } => Err(OscarError::InvalidTransition(
                "cannot close: already Disconnected",
            )),
        }
    }

    /// Our close frame has been written. Valid from: `Closing`.
    pub fn finish_close(&mut self) -> Result<(), OscarError> {
        match self {
            Self::Closing => {
                *self = Self::Disconnected {
                    reason: Some(CloseReason::Local),
                };
                Ok(())
            }
            _ => Err(OscarError::InvalidTransition(
                "cannot finish close: not in Closing state",
            )),
        }
    }

    /// The connection ended for `reason` (server close frame, error frame,
    /// failure). Goes straight to `Disconnected` from any phase; the first
    /// recorded reason wins.
    pub fn closed(&mut self, reason: CloseReason) {
        if let Self::Disconnected { reason: Some(_) } = self {
            return;
        }
        *self = Self::Disconnected {
            reason: Some(reason),
        };
    }
}

// ── Tests ────────────────────────────────────────────────────────
