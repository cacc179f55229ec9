//! Domain-specific error types for the OSCAR protocol stack.
//!
//! All fallible operations return `Result<T, OscarError>`.
//! No panics on peer-supplied input; every error is typed and recoverable.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the OSCAR stack.
#[derive(Debug, Error)]
pub enum OscarError {
    // ── Framing Errors ───────────────────────────────────────────
    /// A frame did not start with the `0x2A` marker.
    #[error("invalid frame marker: {0:#04x}")]
    InvalidMarker(u8),

    /// A frame named a channel outside 1..=5.
    #[error("unknown frame channel: {0}")]
    UnknownChannel(u8),

    /// The advertised body length exceeds the configured ceiling.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A read ran past the end of the buffer.
    #[error("truncated data: wanted {wanted} bytes, {remaining} remaining")]
    Truncated { wanted: usize, remaining: usize },

    // ── Protocol Errors ──────────────────────────────────────────
    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u32 },

    /// A message violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The server answered a request with an error sub-message.
    #[error("server error {code:#06x} for family {family:#06x}")]
    ServerError { family: u16, code: u16 },

    /// An invalid connection phase transition was attempted.
    #[error("invalid transition: {0}")]
    InvalidTransition(&'static str),

    // ── Service Errors ───────────────────────────────────────────
    /// A redirect was never answered or its target could not be reached.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The connection is gone; no further traffic can be sent on it.
    #[error("connection closed")]
    ConnectionClosed,

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Negotiation Errors ───────────────────────────────────────
    /// No negotiation is registered under the given cookie.
    #[error("unknown negotiation cookie {0}")]
    UnknownCookie(String),

    /// The negotiation is in a state that does not permit the operation.
    #[error("negotiation in wrong state: {0}")]
    NegotiationState(&'static str),

    /// The rendezvous proxy rejected the handshake.
    #[error("proxy error code {0:#06x}")]
    Proxy(u16),

    // ── Encoding Errors ──────────────────────────────────────────
    /// Text could not be represented in the requested charset.
    #[error("text not representable in {0}")]
    Unencodable(&'static str),

    /// A chat identifier did not follow the URI grammar.
    #[error("malformed chat identifier: {0}")]
    MalformedIdentifier(String),

    /// Configuration could not be parsed.
    #[error("config error: {0}")]
    Config(String),
}

// ── RendezvousFailure ────────────────────────────────────────────

/// Why a negotiation ended without a live connection.
///
/// Delivered only to the feature handler owning the negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendezvousFailure {
    /// The peer or the local user cancelled.
    #[error("transfer cancelled: {0}")]
    Cancelled(CancelReason),

    /// The peer reported a non-default error code.
    #[error("peer reported error code {0:#06x}")]
    PeerError(u16),

    /// A stage or connect attempt ran out of time.
    #[error("negotiation timed out in {0}")]
    TimedOut(&'static str),

    /// Every transport stage failed.
    #[error("no transport could be established: {0}")]
    Unreachable(String),

    /// The session shut down under the negotiation.
    #[error("session closed")]
    SessionClosed,
}

/// Cancel reason codes carried in TLV 0x000B of a rendezvous block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Unspecified,
    Declined,
    NotAcceptable,
    Other(u16),
}

impl From<u16> for CancelReason {
    fn from(code: u16) -> Self {
        match code {
            0 => CancelReason::Unspecified,
            1 => CancelReason::Declined,
            2 => CancelReason::NotAcceptable,
            other => CancelReason::Other(other),
        }
    }
}

impl From<CancelReason> for u16 {
    fn from(reason: CancelReason) -> Self {
        match reason {
            CancelReason::Unspecified => 0,
            CancelReason::Declined => 1,
            CancelReason::NotAcceptable => 2,
            CancelReason::Other(code) => code,
        }
    }
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Unspecified => write!(f, "no reason given"),
            CancelReason::Declined => write!(f, "declined by peer"),
            CancelReason::NotAcceptable => write!(f, "not acceptable"),
            CancelReason::Other(code) => write!(f, "code {code:#06x}"),
        }
    }
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for OscarError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        OscarError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for OscarError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        OscarError::ChannelClosed
    }
}

impl From<toml::de::Error> for OscarError {
    fn from(e: toml::de::Error) -> Self {
        OscarError::Config(e.to_string())
    }
}
