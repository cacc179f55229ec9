//! # oscar-core
//!
//! Client-side core of the OSCAR instant messaging protocol.
//!
//! This crate contains:
//! - **Binary codec**: `ByteReader`/`ByteWriter` cursors and the `TlvBlock`/`TlvWriter` containers
//! - **Frames**: `Frame`, `FrameCodec` for framed TCP I/O via `tokio_util`
//! - **Sub-messages**: `Snac`, `SnacHeader`, and the `Dispatcher` keyed by (family, subtype)
//! - **Network**: `Handshake`/`Connection` with reader, writer and keepalive tasks
//! - **Services**: redirects, delayed queues, rate classes and pause handling
//! - **Rendezvous**: peer negotiation over ICBM channel 2, direct and proxied
//! - **Chat**: per-room membership and messages
//! - **Session**: the driver task tying it all together
//! - **Error**: `OscarError`, a typed `thiserror`-based error hierarchy

pub mod buffer;
pub mod chat;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod encoding;
pub mod error;
pub mod flags;
pub mod header;
pub mod message;
pub mod network;
pub mod packet;
pub mod rendezvous;
pub mod service;
pub mod session;
pub mod state;
pub mod tlv;
pub mod user;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use buffer::{ByteReader, ByteWriter};
pub use chat::{ChatEvent, ChatMessage, ChatRoom, ChatRoomHandle, ChatRooms};
pub use codec::FrameCodec;
pub use config::OscarConfig;
pub use dispatch::{Dispatcher, RequestIdGenerator, SnacContext, SnacHandler};
pub use encoding::{Charset, DefaultTextCodec, TextCodec};
pub use error::{CancelReason, OscarError, RendezvousFailure};
pub use flags::{RoomFlags, SnacFlags};
pub use header::{FRAME_HEADER_LEN, FRAME_MARKER, FrameHeader, SNAC_HEADER_LEN, SnacHeader};
pub use message::Channel;
pub use network::{BoxedStream, CloseReason, Connection, Connector, TcpConnector};
pub use packet::{Frame, Snac};
pub use rendezvous::{
    Capability, Cookie, FeatureHandler, Invitation, InviteOptions, NegotiationId,
    NegotiationState, RendezvousEngine, RendezvousEvent,
};
pub use service::{RoomKey, ServiceKey};
pub use session::{Outbox, Session, SessionEvent};
pub use state::ConnectionPhase;
pub use tlv::{Tlv, TlvBlock, TlvWriter};
pub use user::UserInfo;
