//! Chat rooms: one physical connection per room, membership and messages
//! delivered as an ordered event stream per room.

pub mod message;
pub mod room;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::dispatch::{Dispatcher, SnacContext};
use crate::encoding::{DefaultTextCodec, TextCodec};
use crate::error::OscarError;
use crate::message::{ChatSubtype, family};
use crate::packet::Snac;
use crate::rendezvous::{Cookie, CookieGenerator};
use crate::service::{RoomKey, ServiceKey};
use crate::session::Outbox;

pub use message::ChatMessage;
pub use room::ChatRoom;

const DEFAULT_LANGUAGE: &str = "en";

/// Something that happened in a room, in the order the server reported it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Joined(String),
    Left(String),
    Message(ChatMessage),
    InfoUpdated,
}

struct RoomState {
    room: ChatRoom,
    events: mpsc::UnboundedSender<ChatEvent>,
}

// ── ChatRooms ────────────────────────────────────────────────────

/// Every room this session has joined.
pub struct ChatRooms {
    outbox: Outbox,
    cookies: Arc<CookieGenerator>,
    codec: Arc<dyn TextCodec>,
    rooms: Mutex<HashMap<RoomKey, RoomState>>,
}

impl ChatRooms {
    pub fn new(outbox: Outbox, cookies: Arc<CookieGenerator>) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            cookies,
            codec: Arc::new(DefaultTextCodec),
            rooms: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(self: &Arc<Self>, dispatcher: &mut Dispatcher) {
        for subtype in [
            ChatSubtype::RoomInfoUpdate,
            ChatSubtype::UsersJoined,
            ChatSubtype::UsersLeft,
            ChatSubtype::ChannelMsgToClient,
        ] {
            let rooms = Arc::clone(self);
            dispatcher.register(
                family::CHAT,
                subtype as u16,
                Arc::new(move |ctx: &SnacContext, snac: &Snac| rooms.handle(ctx, snac)),
            );
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomKey, RoomState>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Join the room named by a URI-style identifier and open its
    /// connection.
    pub async fn join(self: &Arc<Self>, uri: &str) -> Result<ChatRoomHandle, OscarError> {
        let room = ChatRoom::from_uri(uri)?;
        let key = room.key();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut rooms = self.rooms();
            if rooms.contains_key(&key) {
                return Err(OscarError::InvalidTransition("room already joined"));
            }
            rooms.insert(key.clone(), RoomState { room, events: tx });
        }
        if let Err(e) = self
            .outbox
            .open_service(ServiceKey::ChatRoom(key.clone()))
            .await
        {
            self.rooms().remove(&key);
            return Err(e);
        }
        tracing::info!("joined {uri}");
        Ok(ChatRoomHandle {
            key,
            rooms: Arc::clone(self),
            events: rx,
        })
    }

    pub fn room(&self, key: &RoomKey) -> Option<ChatRoom> {
        self.rooms().get(key).map(|s| s.room.clone())
    }

    pub fn members(&self, key: &RoomKey) -> Vec<String> {
        self.rooms()
            .get(key)
            .map(|s| s.room.members())
            .unwrap_or_default()
    }

    /// Post `text` to a joined room. Returns the message cookie.
    pub fn send_message(&self, key: &RoomKey, text: &str) -> Result<Cookie, OscarError> {
        if !self.rooms().contains_key(key) {
            return Err(OscarError::ServiceUnavailable(format!("not in room {}", key.cookie)));
        }
        let cookie = self.cookies.next_cookie();
        let body = message::encode_message(cookie, text, DEFAULT_LANGUAGE, self.codec.as_ref())?;
        self.outbox.send(
            ServiceKey::ChatRoom(key.clone()),
            family::CHAT,
            ChatSubtype::ChannelMsgToHost as u16,
            body,
        )?;
        Ok(cookie)
    }

    /// Forget the room and close its connection.
    pub fn leave(&self, key: &RoomKey) -> Result<(), OscarError> {
        if self.rooms().remove(key).is_none() {
            return Ok(());
        }
        tracing::info!("left {}", key.cookie);
        self.outbox.close_service(ServiceKey::ChatRoom(key.clone()))
    }

    /// The room's connection is gone: forget it so its event stream ends.
    pub fn connection_lost(&self, key: &RoomKey) {
        if self.rooms().remove(key).is_some() {
            tracing::warn!("lost connection to {}", key.cookie);
        }
    }

    /// Drop every room; their event streams end.
    pub fn shutdown(&self) {
        self.rooms().clear();
    }

    // ── Incoming ─────────────────────────────────────────────────

    fn handle(&self, ctx: &SnacContext, snac: &Snac) {
        let ServiceKey::ChatRoom(key) = &ctx.service else {
            tracing::debug!("chat sub-message on {}; ignoring", ctx.service);
            return;
        };
        let mut rooms = self.rooms();
        let Some(state) = rooms.get_mut(key) else {
            tracing::debug!("chat sub-message for unknown room {}", key.cookie);
            return;
        };
        if let Err(e) = self.apply(state, snac) {
            tracing::warn!("{}: bad chat sub-message {:#06x}: {e}", key.cookie, snac.subtype());
        }
    }

    fn apply(&self, state: &mut RoomState, snac: &Snac) -> Result<(), OscarError> {
        let mut events = Vec::new();
        match ChatSubtype::try_from(snac.subtype())? {
            ChatSubtype::RoomInfoUpdate => {
                let info = ChatRoom::from_info_block(&mut snac.reader())?;
                state.room.update_info(info);
                events.push(ChatEvent::InfoUpdated);
            }
            ChatSubtype::UsersJoined => {
                let users = room::read_users(&mut snac.reader())?;
                events.extend(state.room.join(&users).into_iter().map(ChatEvent::Joined));
            }
            ChatSubtype::UsersLeft => {
                let users = room::read_users(&mut snac.reader())?;
                events.extend(state.room.leave(&users).into_iter().map(ChatEvent::Left));
            }
            ChatSubtype::ChannelMsgToClient => {
                let message = ChatMessage::parse(&snac.body, self.codec.as_ref())?;
                events.push(ChatEvent::Message(message));
            }
            other => tracing::debug!("ignoring chat {other:?}"),
        }
        for event in events {
            let _ = state.events.send(event);
        }
        Ok(())
    }
}

// ── ChatRoomHandle ───────────────────────────────────────────────

/// A joined room.
pub struct ChatRoomHandle {
    key: RoomKey,
    rooms: Arc<ChatRooms>,
    events: mpsc::UnboundedReceiver<ChatEvent>,
}

impl ChatRoomHandle {
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn room(&self) -> Option<ChatRoom> {
        self.rooms.room(&self.key)
    }

    pub fn members(&self) -> Vec<String> {
        self.rooms.members(&self.key)
    }

    pub fn send_message(&self, text: &str) -> Result<Cookie, OscarError> {
        self.rooms.send_message(&self.key, text)
    }

    /// Next room event; `None` after leaving or session shutdown.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        self.events.recv().await
    }

    pub fn leave(self) -> Result<(), OscarError> {
        self.rooms.leave(&self.key)
    }
}
