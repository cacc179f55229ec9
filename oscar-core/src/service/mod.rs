//! Service bookkeeping: which physical connection serves which family or
//! chat room, and which redirects are still outstanding.
//!
//! Owned by the session driver, so nothing here locks.

pub mod queue;
pub mod rate;
pub mod redirect;

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::OscarError;
use crate::message::family;
use crate::network::{Connection, ConnectionId};
use crate::packet::Snac;

pub use queue::DelayedQueue;
pub use rate::{RateChangeCode, RateClass, RateTable};
pub use redirect::Redirect;

// ── Keys ─────────────────────────────────────────────────────────

/// Identifies one chat room connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    pub exchange: u16,
    pub cookie: String,
    pub instance: u16,
}

impl RoomKey {
    /// `[u16 exchange][u8-prefixed cookie][u16 instance]`
    pub fn write_block(&self, w: &mut ByteWriter) {
        w.write_u16(self.exchange)
            .write_name(&self.cookie)
            .write_u16(self.instance);
    }

    pub fn read_block(r: &mut ByteReader<'_>) -> Result<Self, OscarError> {
        Ok(Self {
            exchange: r.read_u16()?,
            cookie: r.read_name()?,
            instance: r.read_u16()?,
        })
    }
}

/// What a physical connection was opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    Family(u16),
    ChatRoom(RoomKey),
}

impl ServiceKey {
    /// The family a service request for this key names.
    pub fn family(&self) -> u16 {
        match self {
            Self::Family(f) => *f,
            Self::ChatRoom(_) => family::CHAT,
        }
    }

    pub fn is_chat_room(&self) -> bool {
        matches!(self, Self::ChatRoom(_))
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Family(family) => write!(f, "family {family:#06x}"),
            Self::ChatRoom(room) => write!(f, "chat room {}", room.cookie),
        }
    }
}

// ── PendingRedirect ──────────────────────────────────────────────

/// A service request that has not produced a live connection yet.
#[derive(Debug)]
pub struct PendingRedirect {
    pub request_id: u32,
    pub started: Instant,
    /// Sub-messages for the service, in the order callers sent them.
    pub queue: DelayedQueue<Snac>,
    waiters: Vec<oneshot::Sender<Result<(), OscarError>>>,
    /// Set once the redirect reply arrived and a connect is under way.
    pub connecting: Option<ConnectionId>,
}

impl PendingRedirect {
    fn new(request_id: u32, started: Instant) -> Self {
        Self {
            request_id,
            started,
            queue: DelayedQueue::new(),
            waiters: Vec::new(),
            connecting: None,
        }
    }

    pub fn add_waiter(&mut self, waiter: oneshot::Sender<Result<(), OscarError>>) {
        self.waiters.push(waiter);
    }

    /// Resolve every waiter; `error` of `None` means success.
    pub fn notify(&mut self, error: Option<&str>) {
        for waiter in self.waiters.drain(..) {
            let outcome = match error {
                None => Ok(()),
                Some(reason) => Err(OscarError::ServiceUnavailable(reason.to_string())),
            };
            let _ = waiter.send(outcome);
        }
    }
}

// ── ServiceManager ───────────────────────────────────────────────

struct Attached {
    connection: Connection,
    label: ServiceKey,
    families: Vec<u16>,
}

#[derive(Default)]
pub struct ServiceManager {
    connections: HashMap<ConnectionId, Attached>,
    routes: HashMap<ServiceKey, ConnectionId>,
    pending: HashMap<ServiceKey, PendingRedirect>,
    by_request: HashMap<u32, ServiceKey>,
}

impl ServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Connections ──────────────────────────────────────────────

    /// Register a live connection under the one service it was opened for.
    pub fn attach(&mut self, connection: Connection, label: ServiceKey) {
        let id = connection.id();
        tracing::debug!("connection {id} serves {label}");
        self.routes.insert(label.clone(), id);
        self.connections.insert(
            id,
            Attached {
                connection,
                label,
                families: Vec::new(),
            },
        );
    }

    /// Forget a connection and every route through it.
    pub fn detach(&mut self, id: ConnectionId) -> Option<(Connection, ServiceKey)> {
        let attached = self.connections.remove(&id)?;
        self.routes.retain(|_, routed| *routed != id);
        Some((attached.connection, attached.label))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id).map(|a| &a.connection)
    }

    pub fn label(&self, id: ConnectionId) -> Option<&ServiceKey> {
        self.connections.get(&id).map(|a| &a.label)
    }

    pub fn families(&self, id: ConnectionId) -> &[u16] {
        self.connections
            .get(&id)
            .map(|a| a.families.as_slice())
            .unwrap_or_default()
    }

    pub fn route(&self, key: &ServiceKey) -> Option<&Connection> {
        self.routes
            .get(key)
            .and_then(|id| self.connection(*id))
    }

    /// Record the families a connection announced as online.
    ///
    /// Families already served elsewhere keep their route. Chat room
    /// connections are only reachable through their room key.
    pub fn add_families(&mut self, id: ConnectionId, families: &[u16]) {
        let Some(attached) = self.connections.get_mut(&id) else {
            return;
        };
        attached.families = families.to_vec();
        if attached.label.is_chat_room() {
            return;
        }
        for family in families {
            self.routes.entry(ServiceKey::Family(*family)).or_insert(id);
        }
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remove every connection, for teardown.
    pub fn take_connections(&mut self) -> Vec<Connection> {
        self.routes.clear();
        self.connections
            .drain()
            .map(|(_, attached)| attached.connection)
            .collect()
    }

    // ── Redirects ────────────────────────────────────────────────

    pub fn begin_redirect(
        &mut self,
        key: ServiceKey,
        request_id: u32,
        now: Instant,
    ) -> &mut PendingRedirect {
        self.by_request.insert(request_id, key.clone());
        self.pending
            .entry(key)
            .or_insert_with(|| PendingRedirect::new(request_id, now))
    }

    pub fn pending_mut(&mut self, key: &ServiceKey) -> Option<&mut PendingRedirect> {
        self.pending.get_mut(key)
    }

    pub fn is_pending(&self, key: &ServiceKey) -> bool {
        self.pending.contains_key(key)
    }

    /// The service a redirect request id was issued for.
    pub fn redirect_for(&self, request_id: u32) -> Option<&ServiceKey> {
        self.by_request.get(&request_id)
    }

    pub fn finish_redirect(&mut self, key: &ServiceKey) -> Option<PendingRedirect> {
        let pending = self.pending.remove(key)?;
        self.by_request.remove(&pending.request_id);
        Some(pending)
    }

    /// Redirects still unanswered after `limit`; ones already connecting
    /// are left to their connect timeout.
    pub fn expired_redirects(&self, now: Instant, limit: Duration) -> Vec<ServiceKey> {
        self.pending
            .iter()
            .filter(|(_, p)| p.connecting.is_none() && now.duration_since(p.started) >= limit)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn take_redirects(&mut self) -> Vec<(ServiceKey, PendingRedirect)> {
        self.by_request.clear();
        self.pending.drain().collect()
    }
}
