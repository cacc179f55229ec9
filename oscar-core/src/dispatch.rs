//! Sub-message dispatch: a `(family, subtype)` handler table plus one-shot
//! continuations keyed by request id.
//!
//! A continuation registered for the id of an earlier request wins over the
//! generic handler, fires at most once, and is removed when it fires.
//! Sub-messages with neither are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::network::ConnectionId;
use crate::packet::Snac;
use crate::service::ServiceKey;

// ── RequestIdGenerator ───────────────────────────────────────────

/// Session-scoped source of sub-message request ids.
///
/// Ids wrap from `u32::MAX` back to zero.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU32,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Handlers ─────────────────────────────────────────────────────

/// Where a sub-message arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnacContext {
    pub connection: ConnectionId,
    pub service: ServiceKey,
}

/// A generic handler for one `(family, subtype)` pair.
pub trait SnacHandler: Send + Sync {
    fn handle(&self, ctx: &SnacContext, snac: &Snac);
}

impl<F> SnacHandler for F
where
    F: Fn(&SnacContext, &Snac) + Send + Sync,
{
    fn handle(&self, ctx: &SnacContext, snac: &Snac) {
        self(ctx, snac)
    }
}

/// A one-shot reply handler.
pub type Continuation = Box<dyn FnOnce(&SnacContext, &Snac) + Send + Sync>;

/// How [`Dispatcher::dispatch`] disposed of a sub-message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Continuation,
    Handler,
    Dropped,
}

// ── Dispatcher ───────────────────────────────────────────────────

struct Pending {
    continuation: Continuation,
    /// Connection the request went out on, once written.
    sent_on: Option<ConnectionId>,
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<(u16, u16), Arc<dyn SnacHandler>>,
    continuations: HashMap<u32, Pending>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `(family, subtype)`, returning the one it
    /// replaces.
    pub fn register(
        &mut self,
        family: u16,
        subtype: u16,
        handler: Arc<dyn SnacHandler>,
    ) -> Option<Arc<dyn SnacHandler>> {
        self.handlers.insert((family, subtype), handler)
    }

    pub fn unregister(&mut self, family: u16, subtype: u16) -> Option<Arc<dyn SnacHandler>> {
        self.handlers.remove(&(family, subtype))
    }

    /// Register a one-shot continuation for replies to `request_id`.
    pub fn expect_reply(&mut self, request_id: u32, continuation: Continuation) {
        let pending = Pending {
            continuation,
            sent_on: None,
        };
        if self.continuations.insert(request_id, pending).is_some() {
            tracing::warn!("request id {request_id} reused while a reply was still outstanding");
        }
    }

    /// Drop a continuation that will never fire (request undeliverable).
    pub fn forget_reply(&mut self, request_id: u32) -> bool {
        self.continuations.remove(&request_id).is_some()
    }

    /// Note that `request_id` was written to `connection`.
    pub fn mark_sent(&mut self, request_id: u32, connection: ConnectionId) {
        if let Some(pending) = self.continuations.get_mut(&request_id) {
            pending.sent_on = Some(connection);
        }
    }

    /// Drop every continuation waiting on a reply from `connection`,
    /// returning their request ids in ascending order.
    pub fn forget_connection(&mut self, connection: ConnectionId) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .continuations
            .iter()
            .filter(|(_, p)| p.sent_on == Some(connection))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in &ids {
            self.continuations.remove(id);
        }
        ids
    }

    pub fn is_awaiting(&self, request_id: u32) -> bool {
        self.continuations.contains_key(&request_id)
    }

    pub fn pending_replies(&self) -> usize {
        self.continuations.len()
    }

    pub fn dispatch(&mut self, ctx: &SnacContext, snac: &Snac) -> Dispatched {
        if let Some(pending) = self.continuations.remove(&snac.request_id()) {
            (pending.continuation)(ctx, snac);
            return Dispatched::Continuation;
        }
        match self.handlers.get(&snac.header.key()) {
            Some(handler) => {
                handler.handle(ctx, snac);
                Dispatched::Handler
            }
            None => {
                tracing::debug!(
                    family = snac.family(),
                    subtype = snac.subtype(),
                    "no handler registered; dropping sub-message"
                );
                Dispatched::Dropped
            }
        }
    }

    /// Remove every handler and continuation.
    pub fn clear(&mut self) {
        self.handlers.clear();
        self.continuations.clear();
    }
}

// ── Tests ────────────────────────────────────────────────────────
