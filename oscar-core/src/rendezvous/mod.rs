//! Peer-to-peer negotiation over ICBM channel 2.
//!
//! The engine keeps two cookie tables, one for negotiations we proposed and
//! one for negotiations the peer proposed; they are never merged. Each
//! negotiation is routed by capability to a [`FeatureHandler`], which
//! receives the live transport stream or a typed failure.
//!
//! Transport attempts run as spawned tasks and report back with the
//! attempt generation they were started for, so results from a superseded
//! stage are ignored.

pub mod capability;
pub mod cookie;
pub mod message;
pub mod negotiation;
pub mod proxy;

use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::RendezvousConfig;
use crate::dispatch::{Dispatcher, SnacContext};
use crate::encoding::{DefaultTextCodec, TextCodec};
use crate::error::{CancelReason, OscarError, RendezvousFailure};
use crate::message::{IcbmSubtype, family};
use crate::network::{BoxedStream, Connector, PeerListener};
use crate::packet::Snac;
use crate::service::ServiceKey;
use crate::session::Outbox;
use crate::user::normalize_name;

pub use capability::Capability;
pub use cookie::{Cookie, CookieGenerator};
pub use message::{ClientError, IncomingRendezvous, RendezvousKind, RendezvousMessage};
pub use negotiation::{Endpoints, Negotiation, NegotiationId, NegotiationState, Origin, Stage};

// ── Feature routing ──────────────────────────────────────────────

/// What a peer offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub peer: String,
    pub capability: Capability,
    pub message: Option<String>,
    pub language: Option<String>,
    pub service_data: Option<Bytes>,
    pub endpoints: Endpoints,
}

pub enum RendezvousEvent {
    /// The peer proposed; answer with `accept` or `cancel`.
    Proposed(Invitation),
    /// The transport is live and both sides accepted.
    Connected(BoxedStream),
    Completed,
    Ended(RendezvousFailure),
}

impl fmt::Debug for RendezvousEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Proposed(inv) => f.debug_tuple("Proposed").field(inv).finish(),
            Self::Connected(_) => f.write_str("Connected(..)"),
            Self::Completed => f.write_str("Completed"),
            Self::Ended(failure) => f.debug_tuple("Ended").field(failure).finish(),
        }
    }
}

/// Consumer of negotiations for one capability.
///
/// Called from the session's processing path; implementations should hand
/// work off rather than block.
pub trait FeatureHandler: Send + Sync {
    fn on_event(&self, id: NegotiationId, event: RendezvousEvent);
}

/// Options for an outgoing proposal.
#[derive(Debug, Clone, Default)]
pub struct InviteOptions {
    pub message: Option<String>,
    pub service_data: Option<Bytes>,
    /// Skip the direct stage and go through the proxy.
    pub use_proxy: bool,
}

// ── Tables ───────────────────────────────────────────────────────

struct Entry {
    negotiation: Negotiation,
    stream: Option<BoxedStream>,
    task: Option<JoinHandle<()>>,
    invitation: Option<String>,
    service_data: Option<Bytes>,
    /// Stage named by the peer's latest proposal.
    offered: Stage,
}

impl Entry {
    fn new(negotiation: Negotiation) -> Self {
        Self {
            negotiation,
            stream: None,
            task: None,
            invitation: None,
            service_data: None,
            offered: Stage::Direct,
        }
    }

    fn set_task(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.task.replace(task) {
            old.abort();
        }
    }

    /// A proposal from us at the current stage.
    fn proposal(&self) -> RendezvousMessage {
        let n = &self.negotiation;
        RendezvousMessage {
            stage: n.stage().map(|s| s as u16).unwrap_or(1),
            invitation: self.invitation.clone(),
            service_data: self.service_data.clone(),
            ..RendezvousMessage::new(RendezvousKind::Propose, n.id.cookie, n.capability)
        }
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Default)]
struct CookieTables {
    local: HashMap<Cookie, Entry>,
    remote: HashMap<Cookie, Entry>,
}

impl CookieTables {
    fn table(&mut self, origin: Origin) -> &mut HashMap<Cookie, Entry> {
        match origin {
            Origin::Local => &mut self.local,
            Origin::Remote => &mut self.remote,
        }
    }

    fn get_mut(&mut self, id: NegotiationId) -> Option<&mut Entry> {
        self.table(id.origin).get_mut(&id.cookie)
    }

    fn remove(&mut self, id: NegotiationId) -> Option<Entry> {
        self.table(id.origin).remove(&id.cookie)
    }

    /// Match an incoming cookie. Our own cookies only match when the
    /// message comes from the party we proposed to.
    fn find(&self, cookie: &Cookie, sender: &str) -> Option<NegotiationId> {
        let from = |entry: &Entry| normalize_name(&entry.negotiation.peer) == sender;
        if self.local.get(cookie).is_some_and(from) {
            return Some(NegotiationId {
                origin: Origin::Local,
                cookie: *cookie,
            });
        }
        if self.remote.get(cookie).is_some_and(from) {
            return Some(NegotiationId {
                origin: Origin::Remote,
                cookie: *cookie,
            });
        }
        None
    }

    fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }
}

// ── Effects ──────────────────────────────────────────────────────

/// Work decided under the table lock and carried out after releasing it.
enum Effect {
    Send {
        peer: String,
        message: RendezvousMessage,
    },
    Notify {
        id: NegotiationId,
        capability: Capability,
        event: RendezvousEvent,
    },
}

enum Attempt {
    Listen(Box<dyn PeerListener>),
    ConnectDirect(Vec<SocketAddrV4>),
    ProxyJoin { address: String, port: u16 },
    ProxyHost,
}

impl Attempt {
    /// The side that opens the socket toward the peer sends the accept.
    fn sends_accept(&self) -> bool {
        matches!(self, Self::ConnectDirect(_) | Self::ProxyJoin { .. })
    }
}

// ── RendezvousEngine ─────────────────────────────────────────────

pub struct RendezvousEngine {
    outbox: Outbox,
    connector: Arc<dyn Connector>,
    config: RendezvousConfig,
    screen_name: String,
    cookies: Arc<CookieGenerator>,
    codec: Arc<dyn TextCodec>,
    tables: Mutex<CookieTables>,
    features: RwLock<HashMap<Capability, Arc<dyn FeatureHandler>>>,
    closed: AtomicBool,
}

impl RendezvousEngine {
    pub fn new(
        outbox: Outbox,
        connector: Arc<dyn Connector>,
        config: RendezvousConfig,
        screen_name: impl Into<String>,
        cookies: Arc<CookieGenerator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            connector,
            config,
            screen_name: screen_name.into(),
            cookies,
            codec: Arc::new(DefaultTextCodec),
            tables: Mutex::new(CookieTables::default()),
            features: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Install the ICBM handlers this engine consumes.
    pub fn register(self: &Arc<Self>, dispatcher: &mut Dispatcher) {
        let engine = Arc::clone(self);
        dispatcher.register(
            family::ICBM,
            IcbmSubtype::ChannelMsgToClient as u16,
            Arc::new(move |_: &SnacContext, snac: &Snac| engine.handle_icbm(snac)),
        );
        let engine = Arc::clone(self);
        dispatcher.register(
            family::ICBM,
            IcbmSubtype::ClientError as u16,
            Arc::new(move |_: &SnacContext, snac: &Snac| engine.handle_client_error(snac)),
        );
    }

    /// Route negotiations for `capability` to `handler`.
    pub fn register_feature(&self, capability: Capability, handler: Arc<dyn FeatureHandler>) {
        self.features
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(capability, handler);
    }

    fn tables(&self) -> MutexGuard<'_, CookieTables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.stage_timeout()
    }

    /// Number of negotiations in either table.
    pub fn live_negotiations(&self) -> usize {
        self.tables().len()
    }

    pub fn state(&self, id: NegotiationId) -> Option<NegotiationState> {
        self.tables()
            .get_mut(id)
            .map(|e| e.negotiation.state().clone())
    }

    // ── Caller operations ────────────────────────────────────────

    /// Propose `capability` to `peer`.
    pub async fn invite(
        self: &Arc<Self>,
        peer: &str,
        capability: Capability,
        options: InviteOptions,
    ) -> Result<NegotiationId, OscarError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OscarError::ConnectionClosed);
        }
        let listener = if capability.needs_transport() && !options.use_proxy {
            match self.connector.listen(&self.config.listen_ip).await {
                Ok(listener) => Some(listener),
                Err(e) if self.config.proxy_fallback => {
                    tracing::info!("cannot listen for {peer} ({e}); using the proxy");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let mut effects = Vec::new();
        let id = {
            let mut tables = self.tables();
            let cookie = self.cookies.next_unique(|c| tables.local.contains_key(c));
            let id = NegotiationId {
                origin: Origin::Local,
                cookie,
            };
            let mut entry = Entry::new(Negotiation::new(id, peer, capability, self.deadline()));
            entry.invitation = options.message;
            entry.service_data = options.service_data;

            if !capability.needs_transport() {
                effects.push(Effect::Send {
                    peer: peer.to_string(),
                    message: entry.proposal(),
                });
            } else if let Some(listener) = listener {
                let attempt = entry.negotiation.enter_stage(Stage::Direct, self.deadline())?;
                let (ip, port) = listener.local_addr();
                // Without a usable address the peer falls back to the
                // server-verified one.
                let advertised = self
                    .config
                    .advertised_ip
                    .parse::<Ipv4Addr>()
                    .ok()
                    .or_else(|| Some(ip).filter(|ip| !ip.is_unspecified()));
                entry.negotiation.endpoints.client_ip = advertised;
                entry.negotiation.endpoints.port = Some(port);
                effects.push(Effect::Send {
                    peer: peer.to_string(),
                    message: RendezvousMessage {
                        client_ip: advertised,
                        port: Some(port),
                        ..entry.proposal()
                    },
                });
                entry.set_task(self.spawn_attempt(id, attempt, Attempt::Listen(listener)));
            } else {
                let attempt = entry.negotiation.enter_stage(Stage::Proxy2, self.deadline())?;
                entry.set_task(self.spawn_attempt(id, attempt, Attempt::ProxyHost));
            }
            tracing::debug!("proposed {capability:?} to {peer} as {id}");
            tables.local.insert(cookie, entry);
            id
        };
        self.apply(effects);
        Ok(id)
    }

    /// Accept a proposal the peer made.
    pub fn accept(self: &Arc<Self>, id: NegotiationId) -> Result<(), OscarError> {
        let mut effects = Vec::new();
        {
            let mut tables = self.tables();
            let entry = tables
                .get_mut(id)
                .ok_or_else(|| OscarError::UnknownCookie(id.to_string()))?;
            if id.origin != Origin::Remote || entry.negotiation.state() != &NegotiationState::Proposed {
                return Err(OscarError::NegotiationState("only a fresh peer proposal can be accepted"));
            }
            let n = &mut entry.negotiation;
            if !n.capability.needs_transport() {
                n.accepted()?;
                n.complete()?;
                effects.push(Effect::Send {
                    peer: n.peer.clone(),
                    message: RendezvousMessage::accept(n.id.cookie, n.capability),
                });
                effects.push(Effect::Notify {
                    id,
                    capability: n.capability,
                    event: RendezvousEvent::Completed,
                });
                tables.remove(id);
            } else {
                let stage = if n.endpoints.use_proxy {
                    entry.offered.max(Stage::Proxy2)
                } else {
                    entry.offered
                };
                self.respond(id, entry, stage)?;
            }
        }
        self.apply(effects);
        Ok(())
    }

    /// Cancel a negotiation. Returns `false` if there was nothing to cancel.
    pub fn cancel(&self, id: NegotiationId, reason: CancelReason) -> Result<bool, OscarError> {
        let mut effects = Vec::new();
        let cancelled = {
            let mut tables = self.tables();
            let Some(entry) = tables.get_mut(id) else {
                return Ok(false);
            };
            if !entry.negotiation.cancel(reason)? {
                return Ok(false);
            }
            let n = &entry.negotiation;
            effects.push(Effect::Send {
                peer: n.peer.clone(),
                message: RendezvousMessage::cancel(id.cookie, n.capability, reason.into()),
            });
            effects.push(Effect::Notify {
                id,
                capability: n.capability,
                event: RendezvousEvent::Ended(RendezvousFailure::Cancelled(reason)),
            });
            tables.remove(id);
            true
        };
        tracing::debug!("cancelled {id}: {reason}");
        self.apply(effects);
        Ok(cancelled)
    }

    /// The feature finished using the transport.
    pub fn complete(&self, id: NegotiationId) -> Result<(), OscarError> {
        let mut tables = self.tables();
        let entry = tables
            .get_mut(id)
            .ok_or_else(|| OscarError::UnknownCookie(id.to_string()))?;
        entry.negotiation.complete()?;
        tables.remove(id);
        tracing::debug!("completed {id}");
        Ok(())
    }

    /// Fail every negotiation whose stage deadline has passed.
    pub fn sweep(&self, now: Instant) {
        let mut effects = Vec::new();
        {
            let mut tables = self.tables();
            for origin in [Origin::Local, Origin::Remote] {
                let expired: Vec<Cookie> = tables
                    .table(origin)
                    .iter()
                    .filter(|(_, e)| e.negotiation.is_expired(now))
                    .map(|(c, _)| *c)
                    .collect();
                for cookie in expired {
                    let id = NegotiationId { origin, cookie };
                    if let Some(entry) = tables.get_mut(id) {
                        let phase = entry.negotiation.stage().map(Stage::name).unwrap_or("proposal");
                        tracing::info!("{id} timed out in {phase}");
                        fail(&mut effects, entry, RendezvousFailure::TimedOut(phase), true);
                    }
                    tables.remove(id);
                }
            }
        }
        self.apply(effects);
    }

    /// Cancel everything and refuse further work.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut effects = Vec::new();
        {
            let mut tables = self.tables();
            let CookieTables { local, remote } = &mut *tables;
            for (_, mut entry) in local.drain().chain(remote.drain()) {
                if entry.negotiation.is_terminal() {
                    continue;
                }
                fail(&mut effects, &mut entry, RendezvousFailure::SessionClosed, true);
            }
        }
        self.apply(effects);
    }

    // ── Incoming ─────────────────────────────────────────────────

    pub fn handle_icbm(self: &Arc<Self>, snac: &Snac) {
        match IncomingRendezvous::parse(&snac.body, self.codec.as_ref()) {
            Ok(Some(incoming)) => self.handle_incoming(incoming),
            Ok(None) => tracing::debug!("ignoring non-rendezvous ICBM channel message"),
            Err(e) => tracing::warn!("malformed rendezvous message: {e}"),
        }
    }

    pub fn handle_incoming(self: &Arc<Self>, incoming: IncomingRendezvous) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let IncomingRendezvous { sender, message } = incoming;
        let sender_key = sender.normalized();
        let mut effects = Vec::new();
        {
            let mut tables = self.tables();
            match tables.find(&message.cookie, &sender_key) {
                Some(id) => {
                    if let Some(entry) = tables.get_mut(id) {
                        let finished = self.on_message(&mut effects, id, entry, &message);
                        if finished {
                            tables.remove(id);
                        }
                    }
                }
                None if message.kind == RendezvousKind::Propose => {
                    if tables.remote.contains_key(&message.cookie) {
                        tracing::debug!("cookie {} reused by another party; ignoring", message.cookie);
                    } else {
                        self.on_new_proposal(&mut effects, &mut tables, &sender.name, &message);
                    }
                }
                None => tracing::debug!(
                    "{:?} for unknown cookie {} from {}",
                    message.kind,
                    message.cookie,
                    sender.name
                ),
            }
        }
        self.apply(effects);
    }

    pub fn handle_client_error(&self, snac: &Snac) {
        let error = match ClientError::parse(&snac.body) {
            Ok(error) => error,
            Err(e) => {
                tracing::warn!("malformed ICBM client error: {e}");
                return;
            }
        };
        if error.channel != message::RENDEZVOUS_CHANNEL {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut tables = self.tables();
            let Some(id) = tables.find(&error.cookie, &normalize_name(&error.peer)) else {
                return;
            };
            if let Some(entry) = tables.get_mut(id) {
                fail(&mut effects, entry, RendezvousFailure::PeerError(error.reason), false);
            }
            tables.remove(id);
        }
        self.apply(effects);
    }

    fn on_new_proposal(
        self: &Arc<Self>,
        effects: &mut Vec<Effect>,
        tables: &mut CookieTables,
        peer: &str,
        message: &RendezvousMessage,
    ) {
        let known = self
            .features
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&message.capability);
        if !known {
            tracing::info!("declining {:?} from {peer}: no handler", message.capability);
            effects.push(Effect::Send {
                peer: peer.to_string(),
                message: RendezvousMessage::cancel(
                    message.cookie,
                    message.capability,
                    CancelReason::NotAcceptable.into(),
                ),
            });
            return;
        }
        if message.error_code != 0 {
            tracing::debug!("ignoring proposal with error code {}", message.error_code);
            return;
        }

        let id = NegotiationId {
            origin: Origin::Remote,
            cookie: message.cookie,
        };
        let mut negotiation = Negotiation::new(id, peer, message.capability, self.deadline());
        negotiation.endpoints = endpoints_of(message);
        let mut entry = Entry::new(negotiation);
        entry.invitation = message.invitation.clone();
        entry.service_data = message.service_data.clone();
        effects.push(Effect::Notify {
            id,
            capability: message.capability,
            event: RendezvousEvent::Proposed(Invitation {
                peer: peer.to_string(),
                capability: message.capability,
                message: message.invitation.clone(),
                language: message.language.clone(),
                service_data: message.service_data.clone(),
                endpoints: entry.negotiation.endpoints.clone(),
            }),
        });
        entry.offered = Stage::from_wire(message.stage).unwrap_or(Stage::Direct);
        tables.remote.insert(message.cookie, entry);
        tracing::debug!("{peer} proposed {:?} as {id}", message.capability);
    }

    /// Apply a message to a known negotiation. Returns `true` when the
    /// entry reached a terminal state and must be purged.
    fn on_message(
        self: &Arc<Self>,
        effects: &mut Vec<Effect>,
        id: NegotiationId,
        entry: &mut Entry,
        message: &RendezvousMessage,
    ) -> bool {
        if message.kind != RendezvousKind::Cancel && message.error_code != 0 {
            entry.negotiation.error_code = message.error_code;
            fail(effects, entry, RendezvousFailure::PeerError(message.error_code), false);
            return true;
        }
        match message.kind {
            RendezvousKind::Cancel => {
                let reason = CancelReason::from(message.error_code);
                match entry.negotiation.cancel(reason) {
                    Ok(true) => {
                        tracing::debug!("{id} cancelled by peer: {reason}");
                        effects.push(Effect::Notify {
                            id,
                            capability: entry.negotiation.capability,
                            event: RendezvousEvent::Ended(RendezvousFailure::Cancelled(reason)),
                        });
                        true
                    }
                    Ok(false) => true,
                    Err(e) => {
                        tracing::debug!("{id}: ignoring cancel: {e}");
                        false
                    }
                }
            }
            RendezvousKind::Accept => {
                let n = &mut entry.negotiation;
                match n.accepted() {
                    Ok(true) => {
                        if let Some(stream) = entry.stream.take() {
                            effects.push(Effect::Notify {
                                id,
                                capability: n.capability,
                                event: RendezvousEvent::Connected(stream),
                            });
                        }
                        false
                    }
                    Ok(false) if !n.capability.needs_transport() => {
                        if n.complete().is_ok() {
                            effects.push(Effect::Notify {
                                id,
                                capability: n.capability,
                                event: RendezvousEvent::Completed,
                            });
                            return true;
                        }
                        false
                    }
                    Ok(false) => false,
                    Err(e) => {
                        tracing::debug!("{id}: ignoring accept: {e}");
                        false
                    }
                }
            }
            RendezvousKind::Propose => {
                let previous = std::mem::replace(&mut entry.negotiation.endpoints, endpoints_of(message));
                let awaiting_answer = id.origin == Origin::Remote
                    && entry.negotiation.state() == &NegotiationState::Proposed;
                if awaiting_answer {
                    entry.offered = Stage::from_wire(message.stage).unwrap_or(entry.offered);
                    return false;
                }
                let stage = Stage::from_wire(message.stage).unwrap_or(Stage::Proxy2);
                if let Err(e) = self.respond(id, entry, stage) {
                    tracing::debug!("{id}: ignoring re-proposal: {e}");
                    entry.negotiation.endpoints = previous;
                }
                false
            }
        }
    }

    /// Start the responding side of `stage`: connect to the peer or join
    /// its proxy stream.
    fn respond(
        self: &Arc<Self>,
        id: NegotiationId,
        entry: &mut Entry,
        stage: Stage,
    ) -> Result<(), OscarError> {
        let endpoints = entry.negotiation.endpoints.clone();
        let attempt = entry.negotiation.enter_stage(stage, self.deadline())?;
        let kind = if stage == Stage::Direct && !endpoints.use_proxy {
            let port = endpoints.port.unwrap_or(0);
            let mut targets = Vec::new();
            for ip in [endpoints.client_ip, endpoints.verified_ip].into_iter().flatten() {
                let addr = SocketAddrV4::new(ip, port);
                if !targets.contains(&addr) {
                    targets.push(addr);
                }
            }
            Attempt::ConnectDirect(targets)
        } else {
            let address = endpoints
                .proxy_ip
                .map(|ip| format!("{ip}:{}", self.config.proxy_port))
                .unwrap_or_else(|| self.config.proxy_address());
            Attempt::ProxyJoin {
                address,
                port: endpoints.port.unwrap_or(0),
            }
        };
        tracing::debug!("{id}: responding in {}", stage.name());
        entry.set_task(self.spawn_attempt(id, attempt, kind));
        Ok(())
    }

    // ── Transport attempts ───────────────────────────────────────

    fn spawn_attempt(self: &Arc<Self>, id: NegotiationId, attempt: u32, kind: Attempt) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let sends_accept = kind.sends_accept();
            let outcome = engine.run_attempt(id, attempt, kind).await;
            engine.finish_attempt(id, attempt, sends_accept, outcome);
        })
    }

    async fn connect(&self, address: &str) -> Result<BoxedStream, OscarError> {
        let limit = self.config.connect_timeout();
        timeout(limit, self.connector.connect(address))
            .await
            .map_err(|_| OscarError::Timeout(limit))?
            .map_err(OscarError::from)
    }

    async fn run_attempt(
        &self,
        id: NegotiationId,
        attempt: u32,
        kind: Attempt,
    ) -> Result<BoxedStream, OscarError> {
        let capability = {
            let mut tables = self.tables();
            match tables.get_mut(id) {
                Some(entry) => entry.negotiation.capability,
                None => return Err(OscarError::UnknownCookie(id.to_string())),
            }
        };
        let stage_limit = self.config.stage_timeout();
        match kind {
            Attempt::Listen(mut listener) => Ok(listener.accept().await?),
            Attempt::ConnectDirect(targets) => {
                let mut last = OscarError::ProtocolViolation("proposal carried no address");
                for target in targets {
                    match self.connect(&target.to_string()).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) => {
                            tracing::debug!("{id}: direct connect to {target} failed: {e}");
                            last = e;
                        }
                    }
                }
                Err(last)
            }
            Attempt::ProxyJoin { address, port } => {
                let mut stream = self.connect(&address).await?;
                timeout(
                    stage_limit,
                    proxy::init_receive(&mut stream, &self.screen_name, port, id.cookie, &capability),
                )
                .await
                .map_err(|_| OscarError::Timeout(stage_limit))??;
                Ok(stream)
            }
            Attempt::ProxyHost => {
                let mut stream = self.connect(&self.config.proxy_address()).await?;
                let ack = timeout(
                    stage_limit,
                    proxy::init_send(&mut stream, &self.screen_name, id.cookie, &capability),
                )
                .await
                .map_err(|_| OscarError::Timeout(stage_limit))??;
                self.announce_proxy(id, attempt, ack)?;
                timeout(stage_limit, proxy::await_ready(&mut stream))
                    .await
                    .map_err(|_| OscarError::Timeout(stage_limit))??;
                Ok(stream)
            }
        }
    }

    /// Propose the proxy stream we registered.
    fn announce_proxy(
        &self,
        id: NegotiationId,
        attempt: u32,
        ack: proxy::ProxyAck,
    ) -> Result<(), OscarError> {
        let effect = {
            let mut tables = self.tables();
            let entry = tables
                .get_mut(id)
                .filter(|e| e.negotiation.is_current(attempt))
                .ok_or(OscarError::NegotiationState("proxy attempt superseded"))?;
            entry.negotiation.endpoints.proxy_ip = Some(ack.ip);
            entry.negotiation.endpoints.port = Some(ack.port);
            Effect::Send {
                peer: entry.negotiation.peer.clone(),
                message: RendezvousMessage {
                    proxy_ip: Some(ack.ip),
                    port: Some(ack.port),
                    use_proxy: true,
                    ..entry.proposal()
                },
            }
        };
        self.apply(vec![effect]);
        Ok(())
    }

    fn finish_attempt(
        self: &Arc<Self>,
        id: NegotiationId,
        attempt: u32,
        sends_accept: bool,
        outcome: Result<BoxedStream, OscarError>,
    ) {
        let mut effects = Vec::new();
        {
            let mut tables = self.tables();
            let Some(entry) = tables.get_mut(id) else {
                return;
            };
            if !entry.negotiation.is_current(attempt) {
                tracing::debug!("{id}: discarding result of superseded attempt {attempt}");
                return;
            }
            // This task is finishing; don't let the entry abort it.
            entry.task = None;
            let purge = match outcome {
                Ok(stream) => {
                    self.on_socket_live(&mut effects, id, entry, attempt, sends_accept, stream);
                    false
                }
                Err(e) => self.on_attempt_failed(&mut effects, id, entry, sends_accept, e),
            };
            if purge {
                tables.remove(id);
            }
        }
        self.apply(effects);
    }

    fn on_socket_live(
        &self,
        effects: &mut Vec<Effect>,
        id: NegotiationId,
        entry: &mut Entry,
        attempt: u32,
        sends_accept: bool,
        stream: BoxedStream,
    ) {
        let n = &mut entry.negotiation;
        tracing::debug!("{id}: transport live");
        if sends_accept {
            effects.push(Effect::Send {
                peer: n.peer.clone(),
                message: RendezvousMessage::accept(id.cookie, n.capability),
            });
            if let Err(e) = n.accepted() {
                tracing::debug!("{id}: {e}");
            }
        }
        match n.socket_live(attempt) {
            Ok(true) => effects.push(Effect::Notify {
                id,
                capability: n.capability,
                event: RendezvousEvent::Connected(stream),
            }),
            Ok(false) => entry.stream = Some(stream),
            Err(e) => tracing::debug!("{id}: {e}"),
        }
    }

    /// Returns `true` when the negotiation failed for good.
    fn on_attempt_failed(
        self: &Arc<Self>,
        effects: &mut Vec<Effect>,
        id: NegotiationId,
        entry: &mut Entry,
        responder: bool,
        error: OscarError,
    ) -> bool {
        let stage = entry.negotiation.stage();
        tracing::info!(
            "{id}: {} failed: {error}",
            stage.map(Stage::name).unwrap_or("transport")
        );
        let next = stage
            .and_then(Stage::next)
            .filter(|_| responder && self.config.proxy_fallback)
            .and_then(|next| entry.negotiation.enter_stage(next, self.deadline()).ok());
        if let Some(attempt) = next {
            entry.set_task(self.spawn_attempt(id, attempt, Attempt::ProxyHost));
            return false;
        }
        fail(effects, entry, RendezvousFailure::Unreachable(error.to_string()), true);
        true
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { peer, message } => {
                    let body = match message.to_icbm(&peer, self.codec.as_ref()) {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::warn!("cannot encode rendezvous for {peer}: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = self.outbox.send(
                        ServiceKey::Family(family::ICBM),
                        family::ICBM,
                        IcbmSubtype::ChannelMsgToHost as u16,
                        body,
                    ) {
                        tracing::warn!("cannot send rendezvous to {peer}: {e}");
                    }
                }
                Effect::Notify {
                    id,
                    capability,
                    event,
                } => {
                    let handler = self
                        .features
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .get(&capability)
                        .cloned();
                    match handler {
                        Some(handler) => handler.on_event(id, event),
                        None => tracing::debug!("{id}: no handler for {capability:?}; dropping {event:?}"),
                    }
                }
            }
        }
    }
}

/// Fail `entry`, queueing the handler notice and optionally a cancel to
/// the peer.
fn fail(effects: &mut Vec<Effect>, entry: &mut Entry, failure: RendezvousFailure, tell_peer: bool) {
    let n = &mut entry.negotiation;
    if n.fail(failure.clone()).is_err() {
        return;
    }
    if tell_peer {
        effects.push(Effect::Send {
            peer: n.peer.clone(),
            message: RendezvousMessage::cancel(n.id.cookie, n.capability, CancelReason::Unspecified.into()),
        });
    }
    effects.push(Effect::Notify {
        id: n.id,
        capability: n.capability,
        event: RendezvousEvent::Ended(failure),
    });
}

fn endpoints_of(message: &RendezvousMessage) -> Endpoints {
    Endpoints {
        proxy_ip: message.proxy_ip,
        client_ip: message.client_ip,
        verified_ip: message.verified_ip,
        port: message.port,
        use_proxy: message.use_proxy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ByteReader, ByteWriter};
    use crate::network::TcpConnector;
    use crate::session::Command;
    use crate::tlv::TlvBlock;
    use crate::user::UserInfo;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    use proxy::{ProxyCommand, ProxyPacket};

    struct Recorder(mpsc::UnboundedSender<(NegotiationId, RendezvousEvent)>);

    impl FeatureHandler for Recorder {
        fn on_event(&self, id: NegotiationId, event: RendezvousEvent) {
            let _ = self.0.send((id, event));
        }
    }

    struct Side {
        engine: Arc<RendezvousEngine>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedReceiver<(NegotiationId, RendezvousEvent)>,
    }

    fn side(name: &str, features: &[Capability], config: RendezvousConfig) -> Side {
        let (outbox, commands) = Outbox::detached();
        let engine = RendezvousEngine::new(
            outbox,
            Arc::new(TcpConnector),
            config,
            name,
            Arc::new(CookieGenerator::new()),
        );
        let (tx, events) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder(tx));
        for capability in features {
            engine.register_feature(*capability, recorder.clone());
        }
        Side {
            engine,
            commands,
            events,
        }
    }

    fn local_config() -> RendezvousConfig {
        RendezvousConfig {
            listen_ip: "127.0.0.1".into(),
            proxy_fallback: false,
            ..RendezvousConfig::default()
        }
    }

    /// Decode the rendezvous block of an outgoing ICBM.
    async fn sent(side: &mut Side) -> (String, RendezvousMessage) {
        let Some(Command::Send { snac, .. }) = side.commands.recv().await else {
            panic!("expected an outgoing sub-message");
        };
        assert_eq!(snac.family(), family::ICBM);
        assert_eq!(snac.subtype(), IcbmSubtype::ChannelMsgToHost as u16);
        let mut r = ByteReader::new(&snac.body);
        Cookie::read(&mut r).unwrap();
        assert_eq!(r.read_u16().unwrap(), message::RENDEZVOUS_CHANNEL);
        let peer = r.read_name().unwrap();
        let tlvs = TlvBlock::parse(r.read_rest());
        let block = tlvs.read(0x0005).unwrap();
        (peer, RendezvousMessage::parse_block(block, &DefaultTextCodec).unwrap())
    }

    fn from(sender: &str, message: RendezvousMessage) -> IncomingRendezvous {
        IncomingRendezvous {
            sender: UserInfo::new(sender),
            message,
        }
    }

    fn proposal(capability: Capability) -> RendezvousMessage {
        RendezvousMessage::new(RendezvousKind::Propose, Cookie([4; 8]), capability)
    }

    #[tokio::test]
    async fn unknown_capability_is_declined() {
        let mut bob = side("bob", &[], local_config());
        bob.engine
            .handle_incoming(from("alice", proposal(Capability::FILE_TRANSFER)));
        let (peer, reply) = sent(&mut bob).await;
        assert_eq!(peer, "alice");
        assert_eq!(reply.kind, RendezvousKind::Cancel);
        assert_eq!(CancelReason::from(reply.error_code), CancelReason::NotAcceptable);
        assert_eq!(bob.engine.live_negotiations(), 0);
    }

    #[tokio::test]
    async fn chat_invite_completes_on_accept() {
        let mut bob = side("bob", &[Capability::CHAT], local_config());
        let mut invite = proposal(Capability::CHAT);
        invite.invitation = Some("join us".into());
        bob.engine.handle_incoming(from("alice", invite));

        let (id, event) = bob.events.recv().await.unwrap();
        let RendezvousEvent::Proposed(invitation) = event else {
            panic!("expected a proposal, got {event:?}");
        };
        assert_eq!(invitation.peer, "alice");
        assert_eq!(invitation.message.as_deref(), Some("join us"));
        assert_eq!(id.origin, Origin::Remote);

        bob.engine.accept(id).unwrap();
        let (_, accept) = sent(&mut bob).await;
        assert_eq!(accept.kind, RendezvousKind::Accept);
        assert!(matches!(bob.events.recv().await, Some((_, RendezvousEvent::Completed))));
        assert_eq!(bob.engine.live_negotiations(), 0);
    }

    #[tokio::test]
    async fn cancel_twice_is_a_no_op() {
        let mut bob = side("bob", &[Capability::FILE_TRANSFER], local_config());
        bob.engine
            .handle_incoming(from("alice", proposal(Capability::FILE_TRANSFER)));
        let (id, _) = bob.events.recv().await.unwrap();

        assert!(bob.engine.cancel(id, CancelReason::Declined).unwrap());
        let (_, cancel) = sent(&mut bob).await;
        assert_eq!(cancel.kind, RendezvousKind::Cancel);
        assert_eq!(cancel.error_code, 1);
        assert!(!bob.engine.cancel(id, CancelReason::Declined).unwrap());
        assert_eq!(bob.engine.live_negotiations(), 0);
        assert!(bob.engine.state(id).is_none());
    }

    #[tokio::test]
    async fn peer_cancel_reaches_the_feature() {
        let mut alice = side("alice", &[Capability::CHAT], local_config());
        let id = alice
            .engine
            .invite("Bob", Capability::CHAT, InviteOptions::default())
            .await
            .unwrap();
        let (peer, propose) = sent(&mut alice).await;
        assert_eq!(peer, "Bob");
        assert_eq!(propose.kind, RendezvousKind::Propose);

        let cancel = RendezvousMessage::cancel(propose.cookie, Capability::CHAT, 1);
        alice.engine.handle_incoming(from("bob", cancel));
        let (got, event) = alice.events.recv().await.unwrap();
        assert_eq!(got, id);
        assert!(matches!(
            event,
            RendezvousEvent::Ended(RendezvousFailure::Cancelled(CancelReason::Declined))
        ));
        assert_eq!(alice.engine.live_negotiations(), 0);
    }

    #[tokio::test]
    async fn our_cookie_from_another_party_is_not_ours() {
        let mut alice = side("alice", &[Capability::CHAT], local_config());
        let id = alice
            .engine
            .invite("bob", Capability::CHAT, InviteOptions::default())
            .await
            .unwrap();
        let (_, propose) = sent(&mut alice).await;

        let accept = RendezvousMessage::accept(propose.cookie, Capability::CHAT);
        alice.engine.handle_incoming(from("mallory", accept));
        assert_eq!(alice.engine.state(id), Some(NegotiationState::Proposed));
    }

    #[tokio::test]
    async fn error_code_fails_negotiation() {
        let mut alice = side("alice", &[Capability::CHAT], local_config());
        let id = alice
            .engine
            .invite("bob", Capability::CHAT, InviteOptions::default())
            .await
            .unwrap();
        let (_, propose) = sent(&mut alice).await;

        let mut accept = RendezvousMessage::accept(propose.cookie, Capability::CHAT);
        accept.error_code = 7;
        alice.engine.handle_incoming(from("bob", accept));
        let (_, event) = alice.events.recv().await.unwrap();
        assert!(matches!(
            event,
            RendezvousEvent::Ended(RendezvousFailure::PeerError(7))
        ));
        assert!(alice.engine.state(id).is_none());
    }

    #[tokio::test]
    async fn sweep_times_out_stale_proposals() {
        let config = RendezvousConfig {
            stage_timeout_secs: 0,
            ..local_config()
        };
        let mut bob = side("bob", &[Capability::FILE_TRANSFER], config);
        bob.engine
            .handle_incoming(from("alice", proposal(Capability::FILE_TRANSFER)));
        let _ = bob.events.recv().await.unwrap();

        bob.engine.sweep(Instant::now() + Duration::from_secs(1));
        let (_, cancel) = sent(&mut bob).await;
        assert_eq!(cancel.kind, RendezvousKind::Cancel);
        assert!(matches!(
            bob.events.recv().await,
            Some((_, RendezvousEvent::Ended(RendezvousFailure::TimedOut(_))))
        ));
        assert_eq!(bob.engine.live_negotiations(), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_everything() {
        let mut alice = side("alice", &[Capability::CHAT], local_config());
        alice
            .engine
            .invite("bob", Capability::CHAT, InviteOptions::default())
            .await
            .unwrap();
        let _ = sent(&mut alice).await;

        alice.engine.shutdown();
        let (_, cancel) = sent(&mut alice).await;
        assert_eq!(cancel.kind, RendezvousKind::Cancel);
        assert!(matches!(
            alice.events.recv().await,
            Some((_, RendezvousEvent::Ended(RendezvousFailure::SessionClosed)))
        ));
        assert_eq!(alice.engine.live_negotiations(), 0);
        assert!(
            alice
                .engine
                .invite("bob", Capability::CHAT, InviteOptions::default())
                .await
                .is_err()
        );
    }

    async fn connected(side: &mut Side) -> BoxedStream {
        loop {
            match side.events.recv().await {
                Some((_, RendezvousEvent::Connected(stream))) => return stream,
                Some((_, RendezvousEvent::Proposed(_))) => continue,
                other => panic!("expected a connection, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn direct_connection_between_two_engines() {
        let mut alice = side("alice", &[Capability::FILE_TRANSFER], local_config());
        let mut bob = side("bob", &[Capability::FILE_TRANSFER], local_config());

        alice
            .engine
            .invite("bob", Capability::FILE_TRANSFER, InviteOptions::default())
            .await
            .unwrap();
        let (_, propose) = sent(&mut alice).await;
        assert_eq!(propose.stage, 1);
        assert_eq!(propose.client_ip, Some(Ipv4Addr::LOCALHOST));

        bob.engine.handle_incoming(from("alice", propose));
        let (bob_id, _) = bob.events.recv().await.unwrap();
        bob.engine.accept(bob_id).unwrap();

        let (_, accept) = sent(&mut bob).await;
        assert_eq!(accept.kind, RendezvousKind::Accept);
        let mut bob_stream = connected(&mut bob).await;

        alice.engine.handle_incoming(from("bob", accept.clone()));
        let mut alice_stream = connected(&mut alice).await;

        alice_stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        bob_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(
            alice.engine.state(NegotiationId {
                origin: Origin::Local,
                cookie: accept.cookie,
            }),
            Some(NegotiationState::Connected)
        );
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn unreachable_peer_fails_without_fallback() {
        let mut bob = side("bob", &[Capability::FILE_TRANSFER], local_config());
        let mut offer = proposal(Capability::FILE_TRANSFER);
        offer.client_ip = Some(Ipv4Addr::LOCALHOST);
        offer.port = Some(closed_port().await);
        bob.engine.handle_incoming(from("alice", offer));
        let (id, _) = bob.events.recv().await.unwrap();
        bob.engine.accept(id).unwrap();

        assert!(matches!(
            bob.events.recv().await,
            Some((_, RendezvousEvent::Ended(RendezvousFailure::Unreachable(_))))
        ));
        let (_, cancel) = sent(&mut bob).await;
        assert_eq!(cancel.kind, RendezvousKind::Cancel);
        assert_eq!(bob.engine.live_negotiations(), 0);
    }

    // ── Proxy stages ─────────────────────────────────────────────

    const FT: Capability = Capability::FILE_TRANSFER;

    fn proxy_config(proxy: &TcpListener) -> RendezvousConfig {
        RendezvousConfig {
            proxy_host: "127.0.0.1".into(),
            proxy_port: proxy.local_addr().unwrap().port(),
            proxy_fallback: true,
            ..local_config()
        }
    }

    fn rank(state: &NegotiationState) -> u8 {
        match state {
            NegotiationState::Proposed => 0,
            NegotiationState::Stage1Direct => 1,
            NegotiationState::Stage2Proxy => 2,
            NegotiationState::Stage3Proxy => 3,
            NegotiationState::Connected => 4,
            _ => 5,
        }
    }

    fn assert_forward(trail: &[NegotiationState]) {
        assert!(
            trail.windows(2).all(|w| rank(&w[0]) < rank(&w[1])),
            "stages went backwards: {trail:?}"
        );
    }

    /// Read one client request at the fake proxy: sender, requested
    /// stream port for joins, cookie.
    async fn proxy_request(stream: &mut TcpStream, command: ProxyCommand) -> (String, Option<u16>, Cookie) {
        let packet = ProxyPacket::read_from(stream).await.unwrap();
        assert_eq!(packet.command, command);
        let mut r = ByteReader::new(&packet.body);
        let name = r.read_name().unwrap();
        let port = (command == ProxyCommand::InitReceive).then(|| r.read_u16().unwrap());
        (name, port, Cookie::read(&mut r).unwrap())
    }

    async fn proxy_ack(stream: &mut TcpStream, port: u16) {
        let mut body = ByteWriter::new();
        body.write_u16(port).write_u32(u32::from(Ipv4Addr::LOCALHOST));
        ProxyPacket::new(ProxyCommand::Ack, body.into_bytes())
            .write_to(stream)
            .await
            .unwrap();
    }

    /// Tell both ends they are joined and splice them together.
    async fn proxy_ready(mut host: TcpStream, mut join: TcpStream) {
        for stream in [&mut host, &mut join] {
            ProxyPacket::new(ProxyCommand::Ready, Bytes::new())
                .write_to(stream)
                .await
                .unwrap();
        }
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut host, &mut join).await;
        });
    }

    struct ProxyRun {
        proxy: TcpListener,
        alice: Side,
        bob: Side,
        alice_id: NegotiationId,
        bob_id: NegotiationId,
        alice_trail: Vec<NegotiationState>,
        bob_trail: Vec<NegotiationState>,
        /// Bob's stage 2 proposal as Alice received it.
        stage_two: RendezvousMessage,
        host: TcpStream,
        join: TcpStream,
    }

    /// Alice proposes a file transfer from an address Bob cannot reach, so
    /// Bob falls back to hosting a stream on the proxy and Alice joins it.
    /// Returns with both of them waiting for the proxy's answer.
    async fn through_stage_two() -> ProxyRun {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut alice = side("alice", &[FT], proxy_config(&proxy));
        let mut bob = side("bob", &[FT], proxy_config(&proxy));
        let mut alice_trail = Vec::new();
        let mut bob_trail = Vec::new();

        let alice_id = alice
            .engine
            .invite("bob", FT, InviteOptions::default())
            .await
            .unwrap();
        alice_trail.push(alice.engine.state(alice_id).unwrap());
        let (_, mut propose) = sent(&mut alice).await;
        assert_eq!(propose.stage, 1);
        propose.port = Some(closed_port().await);

        bob.engine.handle_incoming(from("alice", propose));
        let (bob_id, _) = bob.events.recv().await.unwrap();
        bob_trail.push(bob.engine.state(bob_id).unwrap());
        bob.engine.accept(bob_id).unwrap();
        bob_trail.push(bob.engine.state(bob_id).unwrap());

        let (mut host, _) = proxy.accept().await.unwrap();
        let (name, _, cookie) = proxy_request(&mut host, ProxyCommand::InitSend).await;
        assert_eq!(name, "bob");
        assert_eq!(cookie, bob_id.cookie);
        bob_trail.push(bob.engine.state(bob_id).unwrap());
        assert_eq!(bob_trail.last(), Some(&NegotiationState::Stage2Proxy));
        proxy_ack(&mut host, 4242).await;

        let (peer, stage_two) = sent(&mut bob).await;
        assert_eq!(peer, "alice");
        assert_eq!(stage_two.kind, RendezvousKind::Propose);
        assert_eq!(stage_two.stage, 2);
        assert!(stage_two.use_proxy);
        assert_eq!(stage_two.proxy_ip, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(stage_two.port, Some(4242));

        alice.engine.handle_incoming(from("bob", stage_two.clone()));
        let (mut join, _) = proxy.accept().await.unwrap();
        let (name, port, cookie) = proxy_request(&mut join, ProxyCommand::InitReceive).await;
        assert_eq!(name, "alice");
        assert_eq!(port, Some(4242));
        assert_eq!(cookie, alice_id.cookie);
        alice_trail.push(alice.engine.state(alice_id).unwrap());
        assert_eq!(alice_trail.last(), Some(&NegotiationState::Stage2Proxy));

        ProxyRun {
            proxy,
            alice,
            bob,
            alice_id,
            bob_id,
            alice_trail,
            bob_trail,
            stage_two,
            host,
            join,
        }
    }

    #[tokio::test]
    async fn direct_failure_falls_back_to_proxy_stage_two() {
        let ProxyRun {
            mut alice,
            mut bob,
            alice_id,
            bob_id,
            mut alice_trail,
            mut bob_trail,
            host,
            join,
            ..
        } = through_stage_two().await;
        proxy_ready(host, join).await;

        let (_, accept) = sent(&mut alice).await;
        assert_eq!(accept.kind, RendezvousKind::Accept);
        let mut alice_stream = connected(&mut alice).await;
        bob.engine.handle_incoming(from("alice", accept));
        let mut bob_stream = connected(&mut bob).await;

        alice_stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        bob_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        alice_trail.push(alice.engine.state(alice_id).unwrap());
        bob_trail.push(bob.engine.state(bob_id).unwrap());
        assert_eq!(alice_trail.last(), Some(&NegotiationState::Connected));
        assert_eq!(bob_trail.last(), Some(&NegotiationState::Connected));
        assert_forward(&alice_trail);
        assert_forward(&bob_trail);

        alice.engine.complete(alice_id).unwrap();
        bob.engine.complete(bob_id).unwrap();
        assert!(alice.engine.state(alice_id).is_none());
        assert_eq!(bob.engine.live_negotiations(), 0);
    }

    #[tokio::test]
    async fn refused_join_moves_to_proxy_stage_three() {
        let ProxyRun {
            proxy,
            mut alice,
            mut bob,
            alice_id,
            bob_id,
            mut alice_trail,
            mut bob_trail,
            stage_two,
            host: _stage_two_host,
            mut join,
        } = through_stage_two().await;
        ProxyPacket::new(ProxyCommand::Error, Bytes::from_static(&[0x00, 0x0d]))
            .write_to(&mut join)
            .await
            .unwrap();

        let (mut host, _) = proxy.accept().await.unwrap();
        let (name, _, cookie) = proxy_request(&mut host, ProxyCommand::InitSend).await;
        assert_eq!(name, "alice");
        assert_eq!(cookie, alice_id.cookie);
        alice_trail.push(alice.engine.state(alice_id).unwrap());
        assert_eq!(alice_trail.last(), Some(&NegotiationState::Stage3Proxy));
        proxy_ack(&mut host, 4343).await;

        let (peer, stage_three) = sent(&mut alice).await;
        assert_eq!(peer, "bob");
        assert_eq!(stage_three.stage, 3);
        assert!(stage_three.use_proxy);
        assert_eq!(stage_three.proxy_ip, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(stage_three.port, Some(4343));

        // A late stage 2 proposal cannot pull Alice back.
        alice.engine.handle_incoming(from("bob", stage_two));
        assert_eq!(alice.engine.state(alice_id), Some(NegotiationState::Stage3Proxy));
        let endpoints = alice.engine.tables().local[&alice_id.cookie].negotiation.endpoints.clone();
        assert_eq!(endpoints.port, Some(4343));

        bob.engine.handle_incoming(from("alice", stage_three));
        let (mut join, _) = proxy.accept().await.unwrap();
        let (name, port, _) = proxy_request(&mut join, ProxyCommand::InitReceive).await;
        assert_eq!(name, "bob");
        assert_eq!(port, Some(4343));
        bob_trail.push(bob.engine.state(bob_id).unwrap());
        assert_eq!(bob_trail.last(), Some(&NegotiationState::Stage3Proxy));
        proxy_ready(host, join).await;

        let (_, accept) = sent(&mut bob).await;
        assert_eq!(accept.kind, RendezvousKind::Accept);
        let mut bob_stream = connected(&mut bob).await;
        alice.engine.handle_incoming(from("bob", accept));
        let mut alice_stream = connected(&mut alice).await;

        bob_stream.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        alice_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        alice_trail.push(alice.engine.state(alice_id).unwrap());
        bob_trail.push(bob.engine.state(bob_id).unwrap());
        assert_eq!(
            alice_trail,
            [
                NegotiationState::Stage1Direct,
                NegotiationState::Stage2Proxy,
                NegotiationState::Stage3Proxy,
                NegotiationState::Connected,
            ]
        );
        assert_forward(&bob_trail);

        alice.engine.complete(alice_id).unwrap();
        bob.engine.complete(bob_id).unwrap();
        assert_eq!(alice.engine.live_negotiations(), 0);
        assert_eq!(bob.engine.live_negotiations(), 0);
    }
}
