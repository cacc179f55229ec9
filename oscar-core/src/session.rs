//! Session driver: one task that owns every connection handle, the
//! dispatcher and the redirect bookkeeping.
//!
//! Callers talk to it through an [`Outbox`] (commands in) and receive
//! [`SessionEvent`]s (notifications out). Reader tasks feed it
//! [`Inbound`] messages, so all inbound processing for the session is
//! serialized on this one task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};

use crate::buffer::ByteWriter;
use crate::chat::ChatRooms;
use crate::config::OscarConfig;
use crate::dispatch::{Continuation, Dispatcher, RequestIdGenerator, SnacContext, SnacHandler};
use crate::error::OscarError;
use crate::message::{OserviceSubtype, family};
use crate::network::{CloseReason, Connection, ConnectionId, Connector, Handshake, Inbound};
use crate::packet::Snac;
use crate::rendezvous::{CookieGenerator, RendezvousEngine};
use crate::service::redirect::{self, Redirect};
use crate::service::{RateChangeCode, RateTable, ServiceKey, ServiceManager};

const INBOUND_QUEUE: usize = 256;

/// Client identification sent with client-online.
const TOOL_ID: u16 = 0x0110;
const TOOL_VERSION: u16 = 0x164F;

fn bos() -> ServiceKey {
    ServiceKey::Family(family::OSERVICE)
}

// ── Commands ─────────────────────────────────────────────────────

pub(crate) enum Command {
    Send {
        service: ServiceKey,
        snac: Snac,
        reply: Option<Continuation>,
    },
    Register {
        family: u16,
        subtype: u16,
        handler: Arc<dyn SnacHandler>,
    },
    OpenService {
        service: ServiceKey,
        done: oneshot::Sender<Result<(), OscarError>>,
    },
    CloseService {
        service: ServiceKey,
    },
    RedirectReady {
        service: ServiceKey,
        connection: ConnectionId,
        result: Result<Handshake, OscarError>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

// ── Outbox ───────────────────────────────────────────────────────

/// Cloneable handle for sending through the session.
#[derive(Clone)]
pub struct Outbox {
    commands: mpsc::UnboundedSender<Command>,
    ids: Arc<RequestIdGenerator>,
}

impl Outbox {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, ids: Arc<RequestIdGenerator>) -> Self {
        Self { commands, ids }
    }

    /// An outbox whose commands land in the returned receiver.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, Arc::new(RequestIdGenerator::new())), rx)
    }

    fn submit(&self, command: Command) -> Result<(), OscarError> {
        self.commands
            .send(command)
            .map_err(|_| OscarError::ChannelClosed)
    }

    pub fn next_request_id(&self) -> u32 {
        self.ids.next_id()
    }

    /// Fire-and-forget send. Returns the correlation id used.
    pub fn send(
        &self,
        service: ServiceKey,
        family: u16,
        subtype: u16,
        body: impl Into<Bytes>,
    ) -> Result<u32, OscarError> {
        let request_id = self.next_request_id();
        self.submit(Command::Send {
            service,
            snac: Snac::new(family, subtype, request_id, body),
            reply: None,
        })?;
        Ok(request_id)
    }

    /// Send and run `reply` on the first sub-message echoing the id.
    pub fn send_with(
        &self,
        service: ServiceKey,
        family: u16,
        subtype: u16,
        body: impl Into<Bytes>,
        reply: Continuation,
    ) -> Result<u32, OscarError> {
        let request_id = self.next_request_id();
        self.submit(Command::Send {
            service,
            snac: Snac::new(family, subtype, request_id, body),
            reply: Some(reply),
        })?;
        Ok(request_id)
    }

    /// Send and wait for the reply. An error sub-message becomes
    /// [`OscarError::ServerError`].
    pub async fn request(
        &self,
        service: ServiceKey,
        family: u16,
        subtype: u16,
        body: impl Into<Bytes>,
    ) -> Result<Snac, OscarError> {
        let label = service.to_string();
        let (tx, rx) = oneshot::channel();
        self.send_with(
            service,
            family,
            subtype,
            body,
            Box::new(move |_: &SnacContext, snac: &Snac| {
                let _ = tx.send(snac.clone());
            }),
        )?;
        let reply = rx
            .await
            .map_err(|_| OscarError::ServiceUnavailable(label))?;
        if reply.is_error() {
            return Err(OscarError::ServerError {
                family: reply.family(),
                code: reply.error_code().unwrap_or(0),
            });
        }
        Ok(reply)
    }

    pub fn register(
        &self,
        family: u16,
        subtype: u16,
        handler: Arc<dyn SnacHandler>,
    ) -> Result<(), OscarError> {
        self.submit(Command::Register {
            family,
            subtype,
            handler,
        })
    }

    /// Make sure `service` has a live connection, requesting a redirect
    /// if needed.
    pub async fn open_service(&self, service: ServiceKey) -> Result<(), OscarError> {
        let (done, rx) = oneshot::channel();
        self.submit(Command::OpenService { service, done })?;
        rx.await.map_err(|_| OscarError::ChannelClosed)?
    }

    pub fn close_service(&self, service: ServiceKey) -> Result<(), OscarError> {
        self.submit(Command::CloseService { service })
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Notifications for the session owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The server announced the families a connection serves.
    ServiceReady {
        service: ServiceKey,
        families: Vec<u16>,
    },
    ConnectionLost {
        service: ServiceKey,
        reason: CloseReason,
    },
    /// Clean sign-off by the server.
    LoggedOff {
        service: ServiceKey,
        code: u16,
        url: String,
    },
    FramingError {
        service: ServiceKey,
        error: String,
    },
    /// An error frame or error sub-message. `family` is `None` for the
    /// error channel.
    ProtocolError {
        service: ServiceKey,
        family: Option<u16>,
        code: u16,
    },
    /// A redirect failed; the listed requests were never sent.
    ServiceUnavailable {
        service: ServiceKey,
        undeliverable: Vec<u32>,
        reason: String,
    },
    RateWarning {
        service: ServiceKey,
        class: u16,
        code: RateChangeCode,
    },
}

// ── Driver ───────────────────────────────────────────────────────

struct Driver {
    dispatcher: Dispatcher,
    services: ServiceManager,
    connector: Arc<dyn Connector>,
    config: OscarConfig,
    ids: Arc<RequestIdGenerator>,
    commands: mpsc::UnboundedSender<Command>,
    inbound: mpsc::Sender<Inbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
    next_connection: ConnectionId,
    bos_ready: Option<oneshot::Sender<Vec<u16>>>,
    connecting: HashMap<ServiceKey, JoinHandle<()>>,
    chat: Arc<ChatRooms>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbound: mpsc::Receiver<Inbound>,
    ) {
        let mut sweep = interval(self.config.rendezvous.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.teardown().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.on_command(command).await,
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                Some(message) = inbound.recv() => self.on_inbound(message).await,
                _ = sweep.tick() => self.expire_redirects(Instant::now()),
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn next_connection_id(&mut self) -> ConnectionId {
        let id = self.next_connection;
        self.next_connection += 1;
        id
    }

    // ── Commands ─────────────────────────────────────────────────

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Send {
                service,
                snac,
                reply,
            } => {
                if let Some(reply) = reply {
                    self.dispatcher.expect_reply(snac.request_id(), reply);
                }
                self.route(service, snac).await;
            }
            Command::Register {
                family,
                subtype,
                handler,
            } => {
                self.dispatcher.register(family, subtype, handler);
            }
            Command::OpenService { service, done } => {
                if self.services.route(&service).is_some() {
                    let _ = done.send(Ok(()));
                    return;
                }
                if !self.services.is_pending(&service) {
                    if let Err(e) = self.start_redirect(&service).await {
                        let _ = done.send(Err(e));
                        return;
                    }
                }
                if let Some(pending) = self.services.pending_mut(&service) {
                    pending.add_waiter(done);
                }
            }
            Command::CloseService { service } => self.close_service(&service).await,
            Command::RedirectReady {
                service,
                connection,
                result,
            } => self.finish_connect(service, connection, result).await,
            Command::Shutdown { .. } => {}
        }
    }

    /// Send on the connection serving `service`, queue behind a pending
    /// redirect, or start one.
    async fn route(&mut self, service: ServiceKey, snac: Snac) {
        let request_id = snac.request_id();
        let sent = match self.services.route(&service) {
            Some(connection) => {
                self.dispatcher.mark_sent(request_id, connection.id());
                Some(connection.send(snac).await)
            }
            None => {
                if let Some(pending) = self.services.pending_mut(&service) {
                    pending.queue.push(snac);
                    return;
                }
                match self.start_redirect(&service).await {
                    Ok(()) => {
                        if let Some(pending) = self.services.pending_mut(&service) {
                            pending.queue.push(snac);
                        }
                        return;
                    }
                    Err(e) => Some(Err(e)),
                }
            }
        };
        if let Some(Err(e)) = sent {
            self.undeliverable(service, vec![request_id], e.to_string());
        }
    }

    async fn close_service(&mut self, service: &ServiceKey) {
        if let Some(mut pending) = self.services.finish_redirect(service) {
            if let Some(task) = self.connecting.remove(service) {
                task.abort();
            }
            let ids = pending.queue.drain().map(|s| s.request_id()).collect();
            pending.notify(Some("service closed"));
            self.undeliverable(service.clone(), ids, "service closed".into());
            return;
        }
        let Some(id) = self.services.route(service).map(Connection::id) else {
            return;
        };
        if let Some((mut connection, label)) = self.services.detach(id) {
            tracing::info!("closing {label}");
            self.dispatcher.forget_connection(id);
            connection.close().await;
        }
    }

    // ── Redirects ────────────────────────────────────────────────

    async fn start_redirect(&mut self, service: &ServiceKey) -> Result<(), OscarError> {
        let connection = self
            .services
            .route(&bos())
            .ok_or_else(|| OscarError::ServiceUnavailable("no BOS connection".into()))?;
        let request_id = self.ids.next_id();
        connection
            .send(Snac::new(
                family::OSERVICE,
                OserviceSubtype::ServiceRequest as u16,
                request_id,
                redirect::service_request(service),
            ))
            .await?;
        self.services
            .begin_redirect(service.clone(), request_id, Instant::now());
        tracing::info!("requested {service} (request {request_id})");
        Ok(())
    }

    fn follow_redirect(&mut self, service: ServiceKey, body: &[u8]) {
        let redirect = match Redirect::parse(body) {
            Ok(redirect) => redirect,
            Err(e) => {
                self.fail_redirect(&service, e.to_string());
                return;
            }
        };
        let id = self.next_connection_id();
        if let Some(pending) = self.services.pending_mut(&service) {
            pending.connecting = Some(id);
        }
        tracing::info!("{service} redirected to {}", redirect.address);

        let connector = Arc::clone(&self.connector);
        let config = self.config.connection.clone();
        let commands = self.commands.clone();
        let key = service.clone();
        let task = tokio::spawn(async move {
            let result =
                Handshake::connect(connector.as_ref(), &redirect.address, Some(&redirect.token), &config)
                    .await;
            let _ = commands.send(Command::RedirectReady {
                service: key,
                connection: id,
                result,
            });
        });
        self.connecting.insert(service, task);
    }

    /// The redirect target finished its handshake: attach it and flush
    /// everything queued for it, in order.
    async fn finish_connect(
        &mut self,
        service: ServiceKey,
        id: ConnectionId,
        result: Result<Handshake, OscarError>,
    ) {
        self.connecting.remove(&service);
        let Some(mut pending) = self.services.finish_redirect(&service) else {
            tracing::debug!("{service} connected after its redirect was abandoned");
            return;
        };
        let handshake = match result {
            Ok(handshake) => handshake,
            Err(e) => {
                let reason = format!("connect to redirect target failed: {e}");
                let ids = pending.queue.drain().map(|s| s.request_id()).collect();
                pending.notify(Some(&reason));
                self.undeliverable(service, ids, reason);
                return;
            }
        };

        let connection = handshake.start(
            id,
            self.inbound.clone(),
            &self.config.connection,
            self.config.rates.clone(),
        );
        self.services.attach(connection, service.clone());

        let mut failed = Vec::new();
        if let Some(connection) = self.services.route(&service) {
            tracing::debug!("flushing {} queued sub-messages to {service}", pending.queue.len());
            for snac in pending.queue.drain() {
                let request_id = snac.request_id();
                self.dispatcher.mark_sent(request_id, connection.id());
                if connection.send(snac).await.is_err() {
                    failed.push(request_id);
                }
            }
        }
        pending.notify(None);
        if !failed.is_empty() {
            self.undeliverable(service, failed, "connection closed while flushing".into());
        }
    }

    fn fail_redirect(&mut self, service: &ServiceKey, reason: String) {
        if let Some(task) = self.connecting.remove(service) {
            task.abort();
        }
        let Some(mut pending) = self.services.finish_redirect(service) else {
            return;
        };
        tracing::warn!("{service} unavailable: {reason}");
        let ids = pending.queue.drain().map(|s| s.request_id()).collect();
        pending.notify(Some(&reason));
        self.undeliverable(service.clone(), ids, reason);
    }

    fn expire_redirects(&mut self, now: Instant) {
        let limit = self.config.connection.redirect_timeout();
        for service in self.services.expired_redirects(now, limit) {
            self.fail_redirect(&service, format!("redirect not answered within {limit:?}"));
        }
    }

    /// Drop continuations for `ids` so their request futures fail, and
    /// tell the owner.
    fn undeliverable(&mut self, service: ServiceKey, ids: Vec<u32>, reason: String) {
        for id in &ids {
            self.dispatcher.forget_reply(*id);
        }
        self.emit(SessionEvent::ServiceUnavailable {
            service,
            undeliverable: ids,
            reason,
        });
    }

    // ── Inbound ──────────────────────────────────────────────────

    async fn on_inbound(&mut self, message: Inbound) {
        match message {
            Inbound::Snac { connection, snac } => self.on_snac(connection, snac).await,
            Inbound::Closed { connection, reason } => self.on_closed(connection, reason),
        }
    }

    async fn on_snac(&mut self, connection: ConnectionId, snac: Snac) {
        let Some(service) = self.services.label(connection).cloned() else {
            tracing::debug!("sub-message from detached connection {connection}");
            return;
        };
        let ctx = SnacContext {
            connection,
            service,
        };
        if self.dispatcher.is_awaiting(snac.request_id()) {
            self.dispatcher.dispatch(&ctx, &snac);
            return;
        }
        if snac.family() == family::OSERVICE && self.on_oservice(&ctx, &snac).await {
            return;
        }
        if let Some(code) = snac.error_code() {
            self.emit(SessionEvent::ProtocolError {
                service: ctx.service.clone(),
                family: Some(snac.family()),
                code,
            });
        }
        self.dispatcher.dispatch(&ctx, &snac);
    }

    /// Generic service handling. Returns `true` when the sub-message was
    /// consumed here.
    async fn on_oservice(&mut self, ctx: &SnacContext, snac: &Snac) -> bool {
        let Ok(subtype) = OserviceSubtype::try_from(snac.subtype()) else {
            return false;
        };
        match subtype {
            OserviceSubtype::HostOnline => {
                let mut r = snac.reader();
                let mut families = Vec::new();
                while r.remaining() >= 2 {
                    if let Ok(f) = r.read_u16() {
                        families.push(f);
                    }
                }
                self.services.add_families(ctx.connection, &families);
                self.send_on(
                    ctx.connection,
                    OserviceSubtype::RateParamsQuery,
                    Bytes::new(),
                )
                .await;
                tracing::info!("{} online with families {families:04x?}", ctx.service);
                if ctx.service == bos() {
                    if let Some(ready) = self.bos_ready.take() {
                        let _ = ready.send(families.clone());
                    }
                }
                self.emit(SessionEvent::ServiceReady {
                    service: ctx.service.clone(),
                    families,
                });
                true
            }
            OserviceSubtype::RateParamsReply => {
                self.on_rate_reply(ctx, snac).await;
                true
            }
            OserviceSubtype::RateParamChange => {
                let Some(connection) = self.services.connection(ctx.connection) else {
                    return true;
                };
                match connection.control().with_rates(|t| t.apply_change(&snac.body)) {
                    Ok((code, class)) if code.is_alarming() => {
                        tracing::warn!("{}: rate class {class} {code:?}", ctx.service);
                        self.emit(SessionEvent::RateWarning {
                            service: ctx.service.clone(),
                            class,
                            code,
                        });
                    }
                    Ok((code, class)) => tracing::debug!("{}: rate class {class} {code:?}", ctx.service),
                    Err(e) => tracing::warn!("bad rate change: {e}"),
                }
                true
            }
            OserviceSubtype::PauseRequest => {
                let mut ack = ByteWriter::new();
                for f in self.services.families(ctx.connection) {
                    ack.write_u16(*f);
                }
                if let Some(connection) = self.services.connection(ctx.connection) {
                    connection.control().pause();
                    let snac = Snac::new(
                        family::OSERVICE,
                        OserviceSubtype::PauseAck as u16,
                        self.ids.next_id(),
                        ack.into_bytes(),
                    );
                    if let Err(e) = connection.send_urgent(snac).await {
                        tracing::debug!("pause ack not sent: {e}");
                    }
                    tracing::info!("{} paused by server", ctx.service);
                }
                true
            }
            OserviceSubtype::Resume => {
                if let Some(connection) = self.services.connection(ctx.connection) {
                    connection.control().resume();
                    tracing::info!("{} resumed", ctx.service);
                }
                true
            }
            OserviceSubtype::ServiceResponse => {
                match self.services.redirect_for(snac.request_id()).cloned() {
                    Some(service) => {
                        self.follow_redirect(service, &snac.body);
                        true
                    }
                    None => false,
                }
            }
            OserviceSubtype::Error => {
                match self.services.redirect_for(snac.request_id()).cloned() {
                    Some(service) => {
                        let code = snac.error_code().unwrap_or(0);
                        self.fail_redirect(&service, format!("server refused service (code {code:#06x})"));
                        true
                    }
                    None => false,
                }
            }
            OserviceSubtype::Motd => true,
            _ => false,
        }
    }

    async fn on_rate_reply(&mut self, ctx: &SnacContext, snac: &Snac) {
        let table = match RateTable::from_reply(&snac.body) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!("{}: bad rate reply: {e}", ctx.service);
                return;
            }
        };
        let class_ids = table.class_ids();
        let Some(connection) = self.services.connection(ctx.connection) else {
            return;
        };
        connection.control().with_rates(|rates| *rates = table);

        let mut ack = ByteWriter::new();
        for id in &class_ids {
            ack.write_u16(*id);
        }
        self.send_on(ctx.connection, OserviceSubtype::RateParamsSubAdd, ack.into_bytes())
            .await;

        let mut online = ByteWriter::new();
        for f in self.services.families(ctx.connection) {
            let version = if *f == family::OSERVICE { 4 } else { 1 };
            online
                .write_u16(*f)
                .write_u16(version)
                .write_u16(TOOL_ID)
                .write_u16(TOOL_VERSION);
        }
        self.send_on(ctx.connection, OserviceSubtype::ClientOnline, online.into_bytes())
            .await;
        tracing::debug!("{}: {} rate classes acknowledged", ctx.service, class_ids.len());
    }

    async fn send_on(&self, connection: ConnectionId, subtype: OserviceSubtype, body: Bytes) {
        let Some(connection) = self.services.connection(connection) else {
            return;
        };
        let snac = Snac::new(family::OSERVICE, subtype as u16, self.ids.next_id(), body);
        if let Err(e) = connection.send(snac).await {
            tracing::debug!("{subtype:?} not sent on connection {}: {e}", connection.id());
        }
    }

    fn on_closed(&mut self, connection: ConnectionId, reason: CloseReason) {
        let Some((connection, service)) = self.services.detach(connection) else {
            return;
        };
        connection.abort();
        // Replies to requests written on this connection will never come.
        let stranded = self.dispatcher.forget_connection(connection.id());
        if !stranded.is_empty() {
            tracing::debug!("{service}: {} outstanding requests failed", stranded.len());
        }
        if service == bos() {
            self.bos_ready = None;
        }
        if let ServiceKey::ChatRoom(room) = &service {
            self.chat.connection_lost(room);
        }
        match reason {
            CloseReason::Local => {}
            CloseReason::LoggedOff { code, url } => {
                tracing::info!("{service} logged off (code {code})");
                self.emit(SessionEvent::LoggedOff { service, code, url });
            }
            CloseReason::PeerError { code } => {
                tracing::warn!("{service} error frame (code {code})");
                self.emit(SessionEvent::ProtocolError {
                    service: service.clone(),
                    family: None,
                    code,
                });
                self.emit(SessionEvent::ConnectionLost {
                    service,
                    reason: CloseReason::PeerError { code },
                });
            }
            CloseReason::Framing(error) => {
                tracing::warn!("{service} framing error: {error}");
                self.emit(SessionEvent::FramingError {
                    service: service.clone(),
                    error: error.clone(),
                });
                self.emit(SessionEvent::ConnectionLost {
                    service,
                    reason: CloseReason::Framing(error),
                });
            }
            reason => {
                tracing::warn!("{service} lost: {reason}");
                self.emit(SessionEvent::ConnectionLost { service, reason });
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    async fn teardown(&mut self) {
        for (_, task) in self.connecting.drain() {
            task.abort();
        }
        for (service, mut pending) in self.services.take_redirects() {
            let ids: Vec<u32> = pending.queue.drain().map(|s| s.request_id()).collect();
            pending.notify(Some("session closed"));
            if !ids.is_empty() {
                tracing::debug!("{service}: {} queued sub-messages dropped at shutdown", ids.len());
            }
        }
        let mut connections = self.services.take_connections();
        futures::future::join_all(connections.iter_mut().map(|c| c.close())).await;
        self.dispatcher.clear();
        tracing::info!("session closed");
    }
}

// ── Session ──────────────────────────────────────────────────────

/// A signed-on session.
pub struct Session {
    screen_name: String,
    outbox: Outbox,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    driver: Option<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
    rendezvous: Arc<RendezvousEngine>,
    chat: Arc<ChatRooms>,
}

impl Session {
    /// Open the BOS connection at `address`, present `token`, and wait for
    /// the server to announce its families.
    pub async fn connect(
        config: OscarConfig,
        connector: Arc<dyn Connector>,
        screen_name: &str,
        address: &str,
        token: Option<&[u8]>,
    ) -> Result<Self, OscarError> {
        let handshake =
            Handshake::connect(connector.as_ref(), address, token, &config.connection).await?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ids = Arc::new(RequestIdGenerator::new());
        let outbox = Outbox::new(commands_tx.clone(), Arc::clone(&ids));
        let cookies = Arc::new(CookieGenerator::new());

        let rendezvous = RendezvousEngine::new(
            outbox.clone(),
            Arc::clone(&connector),
            config.rendezvous.clone(),
            screen_name,
            Arc::clone(&cookies),
        );
        let chat = ChatRooms::new(outbox.clone(), cookies);
        let mut dispatcher = Dispatcher::new();
        rendezvous.register(&mut dispatcher);
        chat.register(&mut dispatcher);

        let mut services = ServiceManager::new();
        let connection = handshake.start(0, inbound_tx.clone(), &config.connection, config.rates.clone());
        services.attach(connection, bos());

        let handshake_timeout = config.connection.handshake_timeout();
        let sweep_every = config.rendezvous.sweep_interval();
        let (ready_tx, ready_rx) = oneshot::channel();
        let driver = Driver {
            dispatcher,
            services,
            connector,
            config,
            ids,
            commands: commands_tx,
            inbound: inbound_tx,
            events: events_tx,
            next_connection: 1,
            bos_ready: Some(ready_tx),
            connecting: HashMap::new(),
            chat: Arc::clone(&chat),
        };
        let driver = tokio::spawn(driver.run(commands_rx, inbound_rx));

        let engine = Arc::clone(&rendezvous);
        let sweeper = tokio::spawn(async move {
            let mut ticks = interval(sweep_every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                engine.sweep(Instant::now());
            }
        });

        let session = Self {
            screen_name: screen_name.to_string(),
            outbox,
            events: events_rx,
            driver: Some(driver),
            sweeper,
            rendezvous,
            chat,
        };
        match timeout(handshake_timeout, ready_rx).await {
            Ok(Ok(families)) => {
                tracing::info!("{screen_name} signed on; BOS serves {} families", families.len());
                Ok(session)
            }
            Ok(Err(_)) => Err(OscarError::ConnectionClosed),
            Err(_) => Err(OscarError::Timeout(handshake_timeout)),
        }
    }

    pub fn screen_name(&self) -> &str {
        &self.screen_name
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn rendezvous(&self) -> &Arc<RendezvousEngine> {
        &self.rendezvous
    }

    pub fn chat(&self) -> &Arc<ChatRooms> {
        &self.chat
    }

    /// Next notification; `None` once the driver stopped.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Cancel every negotiation, close every connection and wait for the
    /// driver to stop.
    pub async fn shutdown(mut self) -> Result<(), OscarError> {
        self.rendezvous.shutdown();
        self.chat.shutdown();
        self.sweeper.abort();
        let (done, rx) = oneshot::channel();
        let sent = self.outbox.submit(Command::Shutdown { done });
        if sent.is_ok() {
            let _ = rx.await;
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                tracing::warn!("session driver ended abnormally: {e}");
            }
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.sweeper.abort();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}
