//! One physical connection: open handshake, then a reader, a writer and a
//! keepalive task.
//!
//! The reader owns the receive half and forwards sub-messages to the session
//! driver. The writer is the only path onto the wire, so frames never
//! interleave; it also applies server pauses and the rate throttle.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::codec::FrameCodec;
use crate::config::{ConnectionConfig, RateConfig};
use crate::error::OscarError;
use crate::message::Channel;
use crate::network::transport::{BoxedStream, Connector};
use crate::packet::{Frame, Snac};
use crate::service::queue::DelayedQueue;
use crate::service::rate::RateTable;
use crate::state::ConnectionPhase;
use crate::tlv::TlvBlock;

pub type ConnectionId = u64;

type FrameStream = Framed<BoxedStream, FrameCodec>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ── Events ───────────────────────────────────────────────────────

/// What a reader task reports to the session driver.
#[derive(Debug)]
pub enum Inbound {
    Snac {
        connection: ConnectionId,
        snac: Snac,
    },
    Closed {
        connection: ConnectionId,
        reason: CloseReason,
    },
}

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server signed us off with a close frame.
    LoggedOff { code: u16, url: String },
    /// The server sent an error-channel frame.
    PeerError { code: u16 },
    /// No traffic arrived for the dead-after period.
    Dead(Duration),
    /// The byte stream could not be decoded.
    Framing(String),
    /// The transport failed or reached end of stream.
    Io(String),
    /// Closed from this side.
    Local,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoggedOff { code, url } if url.is_empty() => write!(f, "logged off (code {code})"),
            Self::LoggedOff { code, url } => write!(f, "logged off (code {code}, see {url})"),
            Self::PeerError { code } => write!(f, "peer error frame (code {code})"),
            Self::Dead(after) => write!(f, "no traffic for {after:?}"),
            Self::Framing(e) => write!(f, "framing error: {e}"),
            Self::Io(e) => write!(f, "transport error: {e}"),
            Self::Local => write!(f, "closed locally"),
        }
    }
}

/// Close-frame TLVs.
const TLV_DISCONNECT_REASON: u16 = 0x0009;
const TLV_REASON_URL: u16 = 0x000B;

fn logged_off(body: &[u8]) -> CloseReason {
    let tlvs = TlvBlock::parse(body);
    CloseReason::LoggedOff {
        code: tlvs.read_u16(TLV_DISCONNECT_REASON),
        url: tlvs.read_ascii(TLV_REASON_URL),
    }
}

// ── Outbound ─────────────────────────────────────────────────────

#[derive(Debug)]
enum Outbound {
    /// Rate limited and held while paused.
    Snac(Snac),
    /// Written immediately, even while paused.
    Urgent(Snac),
    Keepalive,
    /// Write a close frame and stop.
    Close,
}

// ── SendControl ──────────────────────────────────────────────────

/// Pause flag and rate classes shared between the driver and the writer.
#[derive(Debug)]
pub struct SendControl {
    paused: watch::Sender<bool>,
    rates: Mutex<RateTable>,
    settings: RateConfig,
}

impl SendControl {
    pub fn new(settings: RateConfig) -> Self {
        Self {
            paused: watch::Sender::new(false),
            rates: Mutex::new(RateTable::new()),
            settings,
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    fn rates(&self) -> MutexGuard<'_, RateTable> {
        self.rates.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_rates<R>(&self, f: impl FnOnce(&mut RateTable) -> R) -> R {
        f(&mut self.rates())
    }

    /// How long `snac` must wait to keep its rate class clear of the alert
    /// level.
    pub fn delay_for(&self, snac: &Snac, now: Instant) -> Duration {
        if !self.settings.self_throttle {
            return Duration::ZERO;
        }
        self.rates()
            .delay_for(snac.family(), snac.subtype(), self.settings.alert_margin, now)
    }

    pub fn record(&self, snac: &Snac, now: Instant) {
        self.rates().record(snac.family(), snac.subtype(), now);
    }
}

// ── Handshake ────────────────────────────────────────────────────

/// A socket that has completed the channel-1 open exchange but has no
/// tasks yet.
pub struct Handshake {
    framed: FrameStream,
    phase: ConnectionPhase,
    address: String,
}

impl Handshake {
    /// Open `address` and present `token` as the first negotiation step.
    pub async fn connect(
        connector: &dyn Connector,
        address: &str,
        token: Option<&[u8]>,
        config: &ConnectionConfig,
    ) -> Result<Self, OscarError> {
        let mut phase = ConnectionPhase::default();
        phase.begin_connect()?;
        let stream = timeout(config.connect_timeout(), connector.connect(address))
            .await
            .map_err(|_| OscarError::Timeout(config.connect_timeout()))??;
        Self::negotiate(stream, phase, address, token, config).await
    }

    /// Run the open exchange on an already-connected stream.
    pub async fn negotiate(
        stream: BoxedStream,
        mut phase: ConnectionPhase,
        address: &str,
        token: Option<&[u8]>,
        config: &ConnectionConfig,
    ) -> Result<Self, OscarError> {
        if phase.is_disconnected() {
            phase.begin_connect()?;
        }
        phase.begin_negotiation()?;
        let mut framed = Framed::new(
            stream,
            FrameCodec::new().with_max_body(config.max_frame_body),
        );

        let exchange = async {
            loop {
                let frame = framed.next().await.ok_or(OscarError::ConnectionClosed)??;
                if !phase.permits(frame.channel) {
                    return Err(OscarError::ProtocolViolation(
                        "unexpected frame before open handshake",
                    ));
                }
                match frame.channel {
                    Channel::Negotiate => {
                        let version = crate::buffer::ByteReader::new(&frame.body).read_u32()?;
                        phase.server_version(version)?;
                        break;
                    }
                    Channel::Close => return Err(OscarError::ConnectionClosed),
                    _ => continue,
                }
            }
            framed.send(Frame::hello(token)).await
        };

        if let Err(e) = timeout(config.handshake_timeout(), exchange)
            .await
            .map_err(|_| OscarError::Timeout(config.handshake_timeout()))
            .and_then(|r| r)
        {
            tracing::debug!("open handshake with {address} failed: {e}");
            return Err(e);
        }
        phase.establish()?;
        tracing::info!("connection to {address} established");

        Ok(Self {
            framed,
            phase,
            address: address.to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Spawn the reader, writer and keepalive tasks.
    pub fn start(
        self,
        id: ConnectionId,
        inbound: mpsc::Sender<Inbound>,
        config: &ConnectionConfig,
        rates: RateConfig,
    ) -> Connection {
        let (sink, stream) = self.framed.split();
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));
        let control = Arc::new(SendControl::new(rates));
        let phase = Arc::new(Mutex::new(self.phase));

        let writer = tokio::spawn(write_loop(id, sink, rx, Arc::clone(&control)));
        let reader = tokio::spawn(read_loop(
            id,
            stream,
            inbound,
            config.dead_after(),
            Arc::clone(&phase),
        ));
        let keepalive = tokio::spawn(keepalive_loop(tx.clone(), config.keepalive_interval()));

        Connection {
            id,
            address: self.address,
            tx,
            control,
            phase,
            reader,
            writer,
            keepalive,
        }
    }
}

// ── Connection ───────────────────────────────────────────────────

/// Handle to a running connection. Dropping it aborts its tasks.
pub struct Connection {
    id: ConnectionId,
    address: String,
    tx: mpsc::Sender<Outbound>,
    control: Arc<SendControl>,
    phase: Arc<Mutex<ConnectionPhase>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    keepalive: JoinHandle<()>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn control(&self) -> &Arc<SendControl> {
        &self.control
    }

    pub fn phase(&self) -> ConnectionPhase {
        lock(&self.phase).clone()
    }

    /// Queue a sub-message behind any pause and rate delay.
    pub async fn send(&self, snac: Snac) -> Result<(), OscarError> {
        self.tx
            .send(Outbound::Snac(snac))
            .await
            .map_err(|_| OscarError::ConnectionClosed)
    }

    /// Write a sub-message ahead of paused traffic.
    pub async fn send_urgent(&self, snac: Snac) -> Result<(), OscarError> {
        self.tx
            .send(Outbound::Urgent(snac))
            .await
            .map_err(|_| OscarError::ConnectionClosed)
    }

    /// Send a close frame and stop every task.
    pub async fn close(&mut self) {
        self.keepalive.abort();
        self.reader.abort();
        let _ = lock(&self.phase).begin_close();
        if self.tx.send(Outbound::Close).await.is_ok()
            && timeout(CLOSE_GRACE, &mut self.writer).await.is_err()
        {
            tracing::debug!("connection {} writer did not finish in time", self.id);
        }
        self.writer.abort();
        let mut phase = lock(&self.phase);
        if phase.finish_close().is_err() {
            phase.closed(CloseReason::Local);
        }
        drop(phase);
        tracing::info!("connection {} to {} closed", self.id, self.address);
    }

    /// Stop every task without writing anything.
    pub fn abort(&self) {
        self.keepalive.abort();
        self.reader.abort();
        self.writer.abort();
        lock(&self.phase).closed(CloseReason::Local);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.keepalive.abort();
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

fn lock(phase: &Mutex<ConnectionPhase>) -> MutexGuard<'_, ConnectionPhase> {
    phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Tasks ────────────────────────────────────────────────────────

async fn read_loop(
    id: ConnectionId,
    mut stream: SplitStream<FrameStream>,
    inbound: mpsc::Sender<Inbound>,
    dead_after: Duration,
    phase: Arc<Mutex<ConnectionPhase>>,
) {
    let reason = loop {
        let frame = match timeout(dead_after, stream.next()).await {
            Err(_) => break CloseReason::Dead(dead_after),
            Ok(None) => break CloseReason::Io("end of stream".into()),
            Ok(Some(Err(OscarError::Connection(e)))) => break CloseReason::Io(e.to_string()),
            Ok(Some(Err(e))) => break CloseReason::Framing(e.to_string()),
            Ok(Some(Ok(frame))) => frame,
        };
        if !lock(&phase).permits(frame.channel) {
            tracing::debug!("connection {id}: ignoring {} frame", frame.channel);
            continue;
        }
        match frame.channel {
            Channel::Data => match Snac::parse(&frame.body) {
                Ok(snac) => {
                    if inbound
                        .send(Inbound::Snac {
                            connection: id,
                            snac,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => tracing::warn!("connection {id}: dropping unparsable sub-message: {e}"),
            },
            Channel::KeepAlive | Channel::Negotiate => {}
            Channel::Error => {
                let code = crate::buffer::ByteReader::new(&frame.body)
                    .read_u16()
                    .unwrap_or(0);
                break CloseReason::PeerError { code };
            }
            Channel::Close => break logged_off(&frame.body),
        }
    };

    tracing::info!("connection {id} closing: {reason}");
    lock(&phase).closed(reason.clone());
    let _ = inbound
        .send(Inbound::Closed {
            connection: id,
            reason,
        })
        .await;
}

async fn write_loop(
    id: ConnectionId,
    mut sink: SplitSink<FrameStream, Frame>,
    mut rx: mpsc::Receiver<Outbound>,
    control: Arc<SendControl>,
) {
    let mut paused = control.paused.subscribe();
    let mut held = DelayedQueue::new();

    let result: Result<(), OscarError> = async {
        loop {
            tokio::select! {
                biased;
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    if *paused.borrow_and_update() {
                        tracing::debug!("connection {id}: writes paused");
                        continue;
                    }
                    tracing::debug!("connection {id}: resumed, releasing {} held", held.len());
                    while let Some(snac) = held.pop() {
                        write_throttled(&mut sink, &control, snac).await?;
                    }
                }
                msg = rx.recv() => match msg {
                    None => return Ok(()),
                    Some(Outbound::Snac(snac)) => {
                        if *paused.borrow() {
                            held.push(snac);
                            continue;
                        }
                        while let Some(earlier) = held.pop() {
                            write_throttled(&mut sink, &control, earlier).await?;
                        }
                        write_throttled(&mut sink, &control, snac).await?;
                    }
                    Some(Outbound::Urgent(snac)) => sink.send(Frame::data(&snac)).await?,
                    Some(Outbound::Keepalive) => sink.send(Frame::keepalive()).await?,
                    Some(Outbound::Close) => {
                        if !held.is_empty() {
                            tracing::debug!("connection {id}: discarding {} held on close", held.len());
                        }
                        sink.send(Frame::close()).await?;
                        return sink.close().await;
                    }
                },
            }
        }
    }
    .await;

    if let Err(e) = result {
        tracing::warn!("connection {id}: write failed: {e}");
    }
}

async fn write_throttled(
    sink: &mut SplitSink<FrameStream, Frame>,
    control: &SendControl,
    snac: Snac,
) -> Result<(), OscarError> {
    let delay = control.delay_for(&snac, Instant::now());
    if !delay.is_zero() {
        tracing::debug!(
            family = snac.family(),
            subtype = snac.subtype(),
            "rate throttle: waiting {delay:?}"
        );
        tokio::time::sleep(delay).await;
    }
    control.record(&snac, Instant::now());
    sink.send(Frame::data(&snac)).await
}

async fn keepalive_loop(tx: mpsc::Sender<Outbound>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if tx.send(Outbound::Keepalive).await.is_err() {
            break;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
