//! Transport connection: one persistent full-duplex channel with reconnection.
//!
//! [`Connection`] owns a background task that dials through a [`Dialer`],
//! pumps frames in both directions, and reconnects with exponential backoff
//! when the channel drops. Only the owner calls [`Connection::open`] and
//! [`Connection::close`]; everyone else writes through a cloneable
//! [`ConnectionSender`] and observes the lifecycle through the event stream
//! returned by [`Connection::take_events`].
//!
//! # State machine
//!
//! ```text
//!   Disconnected ──open()──► Connecting ──dial ok──► Open
//!                                │                    │
//!                           dial failed      drop / error / stale
//!                                ▼                    ▼
//!                           Reconnecting ◄────────────┘
//!                            │   ▲   │
//!                 dial failed└───┘   └dial ok──► Open
//!
//!   any state ──close()──► Closed (no further retries)
//! ```
//!
//! # Invariants
//!
//! - At most one live channel: the old writer is closed before the next dial.
//! - `send` fails fast with [`SendError::NotConnected`] unless `Open`.
//! - Frames still queued when a channel drops are discarded, never replayed
//!   on the next channel.
//! - All frame writes go through one queue, so frames never interleave.

// Rust guideline compliant 2026-02

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::constants::{CONNECTION_STALE_TIMEOUT, HEALTH_CHECK_INTERVAL};
use crate::error::{ConnectionError, SendError};

/// Received transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Credentials presented when dialing. The session is assumed authenticated.
#[derive(Clone, Default)]
pub struct Credentials {
    /// Bearer token, if any.
    pub token: Option<String>,
}

impl Credentials {
    /// Credentials carrying a bearer token.
    #[must_use]
    pub fn bearer_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// `Authorization` header value, if a non-empty token is set.
    #[must_use]
    pub fn bearer(&self) -> Option<String> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| format!("Bearer {t}"))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Write half of a dialed channel.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;

    /// Send a binary frame.
    async fn send_binary(&mut self, data: Vec<u8>) -> anyhow::Result<()>;

    /// Answer a ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> anyhow::Result<()>;

    /// Close the channel. Completes once the close has been written.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Read half of a dialed channel.
#[async_trait]
pub trait FrameReader: Send {
    /// Next frame, or `None` once the stream has ended.
    ///
    /// Must be cancel-safe: it is polled inside `tokio::select!`.
    async fn recv(&mut self) -> Option<anyhow::Result<WsMessage>>;
}

/// Opens channels to the backend.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Dial `url` and return the split channel halves.
    async fn dial(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<(Box<dyn FrameWriter>, Box<dyn FrameReader>), ConnectionError>;
}

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never opened.
    #[default]
    Disconnected,
    /// First dial in progress.
    Connecting,
    /// Channel is live; sends are accepted.
    Open,
    /// Channel lost; waiting out the backoff or redialing.
    Reconnecting {
        /// Current reconnection attempt number (1-based).
        attempt: u32,
        /// Milliseconds until this attempt dials.
        next_retry_ms: u64,
    },
    /// Closed by the owner; no further retries.
    Closed,
}

impl ConnectionState {
    /// Whether sends are currently accepted.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Lifecycle and data notifications from the connection task, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The state machine moved.
    StateChanged(ConnectionState),
    /// A channel became live.
    Opened,
    /// Inbound frame payload.
    Message(Vec<u8>),
    /// The live channel ended.
    Closed {
        /// Why it ended.
        reason: String,
    },
    /// A dial or I/O failure. Always followed by a retry unless closed.
    Error {
        /// Failure detail.
        detail: String,
    },
}

/// Observable connection state shared between the task and its observers.
#[derive(Debug)]
pub struct SharedConnectionState {
    tx: watch::Sender<ConnectionState>,
}

impl SharedConnectionState {
    /// Create new shared state in `Disconnected`.
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self { tx })
    }

    /// Get the current state.
    pub fn get(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    /// Set the state. Returns `true` if it changed.
    pub fn set(&self, new_state: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == new_state {
                false
            } else {
                *current = new_state;
                true
            }
        })
    }

    /// Check if open.
    pub fn is_open(&self) -> bool {
        self.tx.borrow().is_open()
    }

    /// Watch for state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

/// Something that accepts encoded frames for delivery.
pub trait FrameSink: Send + Sync {
    /// Queue one frame. Fails fast when the channel is not open.
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), SendError>;
}

/// Cloneable handle for writing frames through a [`Connection`].
#[derive(Clone, Debug)]
pub struct ConnectionSender {
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<SharedConnectionState>,
}

impl ConnectionSender {
    /// Queue `frame` for the live channel.
    ///
    /// # Errors
    ///
    /// Returns `SendError::NotConnected` unless the connection is `Open`.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), SendError> {
        if !self.state.is_open() {
            return Err(SendError::NotConnected);
        }
        self.write_tx
            .send(frame)
            .map_err(|_| SendError::NotConnected)
    }
}

impl FrameSink for ConnectionSender {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), SendError> {
        self.send(frame)
    }
}

/// Tunables for the connection task.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Reconnection delay policy.
    pub backoff: Backoff,
    /// Inbound silence after which the channel is treated as dead.
    /// `None` disables the check.
    pub stale_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            stale_timeout: Some(CONNECTION_STALE_TIMEOUT),
        }
    }
}

/// The single persistent channel to the backend.
pub struct Connection {
    dialer: Arc<dyn Dialer>,
    settings: ConnectionSettings,
    state: Arc<SharedConnectionState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Held here while no task runs; the task owns it otherwise.
    write_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("settings", &self.settings)
            .field("state", &self.state.get())
            .field("running", &self.task.is_some())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection in `Disconnected`. Nothing is dialed until [`Self::open`].
    #[must_use]
    pub fn new(dialer: Arc<dyn Dialer>, settings: ConnectionSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Self {
            dialer,
            settings,
            state: SharedConnectionState::new(),
            events_tx,
            events_rx: Some(events_rx),
            write_tx,
            write_rx: Some(write_rx),
            cancel: None,
            task: None,
        }
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.take()
    }

    /// Cloneable write handle.
    #[must_use]
    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            write_tx: self.write_tx.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Shared state for external observation.
    #[must_use]
    pub fn shared_state(&self) -> Arc<SharedConnectionState> {
        Arc::clone(&self.state)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Start the connection task: `Disconnected`/`Closed → Connecting`.
    ///
    /// Returns immediately; dialing, retries and state changes are reported
    /// through the event stream.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::AlreadyOpen` if the task is already running.
    pub fn open(&mut self, url: &str, credentials: Credentials) -> Result<(), ConnectionError> {
        if self.task.is_some() {
            return Err(ConnectionError::AlreadyOpen);
        }
        let write_rx = self.write_rx.take().ok_or(ConnectionError::AlreadyOpen)?;

        let cancel = CancellationToken::new();
        let ctx = LoopContext {
            dialer: Arc::clone(&self.dialer),
            url: url.to_string(),
            credentials,
            settings: self.settings,
            state: Arc::clone(&self.state),
            events: self.events_tx.clone(),
            cancel: cancel.clone(),
        };

        ctx.transition(ConnectionState::Connecting);
        self.cancel = Some(cancel);
        self.task = Some(tokio::spawn(run_connection_loop(ctx, write_rx)));
        Ok(())
    }

    /// Stop retrying and close the live channel, if any: `* → Closed`.
    ///
    /// Completes only after the channel is closed and the task has exited.
    pub async fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }

        if let Some(task) = self.task.take() {
            match task.await {
                Ok(write_rx) => self.write_rx = Some(write_rx),
                Err(e) => {
                    log::error!("[Transport] Connection task failed: {}", e);
                    let (write_tx, write_rx) = mpsc::unbounded_channel();
                    self.write_tx = write_tx;
                    self.write_rx = Some(write_rx);
                }
            }
        }

        if self.state.set(ConnectionState::Closed) {
            let _ = self
                .events_tx
                .send(TransportEvent::StateChanged(ConnectionState::Closed));
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Everything the background task needs, moved into it on `open`.
struct LoopContext {
    dialer: Arc<dyn Dialer>,
    url: String,
    credentials: Credentials,
    settings: ConnectionSettings,
    state: Arc<SharedConnectionState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
}

impl LoopContext {
    fn transition(&self, next: ConnectionState) {
        if self.state.set(next.clone()) {
            log::info!("[Transport] State -> {:?}", next);
            self.emit(TransportEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: TransportEvent) {
        // Nobody listening is fine; the state is still observable.
        let _ = self.events.send(event);
    }
}

/// Result of the inner message loop.
enum LoopExit {
    /// Owner called `close`.
    Shutdown,
    /// Channel lost; reconnect.
    Disconnected(String),
}

/// Bump the attempt counter and move to `Reconnecting`. Returns the wait.
fn schedule_retry(ctx: &LoopContext, attempt: &mut u32) -> Duration {
    *attempt = attempt.saturating_add(1);
    let wait = ctx.settings.backoff.delay_for(*attempt);
    ctx.transition(ConnectionState::Reconnecting {
        attempt: *attempt,
        next_retry_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
    });
    log::info!(
        "[Transport] Reconnecting in {:.1}s (attempt {})",
        wait.as_secs_f32(),
        attempt
    );
    wait
}

/// Outer loop: dial, run, back off, repeat until cancelled.
async fn run_connection_loop(
    ctx: LoopContext,
    mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let mut attempt: u32 = 0;

    loop {
        let dialed = tokio::select! {
            result = ctx.dialer.dial(&ctx.url, &ctx.credentials) => result,
            () = ctx.cancel.cancelled() => break,
        };

        let wait = match dialed {
            Ok((mut writer, mut reader)) => {
                log::info!("[Transport] Connected to {}", ctx.url);
                attempt = 0;
                ctx.transition(ConnectionState::Open);
                ctx.emit(TransportEvent::Opened);

                let exit =
                    run_message_loop(&ctx, writer.as_mut(), reader.as_mut(), &mut write_rx).await;

                // Leave Open before draining, so no send can slip into the
                // queue and reach the next channel.
                let retry = match exit {
                    LoopExit::Shutdown => {
                        ctx.transition(ConnectionState::Closed);
                        None
                    }
                    LoopExit::Disconnected(reason) => {
                        Some((reason, schedule_retry(&ctx, &mut attempt)))
                    }
                };

                // Old channel fully closed before any redial.
                if let Err(e) = writer.close().await {
                    log::debug!("[Transport] Close after disconnect failed: {:#}", e);
                }
                drop(reader);

                let mut discarded = 0usize;
                while write_rx.try_recv().is_ok() {
                    discarded += 1;
                }
                if discarded > 0 {
                    log::debug!("[Transport] Discarded {} queued frame(s)", discarded);
                }

                let Some((reason, wait)) = retry else {
                    break;
                };
                log::warn!("[Transport] Disconnected: {}", reason);
                ctx.emit(TransportEvent::Closed { reason });
                wait
            }
            Err(e) => {
                log::warn!("[Transport] {}", e);
                ctx.emit(TransportEvent::Error {
                    detail: e.to_string(),
                });
                schedule_retry(&ctx, &mut attempt)
            }
        };

        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = ctx.cancel.cancelled() => break,
        }
    }

    ctx.transition(ConnectionState::Closed);
    ctx.emit(TransportEvent::Closed {
        reason: "closed by owner".to_string(),
    });
    write_rx
}

/// Pump one live channel until it drops or the owner cancels.
async fn run_message_loop(
    ctx: &LoopContext,
    writer: &mut dyn FrameWriter,
    reader: &mut dyn FrameReader,
    write_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> LoopExit {
    let check_every = ctx.settings.stale_timeout.map_or(HEALTH_CHECK_INTERVAL, |t| {
        (t / 2).clamp(Duration::from_millis(1), HEALTH_CHECK_INTERVAL)
    });
    let mut health = tokio::time::interval(check_every);
    health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => {
                log::info!("[Transport] Shutdown requested, closing channel");
                return LoopExit::Shutdown;
            }

            Some(frame) = write_rx.recv() => {
                let result = match String::from_utf8(frame) {
                    Ok(text) => writer.send_text(text).await,
                    Err(e) => writer.send_binary(e.into_bytes()).await,
                };
                if let Err(e) = result {
                    ctx.emit(TransportEvent::Error { detail: format!("{e:#}") });
                    return LoopExit::Disconnected(format!("write failed: {e:#}"));
                }
                log::trace!("[Transport] Frame written");
            }

            msg = reader.recv() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        ctx.emit(TransportEvent::Message(text.into_bytes()));
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        ctx.emit(TransportEvent::Message(data));
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = writer.send_pong(data).await {
                            return LoopExit::Disconnected(format!("pong failed: {e:#}"));
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close { code, reason })) => {
                        return LoopExit::Disconnected(format!("closed by server ({code}) {reason}"));
                    }
                    Some(Err(e)) => {
                        ctx.emit(TransportEvent::Error { detail: format!("{e:#}") });
                        return LoopExit::Disconnected(format!("read failed: {e:#}"));
                    }
                    None => return LoopExit::Disconnected("stream ended".to_string()),
                }
            }

            _ = health.tick() => {
                if let Some(stale) = ctx.settings.stale_timeout {
                    if last_activity.elapsed() > stale {
                        return LoopExit::Disconnected(format!(
                            "connection stale ({}ms without traffic)",
                            last_activity.elapsed().as_millis()
                        ));
                    }
                }
            }
        }
    }
}
