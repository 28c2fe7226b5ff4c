//! One streaming connection and its lifecycle.
//!
//! A [`StreamSession`] walks a fixed state machine:
//!
//! ```text
//! Disconnected → Connecting → Authenticating → SubscriptionPending → Live → Disconnected
//! ```
//!
//! `Authenticating` is skipped when the protocol has no credentials. Every
//! wait is bounded: the connect, the auth reply, and the subscription acks
//! each have a budget and exhausting it is FATAL. Once live, a background
//! task reads frames, answers the protocol's heartbeats, and forwards parsed
//! [`StreamMessage`]s on the event channel. The session does not reconnect by
//! itself; a lost connection is reported as [`SessionEvent::Closed`] and the
//! owning market reloads.
//!
//! Exchange specifics (URL, auth frame, subscription frames, frame parsing)
//! live behind the [`StreamProtocol`] trait.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use ahash::AHashSet;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{ExResult, ExchangeError};
use crate::time_util::now_ms;
use crate::types::StreamMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

// ---------------------------------------------------------------------------
// Protocol seam
// ---------------------------------------------------------------------------

/// What one inbound text frame means to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    AuthOk,
    AuthFailed(String),
    /// Subscription acknowledgements, by topic.
    Subscribed(Vec<String>),
    /// A subscription was refused.
    SubscribeFailed(String),
    Pong,
    /// Frame the protocol requires us to send back (server-driven heartbeat).
    Reply(String),
    Data(Vec<StreamMessage>),
    /// Server-side error that invalidates the session.
    Error(String),
    Ignore,
}

/// Liveness policy of a protocol.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    /// Client-driven ping: period and payload. `None` when the server drives.
    pub ping: Option<(Duration, String)>,
    /// Maximum silence before the connection is declared dead.
    pub liveness: Duration,
}

/// Exchange-specific half of a streaming connection.
///
/// `handle` takes `&self`; protocols with per-connection state (local order
/// books, pending ack queues) keep it behind their own lock.
pub trait StreamProtocol: Send + Sync + 'static {
    /// Log label, e.g. `bybit-linear`.
    fn label(&self) -> String;

    fn url(&self) -> String;

    /// Auth frame; `None` runs the connection in public mode.
    fn auth_message(&self) -> Option<String>;

    /// Frames sent once after auth and before subscribing.
    fn setup_messages(&self) -> Vec<String> {
        Vec::new()
    }

    fn subscribe_messages(&self) -> Vec<String>;

    /// Topics that must be acknowledged before the session counts as live.
    fn required_topics(&self) -> Vec<String>;

    /// Per-symbol frames sent once the account state is loaded.
    fn symbol_subscribe_messages(&self) -> Vec<String> {
        Vec::new()
    }

    /// Topics acknowledging [`symbol_subscribe_messages`](StreamProtocol::symbol_subscribe_messages).
    fn symbol_topics(&self) -> Vec<String> {
        Vec::new()
    }

    fn heartbeat(&self) -> Heartbeat;

    /// Interpret one text frame.
    fn handle(&self, text: &str) -> Inbound;

    /// Drop per-connection state before a new connection is opened.
    fn reset(&self) {}
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    SubscriptionPending,
    Live,
}

/// Delivered to the market's single consumer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Messages(Vec<StreamMessage>),
    /// The connection was lost while live.
    Closed { label: String, error: ExchangeError },
}

/// Wait budgets.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub connect: Duration,
    pub auth: Duration,
    pub subscribe: Duration,
    /// Sleep granularity of every bounded wait.
    pub poll: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            auth: Duration::from_secs(5),
            subscribe: Duration::from_secs(3),
            poll: Duration::from_millis(100),
        }
    }
}

/// A streaming connection managed by a background tokio task.
pub struct StreamSession {
    protocol: Arc<dyn StreamProtocol>,
    timeouts: SessionTimeouts,
    state: Arc<Mutex<SessionState>>,
    /// Wall-clock ms of the last inbound frame.
    last_message: Arc<AtomicI64>,
    /// Topics acknowledged after the session went live.
    acked: Arc<Mutex<AHashSet<String>>>,
    outbound_tx: Option<mpsc::Sender<String>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl StreamSession {
    pub fn new(protocol: Arc<dyn StreamProtocol>) -> Self {
        Self::with_timeouts(protocol, SessionTimeouts::default())
    }

    pub fn with_timeouts(protocol: Arc<dyn StreamProtocol>, timeouts: SessionTimeouts) -> Self {
        Self {
            protocol,
            timeouts,
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            last_message: Arc::new(AtomicI64::new(0)),
            acked: Arc::new(Mutex::new(AHashSet::new())),
            outbound_tx: None,
            shutdown_tx: None,
            task: None,
        }
    }

    pub fn label(&self) -> String {
        self.protocol.label()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn last_message_ms(&self) -> i64 {
        self.last_message.load(Ordering::Relaxed)
    }

    /// Connect, authenticate and subscribe, then hand the socket to the
    /// reader task. Returns once the session is live or the handshake failed.
    pub async fn start(&mut self, events: mpsc::UnboundedSender<SessionEvent>) -> ExResult<()> {
        self.stop().await;
        let label = self.protocol.label();
        self.protocol.reset();
        self.acked.lock().clear();

        self.set_state(SessionState::Connecting);
        let url = self.protocol.url();
        info!("[{label}] connecting to {url}");
        let connect = tokio_tungstenite::connect_async(url.as_str());
        let stream = match tokio::time::timeout(self.timeouts.connect, connect).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(self.fail(ExchangeError::fatal(format!("[{label}] connect failed: {e}")))),
            Err(_) => {
                return Err(self.fail(ExchangeError::fatal(format!(
                    "[{label}] connect timed out after {:?}",
                    self.timeouts.connect
                ))));
            }
        };
        let (mut write, mut read) = stream.split();

        if let Err(e) = self.handshake(&mut write, &mut read, &events).await {
            let _ = write.close().await;
            return Err(self.fail(e));
        }

        self.set_state(SessionState::Live);
        info!("[{label}] live");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(64);
        let reader = Reader {
            protocol: Arc::clone(&self.protocol),
            state: Arc::clone(&self.state),
            last_message: Arc::clone(&self.last_message),
            acked: Arc::clone(&self.acked),
            events,
        };
        self.task = Some(tokio::spawn(reader.run(write, read, outbound_rx, shutdown_rx)));
        self.shutdown_tx = Some(shutdown_tx);
        self.outbound_tx = Some(outbound_tx);
        Ok(())
    }

    /// Send an extra frame on the live connection.
    pub async fn send(&self, msg: String) -> ExResult<()> {
        match &self.outbound_tx {
            Some(tx) => {
                tx.send(msg).await.map_err(|_| ExchangeError::fatal(format!("[{}] session closed", self.label())))
            }
            None => Err(ExchangeError::fatal(format!("[{}] session not started", self.label()))),
        }
    }

    /// Send the protocol's per-symbol subscriptions on the live connection
    /// and wait for their acks. Missing acks after the subscribe budget are
    /// FATAL.
    pub async fn subscribe_symbols(&self) -> ExResult<()> {
        let label = self.protocol.label();
        let topics = self.protocol.symbol_topics();
        for msg in self.protocol.symbol_subscribe_messages() {
            debug!("[{label}] subscribing: {msg}");
            self.send(msg).await?;
        }
        let deadline = Instant::now() + self.timeouts.subscribe;
        loop {
            let missing: Vec<String> = {
                let acked = self.acked.lock();
                topics.iter().filter(|t| !acked.contains(*t)).cloned().collect()
            };
            if missing.is_empty() {
                return Ok(());
            }
            if self.state() != SessionState::Live {
                return Err(ExchangeError::fatal(format!("[{label}] closed while subscribing")));
            }
            if Instant::now() >= deadline {
                warn!("[{label}] unacknowledged subscriptions: {missing:?}");
                return Err(ExchangeError::fatal(format!(
                    "[{label}] subscriptions not confirmed within {:?}",
                    self.timeouts.subscribe
                )));
            }
            tokio::time::sleep(self.timeouts.poll).await;
        }
    }

    /// Close the connection and wait for the reader task.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        self.outbound_tx = None;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.set_state(SessionState::Disconnected);
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }

    fn fail(&self, err: ExchangeError) -> ExchangeError {
        error!("{}", err.message);
        self.set_state(SessionState::Disconnected);
        err
    }

    async fn handshake(
        &self,
        write: &mut WsWrite,
        read: &mut WsRead,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> ExResult<()> {
        let label = self.protocol.label();

        if let Some(auth) = self.protocol.auth_message() {
            self.set_state(SessionState::Authenticating);
            send_text(write, auth, &label).await?;
            self.poll_until(write, read, events, self.timeouts.auth, "auth", |inbound| match inbound {
                Inbound::AuthOk => Ok(true),
                Inbound::AuthFailed(reason) => Err(ExchangeError::cancel(format!("[{label}] auth rejected: {reason}"))),
                _ => Ok(false),
            })
            .await?;
            debug!("[{label}] authenticated");
        }

        for msg in self.protocol.setup_messages() {
            send_text(write, msg, &label).await?;
        }

        self.set_state(SessionState::SubscriptionPending);
        let mut pending: AHashSet<String> = self.protocol.required_topics().into_iter().collect();
        for msg in self.protocol.subscribe_messages() {
            debug!("[{label}] subscribing: {msg}");
            send_text(write, msg, &label).await?;
        }
        if pending.is_empty() {
            return Ok(());
        }

        let result = self
            .poll_until(write, read, events, self.timeouts.subscribe, "subscriptions", |inbound| match inbound {
                Inbound::Subscribed(topics) => {
                    for t in topics {
                        pending.remove(t);
                    }
                    Ok(pending.is_empty())
                }
                Inbound::SubscribeFailed(reason) => {
                    Err(ExchangeError::fatal(format!("[{label}] subscription refused: {reason}")))
                }
                _ => Ok(false),
            })
            .await;
        if result.is_err() && !pending.is_empty() {
            let mut missing: Vec<&String> = pending.iter().collect();
            missing.sort();
            warn!("[{label}] unacknowledged subscriptions: {missing:?}");
        }
        result
    }

    /// Read frames in `poll`-sized slices until `done` says so or `budget`
    /// runs out. Data frames seen meanwhile are forwarded; replies are sent.
    async fn poll_until(
        &self,
        write: &mut WsWrite,
        read: &mut WsRead,
        events: &mpsc::UnboundedSender<SessionEvent>,
        budget: Duration,
        what: &str,
        mut done: impl FnMut(&Inbound) -> ExResult<bool>,
    ) -> ExResult<()> {
        let label = self.protocol.label();
        let deadline = Instant::now() + budget;
        loop {
            if Instant::now() >= deadline {
                return Err(ExchangeError::fatal(format!("[{label}] {what} not confirmed within {budget:?}")));
            }
            let frame = match tokio::time::timeout(self.timeouts.poll, read.next()).await {
                Err(_) => continue,
                Ok(frame) => frame,
            };
            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                    continue;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ExchangeError::fatal(format!("[{label}] closed during {what}")));
                }
                Some(Err(e)) => return Err(ExchangeError::fatal(format!("[{label}] read error during {what}: {e}"))),
                Some(Ok(_)) => continue,
            };
            self.last_message.store(now_ms(), Ordering::Relaxed);
            let inbound = self.protocol.handle(text.as_str());
            match &inbound {
                Inbound::Data(msgs) => {
                    let _ = events.send(SessionEvent::Messages(msgs.clone()));
                }
                Inbound::Reply(reply) => send_text(write, reply.clone(), &label).await?,
                Inbound::Error(reason) => return Err(ExchangeError::fatal(format!("[{label}] {reason}"))),
                _ => {}
            }
            if done(&inbound)? {
                return Ok(());
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

async fn send_text(write: &mut WsWrite, msg: String, label: &str) -> ExResult<()> {
    write
        .send(Message::Text(msg.into()))
        .await
        .map_err(|e| ExchangeError::fatal(format!("[{label}] send failed: {e}")))
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

struct Reader {
    protocol: Arc<dyn StreamProtocol>,
    state: Arc<Mutex<SessionState>>,
    last_message: Arc<AtomicI64>,
    acked: Arc<Mutex<AHashSet<String>>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Reader {
    async fn run(
        self,
        mut write: WsWrite,
        mut read: WsRead,
        mut outbound_rx: mpsc::Receiver<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let label = self.protocol.label();
        let heartbeat = self.protocol.heartbeat();
        let (ping_every, ping_payload) = match heartbeat.ping.clone() {
            Some((every, payload)) => (every, Some(payload)),
            None => (Duration::from_secs(3600), None),
        };
        let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
        let mut last_rx = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("[{label}] closing");
                    let _ = write.close().await;
                    *self.state.lock() = SessionState::Disconnected;
                    return;
                }

                _ = tokio::time::sleep_until(last_rx + heartbeat.liveness) => {
                    break format!("no heartbeat within {:?}", heartbeat.liveness);
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_rx = Instant::now();
                            self.last_message.store(now_ms(), Ordering::Relaxed);
                            match self.protocol.handle(text.as_str()) {
                                Inbound::Data(msgs) => {
                                    if self.events.send(SessionEvent::Messages(msgs)).is_err() {
                                        break "consumer dropped".to_string();
                                    }
                                }
                                Inbound::Reply(reply) => {
                                    if let Err(e) = write.send(Message::Text(reply.into())).await {
                                        break format!("reply send error: {e}");
                                    }
                                }
                                Inbound::Error(reason)
                                | Inbound::AuthFailed(reason)
                                | Inbound::SubscribeFailed(reason) => {
                                    break reason;
                                }
                                Inbound::Subscribed(topics) => {
                                    self.acked.lock().extend(topics);
                                }
                                Inbound::Pong | Inbound::AuthOk | Inbound::Ignore => {}
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_rx = Instant::now();
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_rx = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) => break "received close frame".to_string(),
                        Some(Err(e)) => break format!("read error: {e}"),
                        None => break "stream ended".to_string(),
                        Some(Ok(_)) => {}
                    }
                }

                Some(msg) = outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(msg.into())).await {
                        break format!("send error: {e}");
                    }
                }

                _ = ping.tick(), if ping_payload.is_some() => {
                    if let Some(payload) = &ping_payload {
                        if let Err(e) = write.send(Message::Text(payload.clone().into())).await {
                            break format!("ping send error: {e}");
                        }
                    }
                }
            }
        };

        warn!("[{label}] disconnected: {reason}");
        *self.state.lock() = SessionState::Disconnected;
        let error = ExchangeError::fatal(format!("[{label}] {reason}"));
        let _ = self.events.send(SessionEvent::Closed { label: label.clone(), error });
    }
}
