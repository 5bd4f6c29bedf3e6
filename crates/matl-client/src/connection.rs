//! Persistent connection to the interpreter service.
//!
//! `ConnectionManager` is a clonable handle. A background task owns the
//! transport, performs the Engine.IO / Socket.IO handshake, answers
//! heartbeats, reconnects with exponential backoff, and fans server events
//! out to subscribers:
//!
//! - `ConnectionManager` sends commands (connect, emit, ...) over a channel
//! - `Subscription` receives `ConnectionEvent`s in registration order
//! - `LinkState` (connected flag plus session id) is published on a watch
//!   channel
//!
//! The transport itself is produced by a [`Dialer`], so tests can stand in a
//! server made of channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::ClientConfig;
use crate::packet::{EnginePacket, SocketPacket, DEFAULT_NAMESPACE};
use crate::protocol::ServerEvent;

/// Path and query of the Engine.IO WebSocket endpoint.
pub const SOCKET_IO_PATH: &str = "socket.io/";
pub const SOCKET_IO_QUERY: &str = "EIO=4&transport=websocket";

/// How long a fresh transport may take to send the Engine.IO `open` packet.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Outgoing frame buffer per transport.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid server URL {0}: {1}")]
    InvalidUrl(String, String),

    #[error("Failed to encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Connection task is gone")]
    ChannelClosed,
}

/// A bidirectional channel of text frames.
///
/// Dropping `tx` closes the transport; `rx` yields `None` once the remote
/// side is gone.
pub struct TextChannel {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<String>,
}

/// Opens transports to the server.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<TextChannel, ConnectionError>;
}

/// Build the WebSocket handshake URL for a server base URL.
///
/// `http` maps to `ws` and `https` to `wss`; any path on the base URL is kept
/// as a prefix.
pub fn handshake_url(server: &Url) -> Result<Url, ConnectionError> {
    let scheme = match server.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectionError::InvalidUrl(
                server.to_string(),
                format!("unsupported scheme {:?}", other),
            ))
        }
    };

    let mut url = server.clone();
    url.set_scheme(scheme).map_err(|_| {
        ConnectionError::InvalidUrl(server.to_string(), "cannot change scheme".to_string())
    })?;
    let prefix = server.path().trim_end_matches('/');
    url.set_path(&format!("{}/{}", prefix, SOCKET_IO_PATH));
    url.set_query(Some(SOCKET_IO_QUERY));
    url.set_fragment(None);
    Ok(url)
}

/// Dials the server over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    url: Url,
}

impl WebSocketDialer {
    pub fn new(server: &Url) -> Result<Self, ConnectionError> {
        Ok(Self {
            url: handshake_url(server)?,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> Result<TextChannel, ConnectionError> {
        debug!("[connection] Dialing {}", self.url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut ws_sink, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(frame.into())).await {
                    debug!("[connection] WebSocket send failed: {}", e);
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text.as_str().to_owned()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("[connection] WebSocket read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(TextChannel {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

/// Backoff between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Give up after this many consecutive failures. Unlimited when unset.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.reconnect_delay_ms),
            max_delay: Duration::from_millis(config.reconnect_delay_max_ms),
            max_attempts: config.reconnect_attempts,
        }
    }

    /// Delay before retry number `attempt` (0-based): doubles every time,
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Snapshot of the link, published whenever it changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    pub connected: bool,
    /// Assigned by the server once per connection, cleared on disconnect.
    pub session_id: Option<String>,
}

/// What subscribers observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    SessionAssigned(String),
    Server(ServerEvent),
}

/// Commands sent from handles to the connection task.
enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Emit {
        event: String,
        payload: Value,
        ack: Option<oneshot::Sender<Vec<Value>>>,
    },
    Subscribe {
        id: u64,
        tx: mpsc::UnboundedSender<ConnectionEvent>,
    },
    Unsubscribe {
        id: u64,
    },
    Shutdown,
}

/// Handle for the connection task.
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<LinkState>,
    next_subscriber: Arc<AtomicU64>,
}

impl ConnectionManager {
    /// Spawn the connection task. Nothing is dialed until [`connect`](Self::connect).
    pub fn spawn(dialer: Arc<dyn Dialer>, policy: ReconnectPolicy) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::default());

        let task = ConnectionTask {
            dialer,
            policy,
            commands: rx,
            state_tx,
            subscribers: Vec::new(),
            wanted: false,
            failures: 0,
            dialing: None,
            retry_at: None,
            live: None,
            outbox: Vec::new(),
            pending_acks: HashMap::new(),
            next_ack_id: 0,
        };
        tokio::spawn(task.run());

        Self {
            tx,
            state: state_rx,
            next_subscriber: Arc::new(AtomicU64::new(0)),
        }
    }

    fn send(&self, command: Command) -> Result<(), ConnectionError> {
        self.tx
            .send(command)
            .map_err(|_| ConnectionError::ChannelClosed)
    }

    /// Start connecting. Does nothing if already connected or connecting.
    pub fn connect(&self) -> Result<(), ConnectionError> {
        self.send(Command::Connect)
    }

    /// Close the link and stop reconnecting. Buffered emits and pending
    /// acknowledgements are dropped.
    pub fn disconnect(&self) -> Result<(), ConnectionError> {
        self.send(Command::Disconnect)
    }

    /// Disconnect, then immediately connect again.
    pub fn reconnect(&self) -> Result<(), ConnectionError> {
        self.send(Command::Reconnect)
    }

    /// Disconnect and stop the task.
    pub fn shutdown(&self) -> Result<(), ConnectionError> {
        self.send(Command::Shutdown)
    }

    /// Emit an event. Buffered while the link is being established.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), ConnectionError> {
        self.send(Command::Emit {
            event: event.to_string(),
            payload,
            ack: None,
        })
    }

    /// Emit an event and request an acknowledgement.
    ///
    /// The receiver resolves with the acknowledgement arguments once the
    /// server confirms receipt, and errors if the link goes away first.
    pub fn emit_with_ack(
        &self,
        event: &str,
        payload: Value,
    ) -> Result<oneshot::Receiver<Vec<Value>>, ConnectionError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Emit {
            event: event.to_string(),
            payload,
            ack: Some(ack_tx),
        })?;
        Ok(ack_rx)
    }

    /// Register an observer. Events are delivered to observers in the order
    /// they subscribed.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        // If the task is gone the sender is dropped and `recv` yields None.
        let _ = self.tx.send(Command::Subscribe { id, tx: event_tx });
        Subscription {
            id,
            rx: event_rx,
            commands: self.tx.clone(),
            attached: true,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.borrow().session_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }
}

/// Receives connection events until unsubscribed or dropped.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    commands: mpsc::UnboundedSender<Command>,
    attached: bool,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }

    /// Stop receiving events.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if std::mem::take(&mut self.attached) {
            let _ = self.commands.send(Command::Unsubscribe { id: self.id });
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// An established transport.
struct Live {
    channel: TextChannel,
    /// Socket.IO namespace connect confirmed.
    joined: bool,
    /// Link is considered lost when nothing arrives by then.
    deadline: Instant,
    ping_window: Duration,
}

struct ConnectionTask {
    dialer: Arc<dyn Dialer>,
    policy: ReconnectPolicy,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<LinkState>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<ConnectionEvent>)>,
    /// Whether the user asked to be connected.
    wanted: bool,
    /// Consecutive failed attempts since the last successful connect.
    failures: u32,
    dialing: Option<BoxFuture<'static, Result<TextChannel, ConnectionError>>>,
    retry_at: Option<Instant>,
    live: Option<Live>,
    /// Encoded frames waiting for the link.
    outbox: Vec<String>,
    pending_acks: HashMap<u64, oneshot::Sender<Vec<Value>>>,
    next_ack_id: u64,
}

async fn wait_dial(
    dialing: &mut Option<BoxFuture<'static, Result<TextChannel, ConnectionError>>>,
) -> Result<TextChannel, ConnectionError> {
    match dialing {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_frame(live: &mut Option<Live>) -> Option<String> {
    match live {
        Some(live) => live.channel.rx.recv().await,
        None => std::future::pending().await,
    }
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            let deadline = self.live.as_ref().map(|live| live.deadline);

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }

                result = wait_dial(&mut self.dialing) => {
                    self.dialing = None;
                    match result {
                        Ok(channel) => {
                            debug!("[connection] Transport open, waiting for handshake");
                            self.live = Some(Live {
                                channel,
                                joined: false,
                                deadline: Instant::now() + HANDSHAKE_TIMEOUT,
                                ping_window: HANDSHAKE_TIMEOUT,
                            });
                        }
                        Err(e) => {
                            warn!("[connection] Connection attempt failed: {}", e);
                            self.schedule_retry();
                        }
                    }
                }

                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.start_dial();
                }

                frame = next_frame(&mut self.live) => {
                    match frame {
                        Some(frame) => self.handle_frame(&frame).await,
                        None => {
                            info!("[connection] Transport closed by server");
                            self.link_lost();
                        }
                    }
                }

                _ = wait_until(deadline) => {
                    warn!("[connection] No heartbeat from server, reconnecting");
                    self.link_lost();
                }
            }
        }

        self.close();
        info!("[connection] Task stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.wanted = true;
                if self.live.is_none() && self.dialing.is_none() {
                    self.retry_at = None;
                    self.start_dial();
                }
            }
            Command::Disconnect => {
                self.wanted = false;
                self.close();
            }
            Command::Reconnect => {
                self.close();
                self.wanted = true;
                self.failures = 0;
                self.start_dial();
            }
            Command::Emit {
                event,
                payload,
                ack,
            } => {
                let id = ack.map(|ack| {
                    let id = self.next_ack_id;
                    self.next_ack_id += 1;
                    self.pending_acks.insert(id, ack);
                    id
                });
                let frame = SocketPacket::event(&event, payload, id).to_frame();
                if self.live.as_ref().is_some_and(|live| live.joined) {
                    self.send_frame(frame).await;
                } else {
                    debug!("[connection] Buffering {} until connected", event);
                    self.outbox.push(frame);
                }
            }
            Command::Subscribe { id, tx } => self.subscribers.push((id, tx)),
            Command::Unsubscribe { id } => self.subscribers.retain(|(sid, _)| *sid != id),
            Command::Shutdown => {}
        }
    }

    async fn handle_frame(&mut self, frame: &str) {
        let packet = match EnginePacket::decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("[connection] Ignoring frame {:?}: {}", frame, e);
                return;
            }
        };

        match packet {
            EnginePacket::Open(info) => {
                debug!(
                    "[connection] Engine open sid={} ping={}ms/{}ms",
                    info.sid, info.ping_interval, info.ping_timeout
                );
                if let Some(live) = self.live.as_mut() {
                    live.ping_window = info.ping_deadline();
                    live.deadline = Instant::now() + live.ping_window;
                }
                self.send_frame(SocketPacket::connect().to_frame()).await;
            }
            EnginePacket::Ping(data) => {
                self.refresh_deadline();
                self.send_frame(EnginePacket::Pong(data).encode()).await;
            }
            EnginePacket::Close => {
                info!("[connection] Server closed the transport");
                self.link_lost();
            }
            EnginePacket::Message(payload) => match SocketPacket::decode(&payload) {
                Ok(packet) => self.handle_packet(packet).await,
                Err(e) => warn!("[connection] Ignoring packet {:?}: {}", payload, e),
            },
            EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => {}
        }
    }

    async fn handle_packet(&mut self, packet: SocketPacket) {
        if packet.namespace() != DEFAULT_NAMESPACE {
            debug!(
                "[connection] Ignoring packet for namespace {}",
                packet.namespace()
            );
            return;
        }

        match &packet {
            SocketPacket::Connect { .. } => {
                let Some(live) = self.live.as_mut() else {
                    return;
                };
                live.joined = true;
                self.failures = 0;
                info!("[connection] Connected");
                self.state_tx.send_modify(|state| {
                    state.connected = true;
                    state.session_id = None;
                });
                self.broadcast(ConnectionEvent::Connected);

                for frame in std::mem::take(&mut self.outbox) {
                    self.send_frame(frame).await;
                }
            }
            SocketPacket::Disconnect { .. } => {
                info!("[connection] Server disconnected the socket");
                self.link_lost();
            }
            SocketPacket::ConnectError { data, .. } => {
                warn!("[connection] Server refused the connection: {:?}", data);
                self.link_lost();
            }
            SocketPacket::Ack { id, data, .. } => match self.pending_acks.remove(id) {
                Some(ack) => {
                    let _ = ack.send(data.clone());
                }
                None => debug!("[connection] Acknowledgement {} has no waiter", id),
            },
            SocketPacket::Event { id, .. } => {
                if let Some(id) = *id {
                    let ack = SocketPacket::Ack {
                        namespace: DEFAULT_NAMESPACE.to_string(),
                        id,
                        data: Vec::new(),
                    };
                    self.send_frame(ack.to_frame()).await;
                }

                let Some((name, args)) = packet.as_event() else {
                    return;
                };
                match ServerEvent::from_event(name, args) {
                    Ok(ServerEvent::Connection { session_id }) => {
                        info!("[connection] Session id {}", session_id);
                        self.state_tx
                            .send_modify(|state| state.session_id = Some(session_id.clone()));
                        self.broadcast(ConnectionEvent::SessionAssigned(session_id));
                    }
                    Ok(event) => self.broadcast(ConnectionEvent::Server(event)),
                    Err(e) => warn!("[connection] Malformed {} event: {}", name, e),
                }
            }
        }
    }

    fn refresh_deadline(&mut self) {
        if let Some(live) = self.live.as_mut() {
            live.deadline = Instant::now() + live.ping_window;
        }
    }

    async fn send_frame(&mut self, frame: String) {
        let Some(live) = self.live.as_ref() else {
            return;
        };
        if live.channel.tx.send(frame).await.is_err() {
            info!("[connection] Transport closed while sending");
            self.link_lost();
        }
    }

    fn start_dial(&mut self) {
        let dialer = self.dialer.clone();
        self.dialing = Some(Box::pin(async move { dialer.dial().await }));
    }

    fn schedule_retry(&mut self) {
        if !self.wanted {
            return;
        }
        if let Some(max) = self.policy.max_attempts {
            if self.failures >= max {
                warn!(
                    "[connection] Giving up after {} reconnection attempts",
                    self.failures
                );
                self.wanted = false;
                return;
            }
        }
        let delay = self.policy.delay(self.failures);
        self.failures += 1;
        debug!(
            "[connection] Reconnecting in {:?} (attempt {})",
            delay, self.failures
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    /// Unexpected loss of the transport. Buffered emits are kept for the next
    /// link; acknowledgements can no longer arrive.
    fn link_lost(&mut self) {
        self.live = None;
        self.pending_acks.clear();
        self.mark_disconnected();
        self.schedule_retry();
    }

    /// Deliberate teardown: buffered emits and acknowledgements are dropped.
    fn close(&mut self) {
        self.dialing = None;
        self.retry_at = None;
        if let Some(live) = self.live.take() {
            if live.joined {
                let frame = EnginePacket::Message(
                    SocketPacket::Disconnect {
                        namespace: DEFAULT_NAMESPACE.to_string(),
                    }
                    .encode(),
                )
                .encode();
                let _ = live.channel.tx.try_send(frame);
            }
        }
        self.outbox.clear();
        self.pending_acks.clear();
        self.mark_disconnected();
    }

    fn mark_disconnected(&mut self) {
        let was_connected = self.state_tx.borrow().connected;
        self.state_tx.send_if_modified(|state| {
            let changed = state.connected || state.session_id.is_some();
            *state = LinkState::default();
            changed
        });
        if was_connected {
            info!("[connection] Disconnected");
            self.broadcast(ConnectionEvent::Disconnected);
        }
    }

    fn broadcast(&mut self, event: ConnectionEvent) {
        self.subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}
