//! The interpreter client.
//!
//! A driver task owns the [`RunSession`] and the [`OutputReconciler`] and is
//! the only place their state changes. It waits on three sources at once:
//! user intents from [`ClientHandle`], events from the connection, and its
//! own timer and acknowledgement notifications. After each one it publishes
//! a fresh [`View`] for the presentation layer.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::analytics::Analytics;
use crate::config::{ClientConfig, ConfigError};
use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionManager, ReconnectPolicy, Subscription,
    WebSocketDialer,
};
use crate::output::{OutputBuffers, OutputReconciler};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::{Affordance, Effect, Input, RunRequest, RunSession};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Client has shut down")]
    Closed,
}

/// Everything needed to render the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct View {
    pub affordance: Affordance,
    pub connected: bool,
    pub session_id: Option<String>,
    pub output: OutputBuffers,
    /// Last user-facing notice (abandoned submission, failed job, ...).
    pub notice: Option<String>,
}

impl Default for View {
    fn default() -> Self {
        Self {
            affordance: Affordance::Run,
            connected: false,
            session_id: None,
            output: OutputBuffers::default(),
            notice: None,
        }
    }
}

impl View {
    pub fn is_idle(&self) -> bool {
        self.affordance == Affordance::Run
    }
}

enum Intent {
    Submit {
        request: RunRequest,
        reply: oneshot::Sender<bool>,
    },
    Kill,
    Cancel,
    Toggle(RunRequest),
    Shutdown,
}

/// Notifications the driver sends itself, tagged with the submission they
/// were started for.
enum Internal {
    Acknowledged { generation: u64, attempt: u32 },
    AckTimedOut { generation: u64, attempt: u32 },
}

/// Handle for the client driver.
#[derive(Clone)]
pub struct ClientHandle {
    tx: mpsc::UnboundedSender<Intent>,
    view: watch::Receiver<View>,
}

impl ClientHandle {
    /// Connect to the configured server over a WebSocket.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let dialer = WebSocketDialer::new(&config.server_url()?)?;
        info!("[client] Connecting to {}", dialer.url());
        let connection =
            ConnectionManager::spawn(Arc::new(dialer), ReconnectPolicy::from_config(config));
        Self::spawn(connection, config)
    }

    /// Start the driver over an existing connection manager and ask it to
    /// connect.
    pub fn spawn(connection: ConnectionManager, config: &ClientConfig) -> Result<Self, ClientError> {
        let subscription = connection.subscribe();
        connection.connect()?;

        let (tx, intents) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (view_tx, view_rx) = watch::channel(View::default());

        let driver = Driver {
            connection,
            session: RunSession::from_config(config),
            output: OutputReconciler::new(),
            analytics: Analytics::from_config(config.analytics_url.as_deref()),
            session_id: None,
            connected: false,
            notice: None,
            generation: 0,
            ack_timer: None,
            internal_tx,
            view_tx,
        };
        tokio::spawn(driver.run(intents, subscription, internal_rx));

        Ok(Self { tx, view: view_rx })
    }

    fn send(&self, intent: Intent) -> Result<(), ClientError> {
        self.tx.send(intent).map_err(|_| ClientError::Closed)
    }

    /// Submit a run. Returns whether it was accepted (the client was idle
    /// and the code non-empty).
    pub async fn submit(&self, request: RunRequest) -> Result<bool, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Intent::Submit {
            request,
            reply: reply_tx,
        })?;
        reply_rx.await.map_err(|_| ClientError::Closed)
    }

    /// Kill the running program.
    pub fn kill(&self) -> Result<(), ClientError> {
        self.send(Intent::Kill)
    }

    /// Kill the running program, or abandon a submission the server has
    /// not acknowledged yet.
    pub fn cancel(&self) -> Result<(), ClientError> {
        self.send(Intent::Cancel)
    }

    /// The Run/Kill button.
    pub fn toggle(&self, request: RunRequest) -> Result<(), ClientError> {
        self.send(Intent::Toggle(request))
    }

    pub fn shutdown(&self) -> Result<(), ClientError> {
        self.send(Intent::Shutdown)
    }

    pub fn view(&self) -> View {
        self.view.borrow().clone()
    }

    /// Receiver that sees every published view.
    pub fn watch(&self) -> watch::Receiver<View> {
        self.view.clone()
    }

    /// Wait until the server has assigned a session.
    pub async fn wait_for_session(&self) -> Result<View, ClientError> {
        let mut view = self.view.clone();
        let ready = view
            .wait_for(|v| v.session_id.is_some())
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(ready.clone())
    }

    /// Wait until no run is in flight.
    pub async fn wait_until_idle(&self) -> Result<View, ClientError> {
        let mut view = self.view.clone();
        let idle = view
            .wait_for(View::is_idle)
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(idle.clone())
    }

    /// Submit and wait for the run to finish. `None` when the submission
    /// was not accepted.
    pub async fn run(&self, request: RunRequest) -> Result<Option<View>, ClientError> {
        if !self.submit(request).await? {
            return Ok(None);
        }
        self.wait_until_idle().await.map(Some)
    }
}

struct Driver {
    connection: ConnectionManager,
    session: RunSession,
    output: OutputReconciler,
    analytics: Analytics,
    session_id: Option<String>,
    connected: bool,
    notice: Option<String>,
    /// Bumped for every accepted submission.
    generation: u64,
    ack_timer: Option<JoinHandle<()>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    view_tx: watch::Sender<View>,
}

impl Driver {
    async fn run(
        mut self,
        mut intents: mpsc::UnboundedReceiver<Intent>,
        mut subscription: Subscription,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(Intent::Shutdown) | None => break,
                    Some(intent) => self.on_intent(intent),
                },
                event = subscription.recv() => match event {
                    Some(event) => self.on_connection_event(event),
                    None => {
                        warn!("[client] Connection task stopped");
                        break;
                    }
                },
                Some(internal) = internal_rx.recv() => self.on_internal(internal),
            }
            self.publish();
        }

        self.cancel_ack_timer();
        let _ = self.connection.shutdown();
        info!("[client] Stopped");
    }

    fn on_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Submit { request, reply } => {
                let was_idle = self.session.state().is_idle();
                self.apply(Input::Submit(request));
                let accepted = was_idle && !self.session.state().is_idle();
                // The caller may wait on the view right after the reply.
                self.publish();
                let _ = reply.send(accepted);
            }
            Intent::Kill => self.apply(Input::KillRequested),
            Intent::Cancel => self.apply(Input::Cancel),
            Intent::Toggle(request) => self.apply(Input::Toggle(request)),
            Intent::Shutdown => {}
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.connected = true,
            ConnectionEvent::Disconnected => {
                self.connected = false;
                self.session_id = None;
            }
            ConnectionEvent::SessionAssigned(session_id) => {
                self.session_id = Some(session_id);
                self.apply(Input::SessionAssigned);
            }
            ConnectionEvent::Server(ServerEvent::Status(batch)) => {
                self.output.apply(&batch, self.session_id.as_deref());
            }
            ConnectionEvent::Server(ServerEvent::Complete(info)) => {
                self.apply(Input::Complete(info))
            }
            ConnectionEvent::Server(ServerEvent::Killed) => self.apply(Input::Killed),
            ConnectionEvent::Server(ServerEvent::Connection { session_id }) => {
                self.session_id = Some(session_id);
                self.apply(Input::SessionAssigned);
            }
            ConnectionEvent::Server(ServerEvent::Other { name }) => {
                debug!("[client] Ignoring server event {}", name);
            }
        }
    }

    fn on_internal(&mut self, internal: Internal) {
        let (generation, input) = match internal {
            Internal::Acknowledged {
                generation,
                attempt,
            } => (generation, Input::Acknowledged { attempt }),
            Internal::AckTimedOut {
                generation,
                attempt,
            } => (generation, Input::AckTimedOut { attempt }),
        };
        if generation != self.generation {
            debug!("[client] Dropping {:?} from an earlier submission", input);
            return;
        }
        self.apply(input);
    }

    fn apply(&mut self, input: Input) {
        let effects = self.session.handle(input, self.session_id.as_deref());
        for effect in effects {
            self.execute(effect);
        }
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::ClearOutput => {
                self.output.clear();
                self.notice = None;
                self.generation += 1;
            }
            Effect::SendSubmit { attempt, payload } => {
                match self.emit_with_ack(ClientEvent::Submit(payload)) {
                    Ok(ack) => {
                        let internal_tx = self.internal_tx.clone();
                        let generation = self.generation;
                        tokio::spawn(async move {
                            // An error means the link dropped; the ack timer
                            // takes care of that.
                            if ack.await.is_ok() {
                                let _ = internal_tx.send(Internal::Acknowledged {
                                    generation,
                                    attempt,
                                });
                            }
                        });
                    }
                    Err(e) => warn!("[client] Failed to send submission: {}", e),
                }
            }
            Effect::StartAckTimer { attempt, after } => {
                self.cancel_ack_timer();
                let internal_tx = self.internal_tx.clone();
                let generation = self.generation;
                self.ack_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = internal_tx.send(Internal::AckTimedOut {
                        generation,
                        attempt,
                    });
                }));
            }
            Effect::CancelAckTimer => self.cancel_ack_timer(),
            Effect::Reconnect => {
                self.session_id = None;
                if let Err(e) = self.connection.reconnect() {
                    warn!("[client] Failed to reconnect: {}", e);
                }
            }
            Effect::SendKill(payload) => {
                if let Err(e) = self.emit(ClientEvent::Kill(payload)) {
                    warn!("[client] Failed to send kill: {}", e);
                }
            }
            Effect::Analytics(event) => self.analytics.send_event(event),
            Effect::Notify(message) => {
                info!("[client] {}", message);
                self.notice = Some(message);
            }
        }
    }

    fn emit(&self, event: ClientEvent) -> Result<(), ConnectionError> {
        self.connection.emit(event.name(), event.to_value()?)
    }

    fn emit_with_ack(
        &self,
        event: ClientEvent,
    ) -> Result<oneshot::Receiver<Vec<serde_json::Value>>, ConnectionError> {
        self.connection.emit_with_ack(event.name(), event.to_value()?)
    }

    fn cancel_ack_timer(&mut self) {
        if let Some(timer) = self.ack_timer.take() {
            timer.abort();
        }
    }

    fn publish(&self) {
        let view = View {
            affordance: self.session.affordance(),
            connected: self.connected,
            session_id: self.session_id.clone(),
            output: self.output.buffers().clone(),
            notice: self.notice.clone(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}
