//! ACP connection: one agent process, one JSON-RPC channel.
//!
//! An [`AcpConnection`] is a cheap clonable handle. It starts lazily: no
//! process exists until [`AcpConnection::initialize`] (or any call that
//! needs one) runs the handshake.
//!
//! Per agent process three tasks run:
//!
//! - the **writer** ([`run_writer`]) drains the outbound channel into stdin;
//! - the **reader** ([`run_reader`]) decodes stdout into [`Message`]s;
//! - the **supervisor** dispatches inbound messages in arrival order and
//!   reacts to the process exiting.
//!
//! Responses are routed to the `oneshot` registered under their correlation
//! id, so replies may arrive in any order. `session/update` notifications are
//! forwarded to the most recently started outstanding prompt and to the
//! [`ConnectionEvent`] broadcast.
//!
//! Every process gets a generation number. An exit is only treated as a
//! fault when it belongs to the process currently attached; exits caused by
//! a handshake retry or an explicit [`AcpConnection::disconnect`] are
//! ignored.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::handshake::{
    backoff_delay, initialize_params, parse_initialize, setting_support, AgentInfo, SettingKind,
    SettingSupport,
};
use crate::acp::message::{Message, MessageId, RpcError};
use crate::acp::protocol::{
    NewSessionResponse, PromptResponse, SessionNotification, SessionUpdate, METHOD_CANCEL,
    METHOD_INITIALIZE, METHOD_PROMPT, METHOD_SESSION_NEW, METHOD_SESSION_UPDATE,
};
use crate::acp::reader::run_reader;
use crate::acp::spawner::{
    build_launch_spec, AgentProcess, BackendKind, ExitFuture, LaunchSpec, ProcessExit,
    ProcessSpawner,
};
use crate::acp::state::ConnectionState;
use crate::acp::writer::run_writer;
use crate::config::{BackendConfig, ConnectionSettings, GlobalConfig, SessionDefaults};
use crate::errors::METHOD_NOT_FOUND;
use crate::models::prompt::RequestId;
use crate::models::session::SessionStatus;
use crate::{AppError, Result};

/// Capacity of the per-process inbound and outbound message channels.
const CHANNEL_CAPACITY: usize = 64;

/// Capacity of the connection event broadcast.
const EVENT_CAPACITY: usize = 256;

/// How long the supervisor keeps dispatching buffered inbound messages after
/// the process has exited.
const EXIT_DRAIN: Duration = Duration::from_millis(250);

// ── Public types ─────────────────────────────────────────────────────────────

/// A `session/update` tagged with the prompt request it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedUpdate {
    /// Prompt request the update is attributed to; `None` when no prompt was
    /// outstanding.
    pub request_id: Option<RequestId>,
    /// Agent-side session id, when the agent sent one.
    pub session_id: Option<String>,
    /// Update payload.
    pub update: SessionUpdate,
}

/// Observer events published by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Streamed update from the agent.
    Update(TaggedUpdate),
    /// The agent process exited unexpectedly.
    Disconnected {
        /// Backend name.
        backend: String,
        /// Exit code, if any.
        code: Option<i32>,
        /// Error every pending request was failed with.
        reason: String,
    },
    /// Non-fatal problem, e.g. a mode the agent refused.
    Warning(String),
}

/// Most recent connection failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    /// Error text.
    pub message: String,
    /// When it was recorded.
    pub at: DateTime<Utc>,
}

impl LastError {
    fn new(error: &AppError) -> Self {
        Self {
            message: error.to_string(),
            at: Utc::now(),
        }
    }
}

/// Agent-side session created by `session/new`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    /// Opaque session id chosen by the agent.
    pub session_id: String,
    /// Mode currently in effect, as far as this client knows.
    pub current_mode: Option<String>,
    /// Model currently in effect, as far as this client knows.
    pub current_model: Option<String>,
}

/// Point-in-time view of a connection.
#[allow(clippy::struct_excessive_bools)] // Flags mirror the host-facing status contract.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Connection label (the logical session id when owned by a manager).
    pub label: String,
    /// Configured backend kind.
    pub backend: String,
    /// Whether an agent process is attached.
    pub running: bool,
    /// Whether the handshake has completed.
    pub initialized: bool,
    /// Whether a handshake is in progress.
    pub initializing: bool,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Agent-side session id, if one exists.
    pub agent_session_id: Option<String>,
    /// Requests awaiting a response.
    pub pending_requests: usize,
    /// Last recorded failure; cleared by the next successful handshake.
    pub last_error: Option<LastError>,
    /// Agent identity and capabilities from the last handshake.
    pub agent: Option<AgentInfo>,
    /// Whether any handshake has ever succeeded.
    pub connected_once: bool,
}

impl ConnectionStatus {
    /// Logical session status derived from this snapshot.
    #[must_use]
    pub fn session_status(&self) -> SessionStatus {
        SessionStatus::derive(self.last_error.is_some(), self.running, self.connected_once)
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// Handle to one agent connection. Clones share the same connection.
#[derive(Clone)]
pub struct AcpConnection {
    shared: Arc<Shared>,
}

struct Shared {
    label: String,
    backend: BackendConfig,
    defaults: SessionDefaults,
    settings: ConnectionSettings,
    spawner: Arc<dyn ProcessSpawner>,
    shutdown: CancellationToken,
    closed: CancellationToken,
    next_id: AtomicU64,
    inner: Mutex<Inner>,
    session_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    generation: u64,
    process: Option<ProcessHandle>,
    pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
    agent: Option<AgentInfo>,
    session: Option<AgentSession>,
    init_waiters: Vec<oneshot::Sender<Result<()>>>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    last_error: Option<LastError>,
    connected_once: bool,
    teardown: CancellationToken,
}

struct ProcessHandle {
    generation: u64,
    outbound: mpsc::Sender<Message>,
    kill: CancellationToken,
    supervisor: JoinHandle<()>,
}

struct Subscriber {
    id: u64,
    request_id: RequestId,
    tx: mpsc::UnboundedSender<TaggedUpdate>,
}

impl AcpConnection {
    /// Create an idle connection. No process is started.
    ///
    /// `label` identifies the connection in logs and status. Cancelling
    /// `shutdown` disables every retry and reconnect.
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        config: &GlobalConfig,
        spawner: Arc<dyn ProcessSpawner>,
        shutdown: CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                backend: config.backend.clone(),
                defaults: config.session.clone(),
                settings: config.connection.clone(),
                spawner,
                shutdown,
                closed: CancellationToken::new(),
                next_id: AtomicU64::new(1),
                inner: Mutex::new(Inner::default()),
                session_gate: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    /// Connection label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Run the handshake if it has not completed yet.
    ///
    /// Concurrent callers share a single in-flight handshake and all receive
    /// its outcome.
    ///
    /// # Errors
    ///
    /// - `AppError::Config` if the backend cannot be launched at all.
    /// - The last attempt's error once every retry is exhausted, or the first
    ///   non-retryable error.
    /// - `AppError::Shutdown` once the host is shutting down.
    /// - `AppError::NotConnected` if the connection is disconnected meanwhile
    ///   or has been closed.
    pub async fn initialize(&self) -> Result<()> {
        let rx = {
            let mut inner = self.shared.lock();
            if self.shared.closed.is_cancelled() {
                return Err(AppError::NotConnected("connection closed".into()));
            }
            if inner.state.is_ready() {
                return Ok(());
            }
            if inner.state == ConnectionState::Stopping {
                return Err(AppError::NotConnected("connection is stopping".into()));
            }
            if self.shared.shutdown.is_cancelled() {
                return Err(AppError::Shutdown("host is shutting down".into()));
            }

            let (tx, rx) = oneshot::channel();
            inner.init_waiters.push(tx);

            if inner.state == ConnectionState::Idle {
                inner.state.transition(ConnectionState::Starting)?;
                let teardown = inner.teardown.clone();
                tokio::spawn(run_handshake(Arc::clone(&self.shared), teardown));
            } else {
                debug!(
                    session_id = self.shared.label.as_str(),
                    "acp: joining in-flight handshake"
                );
            }
            rx
        };

        rx.await
            .map_err(|_| AppError::NotConnected("handshake abandoned".into()))?
    }

    /// Ensure an agent-side session exists and return its id.
    ///
    /// Runs the handshake first if needed. Concurrent callers are serialized
    /// so only one `session/new` is sent. Configured mode/model defaults are
    /// applied afterwards; problems applying them surface as
    /// [`ConnectionEvent::Warning`]s and never fail the call.
    ///
    /// # Errors
    ///
    /// Returns the handshake error, or the error of the `session/new` call.
    pub async fn create_session(&self) -> Result<String> {
        self.initialize().await?;

        let _gate = self.shared.session_gate.lock().await;
        if let Some(session_id) = self.agent_session_id() {
            return Ok(session_id);
        }

        let cwd = self.shared.backend.cwd.display().to_string();
        let result = self
            .shared
            .request(METHOD_SESSION_NEW, json!({ "cwd": cwd, "mcpServers": [] }))
            .await?;
        let response: NewSessionResponse = serde_json::from_value(result)
            .map_err(|e| AppError::Protocol(format!("unusable session/new result: {e}")))?;

        let session = AgentSession {
            session_id: response.session_id,
            current_mode: response.modes.map(|m| m.current_mode_id),
            current_model: response.models.map(|m| m.current_model_id),
        };
        info!(
            session_id = self.shared.label.as_str(),
            agent_session = session.session_id.as_str(),
            "acp: agent session created"
        );
        self.shared.lock().session = Some(session.clone());

        self.apply_setting(SettingKind::Mode, &session).await;
        self.apply_setting(SettingKind::Model, &session).await;

        Ok(session.session_id)
    }

    /// Send a prompt and wait for the agent to finish the turn.
    ///
    /// Creates the agent-side session first if needed. While this is the
    /// most recently started outstanding prompt, every `session/update` is
    /// sent to `updates` tagged with `request_id`; the subscription ends when
    /// this future completes or is dropped.
    ///
    /// # Errors
    ///
    /// Returns handshake or session-creation errors, `AppError::Rpc` if the
    /// agent rejects the prompt, or `AppError::Exited` if the process dies
    /// before replying.
    pub async fn prompt(
        &self,
        request_id: RequestId,
        text: &str,
        updates: mpsc::UnboundedSender<TaggedUpdate>,
    ) -> Result<PromptResponse> {
        let session_id = self.create_session().await?;

        let _subscription = self.shared.subscribe_updates(request_id.clone(), updates);
        let _streaming = self.shared.begin_streaming()?;

        debug!(
            session_id = self.shared.label.as_str(),
            request_id = request_id.as_str(),
            "acp: sending prompt"
        );
        let params = json!({
            "sessionId": session_id,
            "prompt": [{ "type": "text", "text": text }],
        });
        let result = self.shared.request(METHOD_PROMPT, params).await?;
        let response = PromptResponse::from_result(result);

        info!(
            session_id = self.shared.label.as_str(),
            request_id = request_id.as_str(),
            stop_reason = response.stop_reason.as_deref().unwrap_or("unknown"),
            "acp: prompt completed"
        );
        Ok(response)
    }

    /// Ask the agent to cancel the current turn.
    ///
    /// Fire-and-forget: returns `Ok(false)` when there is no agent session to
    /// cancel, `Ok(true)` once the notification is queued.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotConnected` or `AppError::Send` if the
    /// notification cannot be handed to the writer.
    pub async fn cancel(&self) -> Result<bool> {
        let Some(session_id) = self.agent_session_id() else {
            debug!(
                session_id = self.shared.label.as_str(),
                "acp: cancel ignored, no agent session"
            );
            return Ok(false);
        };
        self.shared
            .notify(METHOD_CANCEL, json!({ "sessionId": session_id }))
            .await?;
        info!(
            session_id = self.shared.label.as_str(),
            "acp: cancel notification sent"
        );
        Ok(true)
    }

    /// Tear down the agent process on purpose.
    ///
    /// Pending requests and waiting `initialize` callers fail with
    /// `AppError::NotConnected`; a running handshake or scheduled reconnect
    /// is abandoned. The resulting process exit triggers no reconnect,
    /// records no error, and emits no [`ConnectionEvent::Disconnected`].
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut inner = self.shared.lock();
            inner.teardown.cancel();
            inner.teardown = CancellationToken::new();

            let error = AppError::NotConnected("connection disconnected".into());
            for waiter in inner.init_waiters.drain(..) {
                let _ = waiter.send(Err(error.clone()));
            }

            if inner.state == ConnectionState::Idle && inner.process.is_none() {
                return;
            }
            if let Err(err) = inner.state.transition(ConnectionState::Stopping) {
                debug!(session_id = self.shared.label.as_str(), %err, "acp: disconnect already in progress");
                return;
            }

            inner.agent = None;
            inner.session = None;
            inner.discard_process(&error)
        };

        info!(
            session_id = self.shared.label.as_str(),
            "acp: disconnecting agent"
        );

        if let Some(supervisor) = supervisor {
            let grace = self.shared.settings.stop_grace();
            if tokio::time::timeout(grace, supervisor).await.is_err() {
                warn!(
                    session_id = self.shared.label.as_str(),
                    ?grace,
                    "acp: agent process not reaped within grace period"
                );
            }
        }

        let mut inner = self.shared.lock();
        if inner.state == ConnectionState::Stopping {
            inner.state = ConnectionState::Idle;
        }
    }

    /// Disconnect for good.
    ///
    /// Like [`AcpConnection::disconnect`], but every later attempt to use
    /// the connection, including a handshake started by another clone, fails
    /// with `AppError::NotConnected` and never launches a process.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        self.disconnect().await;
        debug!(session_id = self.shared.label.as_str(), "acp: connection closed");
    }

    /// Whether [`AcpConnection::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Send an arbitrary request, running the handshake first if needed.
    ///
    /// # Errors
    ///
    /// Returns handshake errors, transport errors, or `AppError::Rpc` when
    /// the agent answers with an error object.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.initialize().await?;
        self.shared.request(method, params).await
    }

    /// Send an arbitrary notification to the running agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotConnected` without a process, or `AppError::Send`
    /// if the writer is gone.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.shared.notify(method, params).await
    }

    /// Subscribe to connection events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Agent-side session id, if a session has been created.
    #[must_use]
    pub fn agent_session_id(&self) -> Option<String> {
        self.shared
            .lock()
            .session
            .as_ref()
            .map(|s| s.session_id.clone())
    }

    /// Snapshot for status reporting.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        let inner = self.shared.lock();
        ConnectionStatus {
            label: self.shared.label.clone(),
            backend: self.shared.backend.kind.clone(),
            running: inner.process.is_some(),
            initialized: inner.state.is_ready(),
            initializing: inner.state == ConnectionState::Starting,
            state: inner.state,
            agent_session_id: inner.session.as_ref().map(|s| s.session_id.clone()),
            pending_requests: inner.pending.len(),
            last_error: inner.last_error.clone(),
            agent: inner.agent.clone(),
            connected_once: inner.connected_once,
        }
    }

    async fn apply_setting(&self, kind: SettingKind, session: &AgentSession) {
        let (requested, current) = match kind {
            SettingKind::Mode => (self.shared.defaults.mode.as_deref(), &session.current_mode),
            SettingKind::Model => (self.shared.defaults.model.as_deref(), &session.current_model),
        };
        let Some(requested) = requested else {
            return;
        };
        if current.as_deref() == Some(requested) {
            debug!(
                session_id = self.shared.label.as_str(),
                setting = kind.as_str(),
                value = requested,
                "acp: setting already in effect"
            );
            return;
        }

        let capabilities = self
            .shared
            .lock()
            .agent
            .as_ref()
            .map_or(Value::Null, |a| a.capabilities.clone());
        if setting_support(&capabilities, kind) == SettingSupport::Unsupported {
            let err = AppError::Unsupported(format!(
                "agent does not support changing the {}; '{requested}' not applied",
                kind.as_str()
            ));
            self.shared.warning(err.to_string());
            return;
        }

        let timeout = self.shared.settings.setting_timeout();
        let call = self
            .shared
            .request(kind.method(), kind.params(&session.session_id, requested));
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(_)) => {
                info!(
                    session_id = self.shared.label.as_str(),
                    setting = kind.as_str(),
                    value = requested,
                    "acp: session setting applied"
                );
                let mut inner = self.shared.lock();
                if let Some(current) = inner.session.as_mut() {
                    match kind {
                        SettingKind::Mode => current.current_mode = Some(requested.to_owned()),
                        SettingKind::Model => current.current_model = Some(requested.to_owned()),
                    }
                }
            }
            Ok(Err(err)) if err.is_method_not_found() => {
                debug!(
                    session_id = self.shared.label.as_str(),
                    method = kind.method(),
                    "acp: agent does not implement setting method"
                );
                let err = AppError::Unsupported(format!(
                    "agent does not implement {}; {} '{requested}' not applied",
                    kind.method(),
                    kind.as_str()
                ));
                self.shared.warning(err.to_string());
            }
            Ok(Err(err)) => {
                self.shared.warning(format!(
                    "failed to set {} '{requested}': {err}",
                    kind.as_str()
                ));
            }
            Err(_) => {
                let err = AppError::Timeout(format!(
                    "{} not answered within {timeout:?}",
                    kind.method()
                ));
                self.shared.warning(format!(
                    "failed to set {} '{requested}': {err}",
                    kind.as_str()
                ));
            }
        }
    }
}

impl fmt::Debug for AcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcpConnection")
            .field("label", &self.shared.label)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self, method: &str) -> Result<mpsc::Sender<Message>> {
        self.lock()
            .process
            .as_ref()
            .map(|p| p.outbound.clone())
            .ok_or_else(|| AppError::NotConnected(format!("no agent process for {method}")))
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let outbound = {
            let mut inner = self.lock();
            let Some(process) = inner.process.as_ref() else {
                return Err(AppError::NotConnected(format!(
                    "no agent process for {method}"
                )));
            };
            let outbound = process.outbound.clone();
            inner.pending.insert(id, tx);
            outbound
        };
        let _pending = PendingGuard { shared: self, id };

        debug!(session_id = self.label.as_str(), id, method, "acp: request sent");
        outbound
            .send(Message::request(id, method, params))
            .await
            .map_err(|_| AppError::Send(format!("failed to send {method}: writer closed")))?;

        rx.await.map_err(|_| {
            AppError::NotConnected(format!("{method} abandoned: connection torn down"))
        })?
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let outbound = self.outbound(method)?;
        outbound
            .send(Message::notification(method, params))
            .await
            .map_err(|_| AppError::Send(format!("failed to send {method}: writer closed")))
    }

    fn warning(&self, message: String) {
        warn!(session_id = self.label.as_str(), message = message.as_str(), "acp: warning");
        let _ = self.events.send(ConnectionEvent::Warning(message));
    }

    fn subscribe_updates(
        &self,
        request_id: RequestId,
        tx: mpsc::UnboundedSender<TaggedUpdate>,
    ) -> SubscriptionGuard<'_> {
        let mut inner = self.lock();
        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        inner.subscribers.push(Subscriber { id, request_id, tx });
        SubscriptionGuard { shared: self, id }
    }

    fn begin_streaming(&self) -> Result<StreamingGuard<'_>> {
        let mut inner = self.lock();
        inner.state.begin_prompt()?;
        Ok(StreamingGuard {
            shared: self,
            generation: inner.generation,
        })
    }

    fn dispatch(&self, generation: u64, message: Message) {
        match message {
            Message::Response { id, outcome } => self.route_response(&id, outcome),
            Message::Notification { method, params } => self.route_notification(&method, params),
            Message::Request { id, method, .. } => self.reject_request(generation, id, &method),
        }
    }

    fn route_response(&self, id: &MessageId, outcome: std::result::Result<Value, RpcError>) {
        let Some(key) = id.as_u64() else {
            warn!(session_id = self.label.as_str(), %id, "acp: response with foreign id dropped");
            return;
        };
        let waiter = self.lock().pending.remove(&key);
        match waiter {
            Some(tx) => {
                // A closed receiver means the caller timed out or went away.
                let _ = tx.send(outcome.map_err(AppError::from));
            }
            None => debug!(
                session_id = self.label.as_str(),
                id = key,
                "acp: response for unknown or expired request dropped"
            ),
        }
    }

    fn route_notification(&self, method: &str, params: Option<Value>) {
        if method != METHOD_SESSION_UPDATE {
            debug!(session_id = self.label.as_str(), method, "acp: unhandled notification");
            return;
        }
        let notification = match SessionNotification::from_params(params) {
            Ok(n) => n,
            Err(err) => {
                warn!(session_id = self.label.as_str(), %err, "acp: session/update dropped");
                return;
            }
        };

        // Only the most recently started prompt owns the stream; subscribers
        // whose receiver is gone are dropped on the way down.
        let latest = {
            let mut inner = self.lock();
            let mut target = None;
            while let Some(sub) = inner.subscribers.last() {
                let tagged = TaggedUpdate {
                    request_id: Some(sub.request_id.clone()),
                    session_id: notification.session_id.clone(),
                    update: notification.update.clone(),
                };
                if sub.tx.send(tagged).is_ok() {
                    target = Some(sub.request_id.clone());
                    break;
                }
                inner.subscribers.pop();
            }
            target
        };

        let _ = self.events.send(ConnectionEvent::Update(TaggedUpdate {
            request_id: latest,
            session_id: notification.session_id,
            update: notification.update,
        }));
    }

    fn reject_request(&self, generation: u64, id: MessageId, method: &str) {
        warn!(session_id = self.label.as_str(), %id, method, "acp: rejecting request from agent");
        let outbound = self
            .lock()
            .process
            .as_ref()
            .filter(|p| p.generation == generation)
            .map(|p| p.outbound.clone());
        let Some(outbound) = outbound else {
            return;
        };
        let reply = Message::error_response(
            id,
            RpcError {
                code: METHOD_NOT_FOUND,
                message: format!("method not found: {method}"),
                data: None,
            },
        );
        if outbound.try_send(reply).is_err() {
            warn!(session_id = self.label.as_str(), method, "acp: could not queue rejection");
        }
    }

    fn handle_exit(
        self: &Arc<Self>,
        generation: u64,
        exit: &ProcessExit,
        backend: BackendKind,
        hint: Option<String>,
    ) {
        let mut inner = self.lock();
        if inner.process.as_ref().map(|p| p.generation) != Some(generation) {
            debug!(
                session_id = self.label.as_str(),
                generation,
                reason = exit.reason.as_str(),
                "acp: exit of retired agent process ignored"
            );
            return;
        }
        if let Some(handle) = inner.process.take() {
            handle.kill.cancel();
        }

        let error = AppError::Exited {
            backend: backend.to_string(),
            code: exit.code,
            hint,
        };
        let failed = inner.fail_pending(&error);

        if inner.state == ConnectionState::Starting {
            debug!(
                session_id = self.label.as_str(),
                reason = exit.reason.as_str(),
                "acp: agent exited during handshake"
            );
            return;
        }
        if !inner.state.is_ready() {
            return;
        }

        warn!(
            session_id = self.label.as_str(),
            code = ?exit.code,
            failed,
            reason = exit.reason.as_str(),
            "acp: agent process exited unexpectedly"
        );
        if let Err(err) = inner.state.transition(ConnectionState::Idle) {
            warn!(session_id = self.label.as_str(), %err, "acp: unexpected state on exit");
        }
        inner.agent = None;
        inner.session = None;
        inner.last_error = Some(LastError::new(&error));

        let _ = self.events.send(ConnectionEvent::Disconnected {
            backend: backend.to_string(),
            code: exit.code,
            reason: error.to_string(),
        });

        if self.shutdown.is_cancelled() {
            info!(session_id = self.label.as_str(), "acp: shutting down, not reconnecting");
        } else {
            schedule_reconnect(self, inner.teardown.clone());
        }
    }
}

impl Inner {
    fn fail_pending(&mut self, error: &AppError) -> usize {
        let count = self.pending.len();
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(error.clone()));
        }
        count
    }

    /// Detach and kill the current process, failing its pending requests.
    fn discard_process(&mut self, error: &AppError) -> Option<JoinHandle<()>> {
        let handle = self.process.take()?;
        handle.kill.cancel();
        self.fail_pending(error);
        Some(handle.supervisor)
    }
}

// ── Guards ───────────────────────────────────────────────────────────────────

struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock().pending.remove(&self.id);
    }
}

struct SubscriptionGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.shared
            .lock()
            .subscribers
            .retain(|sub| sub.id != self.id);
    }
}

struct StreamingGuard<'a> {
    shared: &'a Shared,
    generation: u64,
}

impl Drop for StreamingGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if inner.generation == self.generation {
            inner.state.end_prompt();
        }
    }
}

// ── Handshake task ───────────────────────────────────────────────────────────

async fn run_handshake(shared: Arc<Shared>, teardown: CancellationToken) {
    let outcome = handshake_attempts(&shared, &teardown).await;

    let mut inner = shared.lock();
    if teardown.is_cancelled() {
        // `disconnect` already answered the waiters and owns the state.
        debug!(session_id = shared.label.as_str(), "acp: handshake abandoned");
        return;
    }

    let outcome = outcome.and_then(|agent| {
        if inner.process.is_some() {
            Ok(agent)
        } else {
            Err(AppError::NotConnected(
                "agent exited right after initialize".into(),
            ))
        }
    });

    let result = match outcome {
        Ok(agent) => match inner.state.transition(ConnectionState::Ready) {
            Ok(()) => {
                info!(
                    session_id = shared.label.as_str(),
                    agent = agent
                        .implementation
                        .as_ref()
                        .map_or("unknown", |i| i.name.as_str()),
                    "acp: handshake complete"
                );
                inner.agent = Some(agent);
                inner.last_error = None;
                inner.connected_once = true;
                Ok(())
            }
            Err(err) => Err(err),
        },
        Err(err) => {
            warn!(session_id = shared.label.as_str(), %err, "acp: handshake failed");
            inner.discard_process(&AppError::NotConnected("handshake failed".into()));
            if let Err(state_err) = inner.state.transition(ConnectionState::Idle) {
                warn!(session_id = shared.label.as_str(), %state_err, "acp: unexpected state after handshake");
            }
            if !matches!(err, AppError::Shutdown(_)) {
                inner.last_error = Some(LastError::new(&err));
            }
            Err(err)
        }
    };

    for waiter in inner.init_waiters.drain(..) {
        let _ = waiter.send(result.clone());
    }
}

async fn handshake_attempts(shared: &Arc<Shared>, teardown: &CancellationToken) -> Result<AgentInfo> {
    let spec = build_launch_spec(&shared.backend)?;
    let max_attempts = shared.settings.max_retries.max(1);
    let mut attempt = 1;

    loop {
        if shared.shutdown.is_cancelled() {
            return Err(AppError::Shutdown("host is shutting down".into()));
        }
        if teardown.is_cancelled() || shared.closed.is_cancelled() {
            return Err(AppError::NotConnected("connection disconnected".into()));
        }

        debug!(
            session_id = shared.label.as_str(),
            attempt, max_attempts, "acp: handshake attempt"
        );
        match attempt_handshake(shared, &spec, teardown).await {
            Ok(agent) => return Ok(agent),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(shared.settings.retry_base_delay(), attempt);
                warn!(
                    session_id = shared.label.as_str(),
                    attempt,
                    max_attempts,
                    ?delay,
                    %err,
                    "acp: handshake attempt failed, retrying"
                );
                // The supervisor is detached here; its exit is ignored.
                let _ = shared
                    .lock()
                    .discard_process(&AppError::NotConnected("handshake retry".into()));

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = shared.shutdown.cancelled() => {
                        return Err(AppError::Shutdown("host is shutting down".into()));
                    }
                    () = teardown.cancelled() => {
                        return Err(AppError::NotConnected("connection disconnected".into()));
                    }
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn attempt_handshake(
    shared: &Arc<Shared>,
    spec: &LaunchSpec,
    teardown: &CancellationToken,
) -> Result<AgentInfo> {
    let running = shared.lock().process.is_some();
    if !running {
        start_process(shared, spec, teardown).await?;
    }

    tokio::select! {
        () = tokio::time::sleep(shared.settings.settle_delay()) => {}
        () = shared.shutdown.cancelled() => {
            return Err(AppError::Shutdown("host is shutting down".into()));
        }
        () = teardown.cancelled() => {
            return Err(AppError::NotConnected("connection disconnected".into()));
        }
    }

    let timeout = shared.settings.handshake_timeout();
    let result = tokio::time::timeout(timeout, shared.request(METHOD_INITIALIZE, initialize_params()))
        .await
        .map_err(|_| AppError::Timeout(format!("initialize not answered within {timeout:?}")))??;

    parse_initialize(result)
}

async fn start_process(
    shared: &Arc<Shared>,
    spec: &LaunchSpec,
    teardown: &CancellationToken,
) -> Result<()> {
    let AgentProcess {
        stdin,
        stdout,
        exit,
        kill,
    } = shared.spawner.spawn(spec, &shared.backend.cwd).await?;

    let mut inner = shared.lock();
    if teardown.is_cancelled()
        || shared.closed.is_cancelled()
        || inner.state != ConnectionState::Starting
    {
        kill.cancel();
        return Err(AppError::NotConnected(
            "connection torn down during launch".into(),
        ));
    }

    inner.generation += 1;
    let generation = inner.generation;

    let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(run_reader(
        shared.label.clone(),
        stdout,
        inbound_tx,
        kill.clone(),
    ));

    let writer_label = shared.label.clone();
    let writer_cancel = kill.clone();
    tokio::spawn(async move {
        if let Err(err) = run_writer(writer_label.clone(), stdin, outbound_rx, writer_cancel).await {
            debug!(session_id = writer_label.as_str(), %err, "acp: writer stopped");
        }
    });

    let supervisor = tokio::spawn(supervise(
        Arc::clone(shared),
        generation,
        inbound_rx,
        exit,
        spec.backend,
        spec.credential_hint(),
    ));

    inner.process = Some(ProcessHandle {
        generation,
        outbound: outbound_tx,
        kill,
        supervisor,
    });
    info!(
        session_id = shared.label.as_str(),
        generation,
        backend = %spec.backend,
        "acp: agent process attached"
    );
    Ok(())
}

// ── Supervisor ───────────────────────────────────────────────────────────────

async fn supervise(
    shared: Arc<Shared>,
    generation: u64,
    mut inbound: mpsc::Receiver<Message>,
    mut exit: ExitFuture,
    backend: BackendKind,
    hint: Option<String>,
) {
    let mut stream_open = true;
    let status = loop {
        tokio::select! {
            biased;

            message = inbound.recv(), if stream_open => match message {
                Some(message) => shared.dispatch(generation, message),
                None => stream_open = false,
            },

            status = &mut exit => break status,
        }
    };

    if stream_open {
        let drain = async {
            while let Some(message) = inbound.recv().await {
                shared.dispatch(generation, message);
            }
        };
        let _ = tokio::time::timeout(EXIT_DRAIN, drain).await;
    }

    shared.handle_exit(generation, &status, backend, hint);
}

fn schedule_reconnect(shared: &Arc<Shared>, teardown: CancellationToken) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let delay = shared.settings.retry_base_delay();
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shared.shutdown.cancelled() => return,
            () = teardown.cancelled() => return,
        }

        let connection = AcpConnection { shared };
        info!(session_id = connection.label(), "acp: reconnecting");
        if let Err(err) = connection.initialize().await {
            warn!(session_id = connection.label(), %err, "acp: reconnect failed");
        }
    });
}
