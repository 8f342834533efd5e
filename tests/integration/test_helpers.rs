//! Shared helpers for connection-level integration tests.
//!
//! [`FakeSpawner`] implements `ProcessSpawner` with in-memory duplex pipes
//! and a scripted agent task, so tests exercise the real reader, writer,
//! supervisor, and retry logic without launching processes.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use agent_relay::acp::connection::ConnectionEvent;
use agent_relay::acp::spawner::{AgentProcess, ExitFuture, LaunchSpec, ProcessExit, ProcessSpawner};
use agent_relay::config::{
    BackendConfig, CommandOverride, ConnectionSettings, GlobalConfig, SessionDefaults,
};
use agent_relay::{AppError, Result};

/// What the fake agent does in response to one inbound message.
#[derive(Debug, Clone)]
pub enum Action {
    /// Write a JSON document to the agent's stdout.
    Send(Value),
    /// Write raw text followed by a newline.
    Raw(String),
    /// Exit with the given code.
    Exit(Option<i32>),
}

/// Maps each inbound message to the agent's reaction.
pub type Script = Arc<dyn Fn(&Value) -> Vec<Action> + Send + Sync>;

/// Successful JSON-RPC response to `request`.
pub fn reply(request: &Value, result: Value) -> Action {
    Action::Send(json!({"jsonrpc": "2.0", "id": request["id"], "result": result}))
}

/// JSON-RPC error response to `request`.
pub fn reply_error(request: &Value, code: i64, message: &str) -> Action {
    Action::Send(json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "error": {"code": code, "message": message},
    }))
}

/// `session/update` notification carrying an agent message chunk.
pub fn chunk(session_id: &str, text: &str) -> Action {
    Action::Send(json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {
            "sessionId": session_id,
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": text},
            },
        },
    }))
}

/// Agent session id handed out by [`standard_reply`].
pub const AGENT_SESSION: &str = "agent-session-1";

/// Well-behaved agent: answers the ACP lifecycle methods, streams two chunks
/// per prompt, and ignores everything else.
pub fn standard_reply(message: &Value) -> Vec<Action> {
    match message["method"].as_str() {
        Some("initialize") => vec![reply(
            message,
            json!({
                "protocolVersion": 1,
                "agentInfo": {"name": "fake-agent", "version": "1.0.0"},
                "agentCapabilities": {},
            }),
        )],
        Some("session/new") => vec![reply(message, json!({"sessionId": AGENT_SESSION}))],
        Some("session/set_mode" | "session/set_model") => vec![reply(message, json!({}))],
        Some("session/prompt") => vec![
            chunk(AGENT_SESSION, "Hello"),
            chunk(AGENT_SESSION, " world"),
            reply(message, json!({"stopReason": "end_turn"})),
        ],
        _ => Vec::new(),
    }
}

/// Script answering with [`standard_reply`].
pub fn standard_script() -> Script {
    Arc::new(standard_reply)
}

/// Script that defers to `overrides` first and falls back to
/// [`standard_reply`] when it returns `None`.
pub fn script_with<F>(overrides: F) -> Script
where
    F: Fn(&Value) -> Option<Vec<Action>> + Send + Sync + 'static,
{
    Arc::new(move |message: &Value| {
        overrides(message).unwrap_or_else(|| standard_reply(message))
    })
}

/// Script override that never answers `method`.
pub fn hang_on(method: &'static str) -> impl Fn(&Value) -> Option<Vec<Action>> + Send + Sync {
    move |m: &Value| (m["method"] == method).then(Vec::new)
}

#[derive(Default)]
struct FakeState {
    launch_failures: AtomicU32,
    launches: Mutex<Vec<Instant>>,
    received: Mutex<Vec<Value>>,
    current_exit: Mutex<Option<oneshot::Sender<Option<i32>>>>,
    cwds: Mutex<Vec<PathBuf>>,
}

/// In-memory [`ProcessSpawner`] driving a scripted agent.
#[derive(Clone)]
pub struct FakeSpawner {
    script: Script,
    state: Arc<FakeState>,
}

impl FakeSpawner {
    /// Spawner whose agents follow `script`.
    pub fn new(script: Script) -> Self {
        Self {
            script,
            state: Arc::new(FakeState::default()),
        }
    }

    /// Spawner with the [`standard_script`].
    pub fn standard() -> Self {
        Self::new(standard_script())
    }

    /// Make the next `count` launches fail with `AppError::Launch`.
    pub fn fail_launches(&self, count: u32) {
        self.state.launch_failures.store(count, Ordering::SeqCst);
    }

    /// Number of launch attempts, failed ones included.
    pub fn launch_count(&self) -> usize {
        self.state.launches.lock().unwrap().len()
    }

    /// Time of every launch attempt.
    pub fn launch_times(&self) -> Vec<Instant> {
        self.state.launches.lock().unwrap().clone()
    }

    /// Working directories processes were started in.
    pub fn cwds(&self) -> Vec<PathBuf> {
        self.state.cwds.lock().unwrap().clone()
    }

    /// Every message any fake agent received, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().unwrap().clone()
    }

    /// Messages received with the given method.
    pub fn received_method(&self, method: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|m| m["method"] == method)
            .collect()
    }

    /// Make the most recently launched agent exit with `code`.
    pub fn exit_current(&self, code: Option<i32>) {
        if let Some(tx) = self.state.current_exit.lock().unwrap().take() {
            let _ = tx.send(code);
        }
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(
        &self,
        _spec: &LaunchSpec,
        cwd: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<AgentProcess>> + Send + '_>> {
        let cwd = cwd.to_path_buf();
        Box::pin(async move {
            self.state.launches.lock().unwrap().push(Instant::now());

            let failures = &self.state.launch_failures;
            if failures.load(Ordering::SeqCst) > 0 {
                failures.fetch_sub(1, Ordering::SeqCst);
                return Err(AppError::Launch("fake launch failure".into()));
            }
            self.state.cwds.lock().unwrap().push(cwd);

            let (client_stdin, agent_stdin) = tokio::io::duplex(64 * 1024);
            let (agent_stdout, client_stdout) = tokio::io::duplex(64 * 1024);
            let (control_tx, control_rx) = oneshot::channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            let kill = CancellationToken::new();

            *self.state.current_exit.lock().unwrap() = Some(control_tx);

            tokio::spawn(run_agent(
                Arc::clone(&self.script),
                Arc::clone(&self.state),
                agent_stdin,
                agent_stdout,
                control_rx,
                kill.clone(),
                exit_tx,
            ));

            let exit: ExitFuture = Box::pin(async move {
                exit_rx.await.unwrap_or(ProcessExit {
                    code: None,
                    reason: "fake agent vanished".into(),
                })
            });

            Ok(AgentProcess {
                stdin: Box::new(client_stdin),
                stdout: Box::new(client_stdout),
                exit,
                kill,
            })
        })
    }
}

async fn run_agent(
    script: Script,
    state: Arc<FakeState>,
    stdin: tokio::io::DuplexStream,
    mut stdout: tokio::io::DuplexStream,
    mut control: oneshot::Receiver<Option<i32>>,
    kill: CancellationToken,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    let mut lines = BufReader::new(stdin).lines();

    let exit = 'agent: loop {
        tokio::select! {
            () = kill.cancelled() => {
                break ProcessExit { code: None, reason: "killed".into() };
            }
            code = &mut control => {
                let code = code.unwrap_or(None);
                break ProcessExit { code, reason: format!("exited with {code:?}") };
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    break ProcessExit { code: Some(0), reason: "stdin closed".into() };
                };
                let Ok(message) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                state.received.lock().unwrap().push(message.clone());

                for action in script(&message) {
                    match action {
                        Action::Send(value) => {
                            if write_line(&mut stdout, &value.to_string()).await.is_err() {
                                break 'agent ProcessExit { code: None, reason: "stdout closed".into() };
                            }
                        }
                        Action::Raw(text) => {
                            if write_line(&mut stdout, &text).await.is_err() {
                                break 'agent ProcessExit { code: None, reason: "stdout closed".into() };
                            }
                        }
                        Action::Exit(code) => {
                            break 'agent ProcessExit { code, reason: format!("exited with {code:?}") };
                        }
                    }
                }
            }
        }
    };

    drop(stdout);
    let _ = exit_tx.send(exit);
}

async fn write_line(out: &mut tokio::io::DuplexStream, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes()).await?;
    out.write_all(b"\n").await
}

/// Config for a `custom` backend with short delays.
pub fn test_config() -> GlobalConfig {
    GlobalConfig {
        backend: BackendConfig {
            kind: "custom".into(),
            command: Some(CommandOverride::Argv(vec!["fake-agent".into()])),
            cwd: std::env::temp_dir(),
        },
        session: SessionDefaults::default(),
        connection: ConnectionSettings {
            max_retries: 3,
            retry_base_delay_ms: 50,
            settle_delay_ms: 0,
            handshake_timeout_seconds: 5,
            setting_timeout_seconds: 5,
            stop_grace_seconds: 1,
        },
    }
}

/// Poll `condition` every few milliseconds until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within five seconds.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive events until one satisfies `matches`.
///
/// # Panics
///
/// Panics if no matching event arrives within thirty seconds or the stream
/// closes.
pub async fn wait_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    matches: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    let next = async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), next)
        .await
        .expect("timed out waiting for a connection event")
}

/// Warning texts among the events still queued on `events`.
pub fn drain_warnings(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<String> {
    let mut warnings = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ConnectionEvent::Warning(message) = event {
            warnings.push(message);
        }
    }
    warnings
}
