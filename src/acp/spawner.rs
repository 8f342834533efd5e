//! ACP agent process launcher.
//!
//! Two concerns live here:
//!
//! - [`build_launch_spec`] turns a [`BackendConfig`] into a program and
//!   argument vector. It is pure and fails with `AppError::Config` for
//!   malformed selections.
//! - [`ProcessSpawner`] starts the process. [`TokioSpawner`] is the real
//!   implementation: piped stdio, the configured working directory,
//!   `kill_on_drop(true)`, and stderr forwarded to `DEBUG` logs. Tests plug in
//!   in-process fakes through the same trait.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, CommandOverride};
use crate::{AppError, Result};

/// Package run through `npx` for the `claude-code` backend.
const CLAUDE_CODE_PACKAGE: &str = "@zed-industries/claude-code-acp";

/// Credential the `claude-code` backend reads from the environment.
const CLAUDE_CODE_CREDENTIAL: &str = "ANTHROPIC_API_KEY";

/// Default binary for the `opencode` backend.
const OPENCODE_BINARY: &str = "opencode";

// ── Backend kinds ────────────────────────────────────────────────────────────

/// Supported agent backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Fixed `npx` launcher for the Claude Code ACP adapter.
    ClaudeCode,
    /// Local `opencode` binary (or an override), invoked as `<path> acp`.
    OpenCode,
    /// Any local ACP agent; a command override is mandatory.
    Custom,
}

impl BackendKind {
    /// Configuration name of the backend.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::OpenCode => "opencode",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "claude-code" | "claude" => Ok(Self::ClaudeCode),
            "opencode" => Ok(Self::OpenCode),
            "custom" => Ok(Self::Custom),
            other => Err(AppError::Config(format!(
                "unsupported backend kind '{other}' (expected claude-code, opencode, or custom)"
            ))),
        }
    }
}

// ── Launch spec ──────────────────────────────────────────────────────────────

/// Fully resolved command line for an agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Backend the command was built for.
    pub backend: BackendKind,
    /// Program to execute.
    pub program: String,
    /// Arguments passed to `program`.
    pub args: Vec<String>,
    /// Environment variable the agent needs for authentication, if any.
    pub credential_env: Option<&'static str>,
}

impl LaunchSpec {
    /// Hint describing a missing credential, if the backend needs one and the
    /// variable is unset or empty in this process's environment.
    #[must_use]
    pub fn credential_hint(&self) -> Option<String> {
        let var = self.credential_env?;
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => None,
            _ => Some(format!("{var} is not set; the agent may fail to authenticate")),
        }
    }
}

/// Build the command line for `config`.
///
/// # Errors
///
/// Returns `AppError::Config` when the backend kind is unknown, a command
/// override is given for the fixed `claude-code` launcher, an argument array
/// is empty, or a `custom` backend has no command.
pub fn build_launch_spec(config: &BackendConfig) -> Result<LaunchSpec> {
    let backend: BackendKind = config.kind.parse()?;

    match backend {
        BackendKind::ClaudeCode => {
            if config.command.is_some() {
                return Err(AppError::Config(
                    "backend.command is not supported for the claude-code backend".into(),
                ));
            }
            Ok(LaunchSpec {
                backend,
                program: "npx".into(),
                args: vec!["-y".into(), CLAUDE_CODE_PACKAGE.into()],
                credential_env: Some(CLAUDE_CODE_CREDENTIAL),
            })
        }
        BackendKind::OpenCode | BackendKind::Custom => {
            let command = match (&config.command, backend) {
                (Some(command), _) => command.clone(),
                (None, BackendKind::OpenCode) => CommandOverride::Path(OPENCODE_BINARY.into()),
                (None, _) => {
                    return Err(AppError::Config(
                        "backend.command is required for the custom backend".into(),
                    ));
                }
            };
            local_command(backend, command)
        }
    }
}

fn local_command(backend: BackendKind, command: CommandOverride) -> Result<LaunchSpec> {
    let (program, args) = match command {
        CommandOverride::Path(path) => {
            if path.trim().is_empty() {
                return Err(AppError::Config("backend.command must not be empty".into()));
            }
            (path, vec!["acp".to_owned()])
        }
        CommandOverride::Argv(argv) => {
            let mut argv = argv.into_iter();
            let Some(program) = argv.next().filter(|p| !p.trim().is_empty()) else {
                return Err(AppError::Config(
                    "backend.command array must name a program".into(),
                ));
            };
            (program, argv.collect())
        }
    };

    Ok(LaunchSpec {
        backend,
        program,
        args,
        credential_env: None,
    })
}

// ── Spawned process handle ───────────────────────────────────────────────────

/// How an agent process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, absent when terminated by a signal or killed.
    pub code: Option<i32>,
    /// Human-readable description.
    pub reason: String,
}

/// Boxed future resolving when the agent process has exited.
pub type ExitFuture = Pin<Box<dyn Future<Output = ProcessExit> + Send>>;

/// Stdio and lifecycle handles for a running agent process.
///
/// The process is terminated when `kill` is cancelled; `exit` resolves once
/// it is gone, whichever way it ended.
pub struct AgentProcess {
    /// Writable end connected to the agent's stdin.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Readable end connected to the agent's stdout.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves with the exit status.
    pub exit: ExitFuture,
    /// Cancel to terminate the process.
    pub kill: CancellationToken,
}

impl fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentProcess")
            .field("killed", &self.kill.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Starts agent processes.
pub trait ProcessSpawner: Send + Sync {
    /// Spawn the process described by `spec` in `cwd`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Launch`] if the process cannot be started.
    fn spawn(
        &self,
        spec: &LaunchSpec,
        cwd: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<AgentProcess>> + Send + '_>>;
}

// ── Tokio spawner ────────────────────────────────────────────────────────────

/// [`ProcessSpawner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl ProcessSpawner for TokioSpawner {
    fn spawn(
        &self,
        spec: &LaunchSpec,
        cwd: &Path,
    ) -> Pin<Box<dyn Future<Output = Result<AgentProcess>> + Send + '_>> {
        let spec = spec.clone();
        let cwd = cwd.to_path_buf();
        Box::pin(async move { spawn_child(&spec, cwd) })
    }
}

fn spawn_child(spec: &LaunchSpec, cwd: PathBuf) -> Result<AgentProcess> {
    if let Some(hint) = spec.credential_hint() {
        warn!(backend = %spec.backend, hint = hint.as_str(), "agent credential missing");
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::Launch(format!("failed to start {}: {err}", spec.program))
    })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Launch("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Launch("failed to capture agent stdout".into()))?;

    let backend = spec.backend;
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(%backend, line = line.as_str(), "agent stderr");
            }
        });
    }

    info!(
        %backend,
        program = spec.program.as_str(),
        pid = child.id(),
        cwd = %cwd.display(),
        "agent process spawned"
    );

    let kill = CancellationToken::new();
    let kill_signal = kill.clone();
    let exit: ExitFuture = Box::pin(async move {
        let waited = tokio::select! {
            result = child.wait() => Some(result),
            () = kill_signal.cancelled() => None,
        };
        if let Some(result) = waited {
            return exit_from_status(result);
        }
        if let Err(err) = child.kill().await {
            warn!(%backend, %err, "failed to kill agent process");
        }
        ProcessExit {
            code: None,
            reason: "process killed".into(),
        }
    });

    Ok(AgentProcess {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        exit,
        kill,
    })
}

fn exit_from_status(result: std::io::Result<std::process::ExitStatus>) -> ProcessExit {
    match result {
        Ok(status) => {
            let code = status.code();
            let reason = code.map_or_else(
                || "process terminated by signal".to_owned(),
                |c| format!("process exited with code {c}"),
            );
            ProcessExit { code, reason }
        }
        Err(err) => ProcessExit {
            code: None,
            reason: format!("wait error: {err}"),
        },
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
