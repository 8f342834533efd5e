#![forbid(unsafe_code)]

//! `agent-relay`: line-oriented host for ACP coding agents.
//!
//! Loads configuration, then reads commands from stdin. Plain lines are sent
//! as prompts to the active session; lines starting with `/` manage
//! sessions. Agent output is streamed to stdout, logs go to stderr.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_relay::acp::protocol::SessionUpdate;
use agent_relay::acp::spawner::TokioSpawner;
use agent_relay::config::GlobalConfig;
use agent_relay::models::prompt::{FileContext, LineRange, PromptEvent};
use agent_relay::orchestrator::context::file_reference;
use agent_relay::orchestrator::prompt::{PromptHandle, PromptOrchestrator};
use agent_relay::orchestrator::session_manager::SessionManager;
use agent_relay::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-relay", about = "Drive ACP coding agents over stdio", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the agent working directory.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Override the backend kind (claude-code, opencode, custom).
    #[arg(long)]
    backend: Option<String>,
}

const HELP: &str = "\
commands:
  /new [label]              create a session and make it active
  /list                     list sessions, newest first
  /switch <id>              make a session active
  /delete <id>              delete a session and stop its agent
  /file [path [L[-L]]]      attach file context to following prompts (no args clears)
  /status                   show the active connection status
  /cancel                   cancel the active turn
  /quit                     exit
anything else is sent as a prompt";

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-relay bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = load_config(&args)?;
    info!(
        backend = config.backend.kind.as_str(),
        cwd = %config.backend.cwd.display(),
        "configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let sessions = Arc::new(SessionManager::new(
        config,
        Arc::new(TokioSpawner),
        shutdown.clone(),
    ));
    let orchestrator = PromptOrchestrator::new(Arc::clone(&sessions));

    let outcome = tokio::select! {
        result = repl(&orchestrator) => result,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    sessions.shutdown().await;
    info!("agent-relay stopped");
    outcome
}

fn load_config(args: &Cli) -> Result<GlobalConfig> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };

    if let Some(workspace) = &args.workspace {
        config.backend.cwd.clone_from(workspace);
    }
    if let Some(backend) = &args.backend {
        config.backend.kind.clone_from(backend);
    }

    config.validate()?;
    Ok(config)
}

// ── Command loop ─────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Command<'a> {
    Empty,
    Help,
    New(Option<&'a str>),
    List,
    Switch(&'a str),
    Delete(&'a str),
    File(Option<FileContext>),
    Status,
    Cancel,
    Quit,
    Prompt(&'a str),
    Invalid(String),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Self::Prompt(line);
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        let arg = (!arg.is_empty()).then_some(arg);

        match (name, arg) {
            ("help", _) => Self::Help,
            ("new", label) => Self::New(label),
            ("list", _) => Self::List,
            ("switch", Some(id)) => Self::Switch(id),
            ("delete", Some(id)) => Self::Delete(id),
            ("file", None) => Self::File(None),
            ("file", Some(spec)) => match parse_file_context(spec) {
                Some(context) => Self::File(Some(context)),
                None => Self::Invalid(format!("bad /file argument: {spec}")),
            },
            ("status", _) => Self::Status,
            ("cancel", _) => Self::Cancel,
            ("quit" | "exit", _) => Self::Quit,
            _ => Self::Invalid(format!("unknown command: /{rest}")),
        }
    }
}

/// Parse `path`, `path 14`, or `path 14-20`.
fn parse_file_context(spec: &str) -> Option<FileContext> {
    let mut parts = spec.split_whitespace();
    let context = FileContext::file(parts.next()?);
    let Some(range) = parts.next() else {
        return Some(context);
    };
    let range = match range.split_once('-') {
        Some((start, end)) => LineRange::lines(start.parse().ok()?, end.parse().ok()?),
        None => LineRange::line(range.parse().ok()?),
    };
    (range.start_line <= range.end_line).then(|| context.with_range(range))
}

async fn repl(orchestrator: &PromptOrchestrator) -> Result<()> {
    let sessions = orchestrator.sessions();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut context: Option<FileContext> = None;

    println!("{HELP}");
    while let Some(line) = lines.next_line().await? {
        match Command::parse(&line) {
            Command::Empty => {}
            Command::Help => println!("{HELP}"),
            Command::New(label) => match sessions.create_session(label.map(str::to_owned)).await {
                Ok(session) => println!("created {} ({})", session.id, session.label),
                Err(err) => println!("{err}"),
            },
            Command::List => {
                let active = sessions.active_session().await.map(|s| s.id);
                for session in sessions.list_sessions().await {
                    let marker = if active.as_deref() == Some(session.id.as_str()) {
                        '*'
                    } else {
                        ' '
                    };
                    println!(
                        "{marker} {} {:<16} {:?} {}",
                        session.id,
                        session.label,
                        session.status,
                        session.created_at.format("%H:%M:%S")
                    );
                }
            }
            Command::Switch(id) => match sessions.switch_session(id).await {
                Ok(session) => println!("active: {} ({})", session.id, session.label),
                Err(err) => println!("{err}"),
            },
            Command::Delete(id) => match sessions.delete_session(id).await {
                Ok(()) => println!("deleted {id}"),
                Err(err) => println!("{err}"),
            },
            Command::File(next) => {
                context = next;
                match &context {
                    Some(c) => println!("context: {}", file_reference(c)),
                    None => println!("context cleared"),
                }
            }
            Command::Status => match orchestrator.status().await {
                Some(status) => {
                    let text = serde_json::to_string_pretty(&status)
                        .map_err(|e| AppError::Protocol(format!("failed to render status: {e}")))?;
                    println!("{text}");
                }
                None => println!("no active session"),
            },
            Command::Cancel => match orchestrator.cancel().await {
                Ok(true) => println!("cancel requested"),
                Ok(false) => println!("nothing to cancel"),
                Err(err) => println!("{err}"),
            },
            Command::Quit => break,
            Command::Prompt(text) => match orchestrator.send(text, context.clone()).await {
                Ok(handle) => spawn_printer(handle),
                Err(err) => println!("{err}"),
            },
            Command::Invalid(message) => println!("{message}"),
        }
    }

    Ok(())
}

fn spawn_printer(mut handle: PromptHandle) {
    tokio::spawn(async move {
        while let Some(event) = handle.events.recv().await {
            match event {
                PromptEvent::Update { update, .. } => print_update(&update),
                PromptEvent::Completed { response, .. } => {
                    println!(
                        "\n[done: {}]",
                        response.stop_reason.as_deref().unwrap_or("end_turn")
                    );
                }
                PromptEvent::Failed { error, .. } => println!("\n[error: {error}]"),
            }
        }
    });
}

fn print_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::AgentMessageChunk { content } => {
            if let Some(text) = content.as_text() {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
        }
        SessionUpdate::ToolCall(call) => println!("\n[tool] {}", call.title),
        SessionUpdate::ToolCallUpdate(progress) => {
            if let Some(status) = &progress.status {
                println!("[tool {}] {status}", progress.tool_call_id);
            }
        }
        SessionUpdate::Plan { entries } => {
            for entry in entries {
                println!("[plan] {}", entry.content);
            }
        }
        SessionUpdate::CurrentModeUpdate { current_mode_id } => {
            println!("[mode] {current_mode_id}");
        }
        _ => {}
    }
}

// ── Process plumbing ─────────────────────────────────────────────────────────

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
