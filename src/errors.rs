//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// JSON-RPC error code for "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Application error enumeration covering all domain failure modes.
///
/// Each variant is a failure *kind* assigned where the failure happens, so
/// retry policy is decided by matching on the variant rather than on the
/// message text. See [`AppError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure, including an unsupported
    /// backend selection.
    Config(String),
    /// The agent subprocess failed to start.
    Launch(String),
    /// No agent subprocess is attached to the connection.
    NotConnected(String),
    /// An outbound message could not be handed to the agent's stdin writer.
    Send(String),
    /// The agent subprocess exited while the connection depended on it.
    Exited {
        /// Backend name the process was launched for.
        backend: String,
        /// Process exit code, if the process exited normally.
        code: Option<i32>,
        /// Likely cause, e.g. a missing credential variable.
        hint: Option<String>,
    },
    /// Malformed or unexpected wire message.
    Protocol(String),
    /// The `initialize` exchange returned something unusable.
    Handshake(String),
    /// The agent answered a request with a JSON-RPC error object.
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the agent.
        message: String,
    },
    /// The agent declared a capability unsupported.
    Unsupported(String),
    /// A request exceeded its deadline.
    Timeout(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Illegal connection state transition.
    State(String),
    /// The host is shutting down; retries are disabled.
    Shutdown(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether a failed handshake attempt with this error should be retried.
    ///
    /// Launch failures, missing or broken transports, and subprocess exits are
    /// transient from the connection's point of view; everything else
    /// completes the handshake immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Launch(_) | Self::NotConnected(_) | Self::Send(_) | Self::Exited { .. }
        )
    }

    /// Whether the agent rejected a request because it does not implement the
    /// method.
    #[must_use]
    pub fn is_method_not_found(&self) -> bool {
        matches!(self, Self::Rpc { code, .. } if *code == METHOD_NOT_FOUND)
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::NotConnected(msg) => write!(f, "not connected: {msg}"),
            Self::Send(msg) => write!(f, "send: {msg}"),
            Self::Exited {
                backend,
                code,
                hint,
            } => {
                match code {
                    Some(c) => write!(f, "exited: {backend} agent exited with code {c}")?,
                    None => write!(f, "exited: {backend} agent terminated by signal")?,
                }
                if let Some(hint) = hint {
                    write!(f, " ({hint})")?;
                }
                Ok(())
            }
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake: {msg}"),
            Self::Rpc { code, message } => write!(f, "rpc: {message} (code {code})"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::State(msg) => write!(f, "state: {msg}"),
            Self::Shutdown(msg) => write!(f, "shutdown: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
