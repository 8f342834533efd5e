//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::acp::spawner::build_launch_spec;
use crate::{AppError, Result};

/// Launch command override for a local backend.
///
/// The string form names a binary that is invoked as `<path> acp`; the array
/// form is used verbatim (first element is the program).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandOverride {
    /// Binary name or path, invoked with an implicit `acp` argument.
    Path(String),
    /// Raw argument vector, invoked exactly as given.
    Argv(Vec<String>),
}

/// Agent backend selection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BackendConfig {
    /// Backend kind (`claude-code`, `opencode`, `custom`).
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    /// Optional launch command override.
    #[serde(default)]
    pub command: Option<CommandOverride>,
    /// Working directory for the agent process and `session/new`.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            command: None,
            cwd: default_cwd(),
        }
    }
}

fn default_backend_kind() -> String {
    "claude-code".into()
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

/// Mode and model requested for every new agent-side session.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionDefaults {
    /// Agent mode applied via `session/set_mode` after `session/new`.
    #[serde(default)]
    pub mode: Option<String>,
    /// Agent model applied via `session/set_model` after `session/new`.
    #[serde(default)]
    pub model: Option<String>,
}

/// Retry, backoff, and timeout settings for agent connections.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConnectionSettings {
    /// Maximum handshake attempts per connect.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for quadratic backoff (`base * attempt²`).
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Pause between spawning the agent and sending `initialize`.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Deadline for the `initialize` response.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
    /// Deadline for each `session/set_mode` / `session/set_model` call.
    #[serde(default = "default_setting_timeout")]
    pub setting_timeout_seconds: u64,
    /// Time allowed for a killed agent process to be reaped on disconnect.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_settle_delay_ms() -> u64 {
    100
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_setting_timeout() -> u64 {
    5
}

fn default_stop_grace() -> u64 {
    5
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            handshake_timeout_seconds: default_handshake_timeout(),
            setting_timeout_seconds: default_setting_timeout(),
            stop_grace_seconds: default_stop_grace(),
        }
    }
}

impl ConnectionSettings {
    /// Backoff base delay.
    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Settle delay before `initialize`.
    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Deadline for the `initialize` response.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    /// Deadline for a single mode/model setting call.
    #[must_use]
    pub fn setting_timeout(&self) -> Duration {
        Duration::from_secs(self.setting_timeout_seconds)
    }

    /// Grace period for reaping a killed process.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent backend selection.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Defaults applied to new agent-side sessions.
    #[serde(default)]
    pub session: SessionDefaults,
    /// Retry and timeout settings.
    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate settings and canonicalize the backend working directory.
    ///
    /// Called by the loaders; call it again after applying CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when the retry bound is zero, the backend
    /// cannot produce a launch command, or `cwd` does not exist.
    pub fn validate(&mut self) -> Result<()> {
        if self.connection.max_retries == 0 {
            return Err(AppError::Config(
                "connection.max_retries must be greater than zero".into(),
            ));
        }

        build_launch_spec(&self.backend)?;

        let canonical = self
            .backend
            .cwd
            .canonicalize()
            .map_err(|err| AppError::Config(format!("backend.cwd invalid: {err}")))?;
        self.backend.cwd = canonical;

        Ok(())
    }
}
