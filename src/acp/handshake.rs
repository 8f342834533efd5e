//! ACP initialization handshake and session-setting policy.
//!
//! After an agent process is spawned the connection waits a short settle
//! delay, then performs the `initialize` exchange:
//!
//! 1. **[`initialize_params`]**: the request payload, advertising the client
//!    name/version and the file-system capabilities this client offers.
//! 2. **[`parse_initialize`]**: validates the agent's reply and extracts the
//!    agent info and capabilities.
//! 3. **[`backoff_delay`]**: if the attempt failed with a retryable error the
//!    process is torn down and the next attempt waits `base * attempt²`.
//!
//! Mode/model selection after `session/new` consults [`setting_support`] so
//! that settings an agent explicitly declares unsupported are never sent.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::acp::protocol::{Implementation, InitializeResponse, METHOD_SET_MODE, METHOD_SET_MODEL};
use crate::{AppError, Result};

/// ACP protocol version requested in `initialize`.
pub const PROTOCOL_VERSION: u64 = 1;

/// Build the `initialize` request parameters.
///
/// ```json
/// {
///   "protocolVersion": 1,
///   "clientInfo": { "name": "agent-relay", "version": "0.1.0" },
///   "capabilities": {
///     "fs": { "readTextFile": true, "writeTextFile": true },
///     "terminal": false
///   }
/// }
/// ```
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "fs": { "readTextFile": true, "writeTextFile": true },
            "terminal": false,
        },
    })
}

/// Agent identity and capabilities recorded after a successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    /// Protocol version the agent answered with.
    pub protocol_version: Option<u64>,
    /// Agent name and version, if reported.
    pub implementation: Option<Implementation>,
    /// Raw capabilities object.
    pub capabilities: Value,
}

/// Interpret the result of an `initialize` request.
///
/// # Errors
///
/// Returns `AppError::Handshake` if the result is not an object or does not
/// match the `initialize` response shape.
pub fn parse_initialize(result: Value) -> Result<AgentInfo> {
    if !result.is_object() {
        return Err(AppError::Handshake(format!(
            "initialize returned a non-object result: {result}"
        )));
    }
    let response: InitializeResponse = serde_json::from_value(result)
        .map_err(|e| AppError::Handshake(format!("unusable initialize result: {e}")))?;

    Ok(AgentInfo {
        protocol_version: response.protocol_version,
        implementation: response.agent_info,
        capabilities: response.agent_capabilities,
    })
}

/// Delay before retry number `attempt + 1`, i.e. `base * attempt²`.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt.saturating_mul(attempt))
}

// ── Session settings ─────────────────────────────────────────────────────────

/// A per-session setting applied right after `session/new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    /// Agent mode (`session/set_mode`).
    Mode,
    /// Agent model (`session/set_model`).
    Model,
}

impl SettingKind {
    /// Request method.
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::Mode => METHOD_SET_MODE,
            Self::Model => METHOD_SET_MODEL,
        }
    }

    /// Name of the parameter carrying the requested value.
    #[must_use]
    pub fn param_key(self) -> &'static str {
        match self {
            Self::Mode => "modeId",
            Self::Model => "modelId",
        }
    }

    /// Capability keys that may declare support, in both spellings agents use.
    #[must_use]
    pub fn capability_keys(self) -> [&'static str; 2] {
        match self {
            Self::Mode => ["setMode", "set_mode"],
            Self::Model => ["setModel", "set_model"],
        }
    }

    /// Request parameters for applying `value` to `session_id`.
    #[must_use]
    pub fn params(self, session_id: &str, value: &str) -> Value {
        let mut params = json!({ "sessionId": session_id });
        if let Some(obj) = params.as_object_mut() {
            obj.insert(self.param_key().to_owned(), Value::String(value.to_owned()));
        }
        params
    }

    /// Lower-case name for logs and warnings.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mode => "mode",
            Self::Model => "model",
        }
    }
}

/// What an agent's capabilities say about a setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingSupport {
    /// A capability key is present and not `false`.
    Declared,
    /// A capability key is explicitly `false`.
    Unsupported,
    /// No capability key mentions the setting.
    Unknown,
}

/// Look up `kind` in `capabilities`.
///
/// Keys are checked at the top level and under `session` and
/// `sessionCapabilities`. An explicit `false` anywhere wins.
#[must_use]
pub fn setting_support(capabilities: &Value, kind: SettingKind) -> SettingSupport {
    let scopes = [
        Some(capabilities),
        capabilities.get("session"),
        capabilities.get("sessionCapabilities"),
    ];

    let mut declared = false;
    for scope in scopes.into_iter().flatten() {
        for key in kind.capability_keys() {
            match scope.get(key) {
                Some(Value::Bool(false)) => return SettingSupport::Unsupported,
                Some(Value::Null) | None => {}
                Some(_) => declared = true,
            }
        }
    }

    if declared {
        SettingSupport::Declared
    } else {
        SettingSupport::Unknown
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
