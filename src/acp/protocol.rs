//! ACP method names and payload types.
//!
//! Only the fields the engine reads are typed; everything else the agent
//! sends is kept as raw [`Value`]s so newer agents do not break decoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AppError, Result};

/// `initialize` request.
pub const METHOD_INITIALIZE: &str = "initialize";
/// `session/new` request.
pub const METHOD_SESSION_NEW: &str = "session/new";
/// `session/set_mode` request.
pub const METHOD_SET_MODE: &str = "session/set_mode";
/// `session/set_model` request.
pub const METHOD_SET_MODEL: &str = "session/set_model";
/// `session/prompt` request.
pub const METHOD_PROMPT: &str = "session/prompt";
/// `session/cancel` notification.
pub const METHOD_CANCEL: &str = "session/cancel";
/// `session/update` notification.
pub const METHOD_SESSION_UPDATE: &str = "session/update";

// ── Content ──────────────────────────────────────────────────────────────────

/// A block of prompt or message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// Text content.
        text: String,
    },
    /// Link to a resource the agent can read.
    ResourceLink {
        /// Resource URI.
        uri: String,
        /// Display name.
        #[serde(default)]
        name: Option<String>,
    },
    /// Any other content type (images, audio, embedded resources).
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    /// Text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text carried by this block, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

// ── initialize ───────────────────────────────────────────────────────────────

/// Name and version of an ACP peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Peer name.
    pub name: String,
    /// Peer version, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Result of a successful `initialize` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    /// Protocol version the agent speaks.
    #[serde(default)]
    pub protocol_version: Option<u64>,
    /// Agent identity.
    #[serde(default)]
    pub agent_info: Option<Implementation>,
    /// Agent capabilities; opaque to the engine apart from setting probes.
    #[serde(default)]
    pub agent_capabilities: Value,
}

// ── session/new ──────────────────────────────────────────────────────────────

/// Modes advertised by the agent for a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionModeState {
    /// Mode active right after creation.
    pub current_mode_id: String,
    /// Modes the agent accepts.
    #[serde(default)]
    pub available_modes: Vec<Value>,
}

/// Models advertised by the agent for a new session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionModelState {
    /// Model active right after creation.
    pub current_model_id: String,
    /// Models the agent accepts.
    #[serde(default)]
    pub available_models: Vec<Value>,
}

/// Result of `session/new`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSessionResponse {
    /// Agent-side session id.
    pub session_id: String,
    /// Available modes, if the agent supports modes.
    #[serde(default)]
    pub modes: Option<SessionModeState>,
    /// Available models, if the agent supports model selection.
    #[serde(default)]
    pub models: Option<SessionModelState>,
}

// ── session/prompt ───────────────────────────────────────────────────────────

/// Result of `session/prompt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    /// Why the agent stopped (`end_turn`, `cancelled`, …).
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Full result as returned by the agent.
    #[serde(skip)]
    pub raw: Value,
}

impl PromptResponse {
    /// Interpret a `session/prompt` result. Unknown shapes are kept in `raw`.
    #[must_use]
    pub fn from_result(result: Value) -> Self {
        let stop_reason = result
            .get("stopReason")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Self {
            stop_reason,
            raw: result,
        }
    }
}

// ── session/update ───────────────────────────────────────────────────────────

/// Tool call announced by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Tool call id, unique within the session.
    pub tool_call_id: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Tool category (`read`, `edit`, `execute`, …).
    #[serde(default)]
    pub kind: Option<String>,
    /// Status (`pending`, `in_progress`, `completed`, `failed`).
    #[serde(default)]
    pub status: Option<String>,
    /// Raw tool input.
    #[serde(default)]
    pub raw_input: Option<Value>,
}

/// Change to an existing tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallUpdate {
    /// Tool call id being updated.
    pub tool_call_id: String,
    /// New status, if changed.
    #[serde(default)]
    pub status: Option<String>,
    /// New title, if changed.
    #[serde(default)]
    pub title: Option<String>,
    /// Produced content, if any.
    #[serde(default)]
    pub content: Option<Vec<Value>>,
}

/// One entry of an agent plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// Step description.
    pub content: String,
    /// Priority (`high`, `medium`, `low`).
    #[serde(default)]
    pub priority: Option<String>,
    /// Status (`pending`, `in_progress`, `completed`).
    #[serde(default)]
    pub status: Option<String>,
}

/// Payload of a `session/update` notification, keyed by `sessionUpdate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// Streamed chunk of the agent's reply.
    AgentMessageChunk {
        /// Chunk content.
        content: ContentBlock,
    },
    /// Streamed chunk of the agent's reasoning.
    AgentThoughtChunk {
        /// Chunk content.
        content: ContentBlock,
    },
    /// Echo of user content (session replay).
    UserMessageChunk {
        /// Chunk content.
        content: ContentBlock,
    },
    /// New tool call.
    ToolCall(ToolCall),
    /// Tool call progress.
    ToolCallUpdate(ToolCallUpdate),
    /// Execution plan.
    Plan {
        /// Plan steps.
        entries: Vec<PlanEntry>,
    },
    /// Slash commands the agent offers.
    AvailableCommandsUpdate {
        /// Command descriptors.
        #[serde(rename = "availableCommands", default)]
        available_commands: Vec<Value>,
    },
    /// Agent switched mode.
    CurrentModeUpdate {
        /// New mode id.
        #[serde(rename = "currentModeId")]
        current_mode_id: String,
    },
    /// Variant this client does not model.
    #[serde(other)]
    Other,
}

impl SessionUpdate {
    /// Text of a message or thought chunk.
    #[must_use]
    pub fn chunk_text(&self) -> Option<&str> {
        match self {
            Self::AgentMessageChunk { content }
            | Self::AgentThoughtChunk { content }
            | Self::UserMessageChunk { content } => content.as_text(),
            _ => None,
        }
    }
}

/// Decoded `session/update` parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionNotification {
    /// Agent-side session id, when the agent includes it.
    pub session_id: Option<String>,
    /// The update itself.
    pub update: SessionUpdate,
}

impl SessionNotification {
    /// Decode `session/update` params.
    ///
    /// Accepts both `{sessionId, update: {sessionUpdate, …}}` and a bare
    /// update object.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` when no update object can be decoded.
    pub fn from_params(params: Option<Value>) -> Result<Self> {
        let Some(Value::Object(mut obj)) = params else {
            return Err(AppError::Protocol(
                "session/update params must be an object".into(),
            ));
        };

        let session_id = obj
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let update = match obj.remove("update") {
            Some(update) => update,
            None => Value::Object(obj),
        };

        let update = serde_json::from_value::<SessionUpdate>(update)
            .map_err(|e| AppError::Protocol(format!("undecodable session/update: {e}")))?;

        Ok(Self { session_id, update })
    }
}
