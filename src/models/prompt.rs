//! Prompt request model: request ids, editor context, and caller events.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::acp::protocol::{PromptResponse, SessionUpdate};
use crate::AppError;

/// Host-generated identifier of one prompt request.
///
/// Distinct from JSON-RPC correlation ids; it is what streaming updates are
/// tagged with on their way back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One-based line span, with optional one-based column span.
///
/// Columns are only meaningful for a single-line selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    /// First line.
    pub start_line: u32,
    /// Last line (inclusive).
    pub end_line: u32,
    /// First column on `start_line`.
    #[serde(default)]
    pub start_col: Option<u32>,
    /// Last column on `end_line` (inclusive).
    #[serde(default)]
    pub end_col: Option<u32>,
}

impl LineRange {
    /// Span covering a single line.
    #[must_use]
    pub fn line(line: u32) -> Self {
        Self::lines(line, line)
    }

    /// Span covering `start..=end` lines.
    #[must_use]
    pub fn lines(start: u32, end: u32) -> Self {
        Self {
            start_line: start,
            end_line: end,
            start_col: None,
            end_col: None,
        }
    }

    /// Column span within a single line.
    #[must_use]
    pub fn columns(line: u32, start_col: u32, end_col: u32) -> Self {
        Self {
            start_line: line,
            end_line: line,
            start_col: Some(start_col),
            end_col: Some(end_col),
        }
    }
}

/// Editor context attached to a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileContext {
    /// File path as the agent should see it (usually workspace-relative).
    pub path: String,
    /// Selected span, if any.
    #[serde(default)]
    pub range: Option<LineRange>,
    /// Literal selected text, if any.
    #[serde(default)]
    pub selected_text: Option<String>,
}

impl FileContext {
    /// Context naming a file without a selection.
    #[must_use]
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            range: None,
            selected_text: None,
        }
    }

    /// Attach a range.
    #[must_use]
    pub fn with_range(mut self, range: LineRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Attach the selected text.
    #[must_use]
    pub fn with_selection(mut self, text: impl Into<String>) -> Self {
        self.selected_text = Some(text.into());
        self
    }
}

/// Event delivered to the caller of a prompt request.
#[derive(Debug, Clone, PartialEq)]
pub enum PromptEvent {
    /// Streamed `session/update` for this request.
    Update {
        /// Request the update belongs to.
        request_id: RequestId,
        /// Update payload.
        update: SessionUpdate,
    },
    /// The agent finished the turn.
    Completed {
        /// Request that finished.
        request_id: RequestId,
        /// Agent's completion result.
        response: PromptResponse,
    },
    /// The request failed.
    Failed {
        /// Request that failed.
        request_id: RequestId,
        /// Failure cause.
        error: AppError,
    },
}

impl PromptEvent {
    /// Request this event belongs to.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Update { request_id, .. }
            | Self::Completed { request_id, .. }
            | Self::Failed { request_id, .. } => request_id,
        }
    }

    /// Whether this is the last event for its request.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Update { .. })
    }
}
