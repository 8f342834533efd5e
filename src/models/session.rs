//! Logical session model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a logical session, derived from its connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Usable: never connected yet, connecting, or connected.
    Active,
    /// The agent process went away after the session had been connected.
    Disconnected,
    /// The last connection attempt or process run ended in an error.
    Error,
}

impl SessionStatus {
    /// Derive the status from connection facts.
    #[must_use]
    pub fn derive(has_error: bool, running: bool, connected_once: bool) -> Self {
        if has_error {
            Self::Error
        } else if connected_once && !running {
            Self::Disconnected
        } else {
            Self::Active
        }
    }
}

/// Host-facing conversation unit, owning exactly one agent connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LogicalSession {
    /// Unique identifier (UUID v4); never reused.
    pub id: String,
    /// Display label.
    pub label: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: SessionStatus,
}

impl LogicalSession {
    /// Construct a new session with a generated identifier.
    #[must_use]
    pub fn new(label: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label,
            created_at: Utc::now(),
            status: SessionStatus::Active,
        }
    }
}
