//! Connection lifecycle state machine.
//!
//! ```text
//! Idle ──► Starting ──► Ready ◄──► Streaming { n }
//!  ▲          │           │              │
//!  │          ▼           ▼              ▼
//!  └────── Stopping ◄─────┴──────────────┘
//! ```
//!
//! Every state except `Stopping` may also fall straight back to `Idle` when
//! the agent process dies or a handshake gives up.

use std::fmt;

use serde::Serialize;

use crate::{AppError, Result};

/// Lifecycle state of an [`AcpConnection`](crate::acp::connection::AcpConnection).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No agent process.
    #[default]
    Idle,
    /// Process being launched and the `initialize` handshake in progress.
    Starting,
    /// Handshake complete; no prompt outstanding.
    Ready,
    /// One or more prompts outstanding.
    Streaming {
        /// Number of outstanding prompts, always at least one.
        prompts: usize,
    },
    /// Explicit teardown in progress.
    Stopping,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Idle, Ready, Starting, Stopping, Streaming};

        match (self, next) {
            (Idle, Starting)
            | (Starting, Ready | Idle | Stopping)
            | (Ready, Streaming { prompts: 1 } | Stopping | Idle)
            | (Streaming { .. }, Stopping | Idle)
            | (Streaming { prompts: 1 }, Ready)
            | (Stopping, Idle) => true,
            (Streaming { prompts: n }, Streaming { prompts: m }) => {
                m > 0 && (m == n + 1 || m + 1 == n)
            }
            _ => false,
        }
    }

    /// Move to `next`, refusing illegal transitions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` when the transition is not allowed; `self`
    /// is left unchanged.
    pub fn transition(&mut self, next: Self) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(AppError::State(format!(
                "illegal transition {self} -> {next}"
            )));
        }
        *self = next;
        Ok(())
    }

    /// State after one more prompt starts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` unless the connection is `Ready` or
    /// `Streaming`.
    pub fn begin_prompt(&mut self) -> Result<()> {
        let next = match *self {
            Self::Ready => Self::Streaming { prompts: 1 },
            Self::Streaming { prompts } => Self::Streaming {
                prompts: prompts + 1,
            },
            other => {
                return Err(AppError::State(format!(
                    "cannot start a prompt while {other}"
                )));
            }
        };
        self.transition(next)
    }

    /// State after one outstanding prompt finishes.
    ///
    /// Does nothing unless the connection is `Streaming`: a teardown that
    /// raced the prompt has already moved the state elsewhere.
    pub fn end_prompt(&mut self) {
        if let Self::Streaming { prompts } = *self {
            *self = if prompts <= 1 {
                Self::Ready
            } else {
                Self::Streaming {
                    prompts: prompts - 1,
                }
            };
        }
    }

    /// Whether the handshake has completed and the process is usable.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready | Self::Streaming { .. })
    }

    /// Number of outstanding prompts.
    #[must_use]
    pub fn prompts(self) -> usize {
        match self {
            Self::Streaming { prompts } => prompts,
            _ => 0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Starting => f.write_str("starting"),
            Self::Ready => f.write_str("ready"),
            Self::Streaming { prompts } => write!(f, "streaming({prompts})"),
            Self::Stopping => f.write_str("stopping"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
