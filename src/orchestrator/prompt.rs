//! Prompt orchestration.
//!
//! [`PromptOrchestrator::send`] acknowledges a prompt immediately with a
//! host-generated [`RequestId`] and an event receiver, then dispatches the
//! prompt on the active session's connection in the background. Every
//! event the caller receives carries that request id.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::acp::connection::{AcpConnection, ConnectionStatus, TaggedUpdate};
use crate::models::prompt::{FileContext, PromptEvent, RequestId};
use crate::orchestrator::context::augment_prompt;
use crate::orchestrator::session_manager::SessionManager;
use crate::{AppError, Result};

/// Acknowledgement of an accepted prompt.
#[derive(Debug)]
pub struct PromptHandle {
    /// Host-generated request id.
    pub request_id: RequestId,
    /// Logical session the prompt was sent on.
    pub session_id: String,
    /// Streamed updates followed by exactly one `Completed` or `Failed`.
    pub events: mpsc::UnboundedReceiver<PromptEvent>,
}

/// Sends prompts on the active logical session.
#[derive(Clone)]
pub struct PromptOrchestrator {
    sessions: Arc<SessionManager>,
}

impl PromptOrchestrator {
    /// Create an orchestrator over `sessions`.
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Session registry this orchestrator dispatches to.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Accept a prompt for the active session, creating one if none exists.
    ///
    /// The text is augmented with `context` before it is sent. Connection,
    /// handshake, and agent errors arrive as [`PromptEvent::Failed`].
    ///
    /// # Errors
    ///
    /// - `AppError::Protocol` if `text` is blank.
    /// - `AppError::Shutdown` if a session has to be created during shutdown.
    pub async fn send(&self, text: &str, context: Option<FileContext>) -> Result<PromptHandle> {
        if text.trim().is_empty() {
            return Err(AppError::Protocol("prompt must not be empty".into()));
        }

        let (session_id, connection) = self.active_or_new().await?;
        let request_id = RequestId::new();
        let prompt = augment_prompt(text, context.as_ref());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        info!(
            session_id = session_id.as_str(),
            request_id = request_id.as_str(),
            with_context = context.is_some(),
            "prompt accepted"
        );
        tokio::spawn(dispatch(connection, request_id.clone(), prompt, events_tx));

        Ok(PromptHandle {
            request_id,
            session_id,
            events: events_rx,
        })
    }

    /// Cancel the active session's current turn.
    ///
    /// Returns `Ok(false)` when there is nothing to cancel.
    ///
    /// # Errors
    ///
    /// Returns the connection's error if the cancel notification cannot be
    /// sent.
    pub async fn cancel(&self) -> Result<bool> {
        match self.sessions.active_connection().await {
            Some((_, connection)) => connection.cancel().await,
            None => Ok(false),
        }
    }

    /// Status of the active session's connection.
    pub async fn status(&self) -> Option<ConnectionStatus> {
        self.sessions
            .active_connection()
            .await
            .map(|(_, connection)| connection.status())
    }

    async fn active_or_new(&self) -> Result<(String, AcpConnection)> {
        if let Some(active) = self.sessions.active_connection().await {
            return Ok(active);
        }
        let session = self.sessions.create_session(None).await?;
        let connection = self
            .sessions
            .get_connection(&session.id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("session {} vanished", session.id)))?;
        Ok((session.id, connection))
    }
}

async fn dispatch(
    connection: AcpConnection,
    request_id: RequestId,
    prompt: String,
    events: mpsc::UnboundedSender<PromptEvent>,
) {
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let call = connection.prompt(request_id.clone(), &prompt, updates_tx);
    tokio::pin!(call);

    let forward = |update: TaggedUpdate| {
        // A dropped receiver only means the caller stopped listening.
        let _ = events.send(PromptEvent::Update {
            request_id: request_id.clone(),
            update: update.update,
        });
    };

    let result = loop {
        tokio::select! {
            biased;

            Some(update) = updates_rx.recv() => forward(update),
            result = &mut call => break result,
        }
    };
    while let Ok(update) = updates_rx.try_recv() {
        forward(update);
    }

    let event = match result {
        Ok(response) => PromptEvent::Completed {
            request_id: request_id.clone(),
            response,
        },
        Err(error) => {
            warn!(request_id = request_id.as_str(), %error, "prompt failed");
            PromptEvent::Failed {
                request_id: request_id.clone(),
                error,
            }
        }
    };
    if events.send(event).is_err() {
        debug!(
            request_id = request_id.as_str(),
            "prompt caller went away before completion"
        );
    }
}
