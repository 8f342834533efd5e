//! Logical session registry.
//!
//! Maps logical session ids to their [`AcpConnection`]s. Connections are
//! created lazily: registering a session never starts an agent process.
//!
//! The map lives behind a [`RwLock`] that is never held while calling into a
//! connection, so event consumers may create or delete sessions freely.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::acp::connection::AcpConnection;
use crate::acp::spawner::ProcessSpawner;
use crate::models::session::LogicalSession;
use crate::{AppError, GlobalConfig, Result};

struct Entry {
    session: LogicalSession,
    seq: u64,
    connection: AcpConnection,
}

impl Entry {
    fn snapshot(&self) -> LogicalSession {
        let mut session = self.session.clone();
        session.status = self.connection.status().session_status();
        session
    }
}

#[derive(Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    active: Option<String>,
    next_seq: u64,
}

impl Registry {
    /// Most recently created session id.
    fn newest(&self) -> Option<String> {
        self.entries
            .values()
            .max_by_key(|e| (e.session.created_at, e.seq))
            .map(|e| e.session.id.clone())
    }
}

/// Owns every logical session and its connection.
pub struct SessionManager {
    config: GlobalConfig,
    spawner: Arc<dyn ProcessSpawner>,
    shutdown: CancellationToken,
    registry: RwLock<Registry>,
}

impl SessionManager {
    /// Create an empty manager.
    ///
    /// Cancelling `shutdown` disables retries on every connection; prefer
    /// [`SessionManager::shutdown`], which also disconnects them.
    #[must_use]
    pub fn new(
        config: GlobalConfig,
        spawner: Arc<dyn ProcessSpawner>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            spawner,
            shutdown,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Register a new logical session and make it active.
    ///
    /// No agent process is started until the connection is first used.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shutdown` once [`SessionManager::shutdown`] has run.
    pub async fn create_session(&self, label: Option<String>) -> Result<LogicalSession> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::Shutdown(
                "cannot create sessions during shutdown".into(),
            ));
        }

        let mut registry = self.registry.write().await;
        registry.next_seq += 1;
        let seq = registry.next_seq;

        let label = label.unwrap_or_else(|| format!("session {seq}"));
        let session = LogicalSession::new(label);
        let connection = AcpConnection::new(
            session.id.clone(),
            &self.config,
            Arc::clone(&self.spawner),
            self.shutdown.clone(),
        );

        info!(
            session_id = session.id.as_str(),
            label = session.label.as_str(),
            "session created"
        );
        registry.active = Some(session.id.clone());
        registry.entries.insert(
            session.id.clone(),
            Entry {
                session: session.clone(),
                seq,
                connection,
            },
        );
        Ok(session)
    }

    /// Connection owned by session `id`.
    pub async fn get_connection(&self, id: &str) -> Option<AcpConnection> {
        self.registry
            .read()
            .await
            .entries
            .get(id)
            .map(|e| e.connection.clone())
    }

    /// Session `id` with its current status.
    pub async fn get_session(&self, id: &str) -> Option<LogicalSession> {
        self.registry.read().await.entries.get(id).map(Entry::snapshot)
    }

    /// Remove session `id` and close its connection.
    ///
    /// Pending requests on the connection fail, and clones of the connection
    /// still held elsewhere can no longer start an agent. If the session was
    /// active, the most recently created remaining session becomes active.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such session exists.
    pub async fn delete_session(&self, id: &str) -> Result<()> {
        let entry = {
            let mut registry = self.registry.write().await;
            let entry = registry
                .entries
                .remove(id)
                .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;
            if registry.active.as_deref() == Some(id) {
                registry.active = registry.newest();
            }
            entry
        };

        entry
            .connection
            .close()
            .instrument(info_span!("delete_session", session_id = id))
            .await;
        info!(session_id = id, "session deleted");
        Ok(())
    }

    /// Make session `id` the active one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no such session exists.
    pub async fn switch_session(&self, id: &str) -> Result<LogicalSession> {
        let mut registry = self.registry.write().await;
        let session = registry
            .entries
            .get(id)
            .map(Entry::snapshot)
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;
        registry.active = Some(id.to_owned());
        info!(session_id = id, "session switched");
        Ok(session)
    }

    /// All sessions, most recently created first.
    pub async fn list_sessions(&self) -> Vec<LogicalSession> {
        let registry = self.registry.read().await;
        let mut entries: Vec<&Entry> = registry.entries.values().collect();
        entries.sort_by_key(|e| Reverse((e.session.created_at, e.seq)));
        entries.into_iter().map(Entry::snapshot).collect()
    }

    /// Currently active session, if any.
    pub async fn active_session(&self) -> Option<LogicalSession> {
        let registry = self.registry.read().await;
        let id = registry.active.as_deref()?;
        registry.entries.get(id).map(Entry::snapshot)
    }

    /// Active session id and its connection, if any.
    pub async fn active_connection(&self) -> Option<(String, AcpConnection)> {
        let registry = self.registry.read().await;
        let id = registry.active.clone()?;
        let connection = registry.entries.get(&id)?.connection.clone();
        Some((id, connection))
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Disable all retries, then close and drop every session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let entries: Vec<Entry> = {
            let mut registry = self.registry.write().await;
            registry.active = None;
            registry.entries.drain().map(|(_, e)| e).collect()
        };

        info!(sessions = entries.len(), "shutting down sessions");
        join_all(entries.iter().map(|e| e.connection.close())).await;
    }
}
