//! Session Registry
//!
//! Maps session ids to live sessions. Spawning happens before the write lock
//! is taken, so a slow interpreter start never blocks concurrent lookups; only
//! the map insertion is exclusive.

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::session::{Session, SessionSummary};
use replpool_sandbox::{ShellSpawner, Spawner};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

/// Registry of interpreter sessions.
///
/// Entries are added by [`create`](Self::create) and only removed by the
/// explicit [`remove`](Self::remove) and [`shutdown`](Self::shutdown) calls.
/// Expired sessions are not evicted.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    spawner: Arc<dyn Spawner>,
    config: SessionConfig,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    /// Create a registry that spawns interpreters through a shell.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        let spawner = Arc::new(ShellSpawner::new(config.spawn_config()));
        Self::with_spawner(config, spawner)
    }

    /// Create a registry with a custom spawner.
    #[must_use]
    pub fn with_spawner(config: SessionConfig, spawner: Arc<dyn Spawner>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            spawner,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the registry configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Spawn a restricted interpreter and register it under a fresh id.
    ///
    /// Nothing is registered if the spawn fails.
    #[instrument(skip(self))]
    pub async fn create(&self) -> Result<Arc<Session>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let id = Uuid::new_v4().to_string();
        let process = self.spawner.spawn(&self.config.resource_limits()).await?;
        let session = Arc::new(Session::new(id, process, &self.config, &self.shutdown));

        {
            let mut sessions = self.sessions.write().await;
            // shutdown may have drained the map while we were spawning
            if self.shutdown.is_cancelled() {
                drop(sessions);
                session.close().await;
                return Err(Error::ShuttingDown);
            }
            sessions.insert(session.id().to_string(), Arc::clone(&session));
        }

        info!(session_id = %session.id(), pid = ?session.pid(), "Session created");
        Ok(session)
    }

    /// Look up a session by id.
    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove a session and terminate its interpreter.
    ///
    /// Returns `false` if no such session was registered.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                session.close().await;
                info!(session_id = %id, "Session removed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Summaries of all registered sessions
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|s| s.summary()).collect()
    }

    /// Number of registered sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are registered
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Cancel in-flight calls, terminate every interpreter and clear the map.
    ///
    /// Later `create` calls fail with [`Error::ShuttingDown`].
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };

        let count = drained.len();
        for session in drained {
            session.close().await;
        }
        info!(closed = count, "Session registry shut down");
    }
}
