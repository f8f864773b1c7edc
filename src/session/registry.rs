//! Sessions keyed by document.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::Result;
use crate::session::RSession;

/// Owns every live session.
///
/// At most one process exists per key. The registry lock is held across a
/// spawn, so concurrent `resolve` calls for a new key start one process.
#[derive(Debug)]
pub struct SessionRegistry {
    settings: Settings,
    sessions: Mutex<HashMap<String, Arc<RSession>>>,
}

impl SessionRegistry {
    pub fn new(settings: Settings) -> Self {
        SessionRegistry {
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Return the session for `key`, starting one if needed.
    ///
    /// The preamble is written only when a process is started. A session
    /// whose process has exited is replaced. On failure nothing is
    /// registered.
    pub async fn resolve(&self, key: &str) -> Result<Arc<RSession>> {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(key) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
            warn!(session = %key, "Interpreter exited; starting a new one");
            sessions.remove(key);
        }

        let session = Arc::new(RSession::spawn(key, &self.settings).await?);
        sessions.insert(key.to_string(), Arc::clone(&session));
        Ok(session)
    }

    /// Register a session created elsewhere, replacing (and killing) any
    /// previous session under the same key.
    pub async fn insert(&self, session: RSession) -> Arc<RSession> {
        let session = Arc::new(session);
        let previous = self
            .sessions
            .lock()
            .await
            .insert(session.key().to_string(), Arc::clone(&session));
        if let Some(previous) = previous {
            previous.kill();
        }
        session
    }

    pub async fn get(&self, key: &str) -> Option<Arc<RSession>> {
        self.sessions.lock().await.get(key).cloned()
    }

    /// Kill and forget the session for `key`.
    pub async fn kill(&self, key: &str) -> bool {
        let removed = self.sessions.lock().await.remove(key);
        match removed {
            Some(session) => {
                session.kill();
                true
            }
            None => false,
        }
    }

    /// Kill every session and empty the registry. Returns how many were removed.
    pub async fn kill_all(&self) -> usize {
        let drained: Vec<(String, Arc<RSession>)> =
            self.sessions.lock().await.drain().collect();
        for (_, session) in &drained {
            session.kill();
        }
        if !drained.is_empty() {
            info!("Stopped {} interpreter session(s)", drained.len());
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
