//! Server tying publications and client sessions together.

use crate::error::{HandlerError, Result};
use crate::protocol::Transport;
use crate::publication::{HandlerRegistry, Publication, PublicationContext, PublishHandler};
use crate::session::{Session, SessionConfig};
use crate::types::ClientId;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Server configuration.
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// Applied to every session.
    pub session: SessionConfig,
}

/// Publish handlers plus the sessions of every connected client.
///
/// Each session is independent: its merge box, subscriptions and worker
/// belong to that client alone.
pub struct Server {
    config: ServerConfig,
    handlers: Arc<HandlerRegistry>,
    sessions: RwLock<HashMap<ClientId, Arc<Session>>>,
    next_client: AtomicU64,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(HandlerRegistry::new()),
            sessions: RwLock::new(HashMap::new()),
            next_client: AtomicU64::new(1),
        }
    }

    /// Register a publish function under `name`.
    pub fn publish<F>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&PublicationContext, &[Value]) -> std::result::Result<Publication, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.publish_handler(name, Arc::new(handler))
    }

    /// Register a publish handler object under `name`.
    pub fn publish_handler(&self, name: &str, handler: Arc<dyn PublishHandler>) -> Result<()> {
        self.handlers.register(name, handler)?;
        tracing::debug!(name, "publication registered");
        Ok(())
    }

    pub fn publications(&self) -> Vec<String> {
        self.handlers.names()
    }

    /// Accept a client delivering to `transport`.
    pub fn connect(&self, transport: impl Transport) -> Result<Arc<Session>> {
        let id = ClientId(self.next_client.fetch_add(1, Ordering::SeqCst));
        let session = Session::start(
            id,
            Arc::clone(&self.handlers),
            Box::new(transport),
            self.config.session.clone(),
        )?;
        self.sessions.write().insert(id, Arc::clone(&session));
        Ok(session)
    }

    pub fn session(&self, id: ClientId) -> Option<Arc<Session>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Close a client's session. Returns false if it was unknown.
    pub fn disconnect(&self, id: ClientId) -> bool {
        let session = self.sessions.write().remove(&id);
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Close and forget sessions whose transport has failed.
    pub fn prune_disconnected(&self) -> usize {
        let dead: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<ClientId> = sessions
                .iter()
                .filter(|(_, s)| !s.is_connected())
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &dead {
            session.close();
        }
        dead.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Close every session.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}
