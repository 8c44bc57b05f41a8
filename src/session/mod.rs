//! Per-client session.
//!
//! A session owns one worker thread that holds the client's [`MergeBox`].
//! Publication contexts on any thread send it commands over a channel, so
//! merge mutations for one client are applied one at a time in a single
//! total order, without a lock visible to publish handlers.

mod worker;

pub(crate) use worker::Command;

use crate::error::{Result, SyncError};
use crate::merge::MergeBox;
use crate::protocol::Transport;
use crate::publication::HandlerRegistry;
use crate::subscriptions::{StopCause, SubscriptionHandle, SubscriptionManager};
use crate::types::{ClientId, DocumentId, Fields, SubscriptionId, UserId};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use worker::Worker;

/// Session configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Prefix of the worker thread name; the client id is appended.
    pub worker_name_prefix: String,

    /// How long `flush` and introspection calls wait for the worker.
    /// Default: 5s
    pub flush_timeout: Duration,

    /// Rerun live subscriptions when the calling identity changes.
    pub rerun_on_identity_change: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            worker_name_prefix: "livesync-session".to_string(),
            flush_timeout: Duration::from_secs(5),
            rerun_on_identity_change: true,
        }
    }
}

/// One connected client.
pub struct Session {
    id: ClientId,
    config: SessionConfig,
    manager: Arc<SubscriptionManager>,
    commands: Sender<Command>,
    connected: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start a session delivering to `transport`.
    pub fn start(
        id: ClientId,
        handlers: Arc<HandlerRegistry>,
        transport: Box<dyn Transport>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        let (commands, receiver) = unbounded();
        let connected = Arc::new(AtomicBool::new(true));
        let manager = SubscriptionManager::new(id, handlers, commands.clone(), &config);

        // Runs on the worker thread once the transport fails.
        let weak_manager = Arc::downgrade(&manager);
        let on_disconnect = Box::new(move || {
            if let Some(manager) = weak_manager.upgrade() {
                manager.stop_all(StopCause::Disconnected);
            }
        });

        let worker = Worker::new(id, transport, Arc::clone(&connected), on_disconnect);
        let handle = thread::Builder::new()
            .name(format!("{}-{}", config.worker_name_prefix, id))
            .spawn(move || worker.run(receiver))
            .map_err(|e| SyncError::WorkerSpawn(e.to_string()))?;

        tracing::debug!(client = %id, "session opened");

        Ok(Arc::new(Self {
            id,
            config,
            manager,
            commands,
            connected,
            worker: Mutex::new(Some(handle)),
        }))
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// False once the transport failed or the session was closed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    // --- Subscriptions ---

    /// Subscribe to a publication with positional parameters.
    pub fn subscribe(&self, name: &str, params: Vec<Value>) -> Result<SubscriptionHandle> {
        if !self.is_connected() {
            return Err(SyncError::TransportDisconnect);
        }
        self.manager.subscribe(name, params)
    }

    pub fn subscription_count(&self) -> usize {
        self.manager.subscription_count()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionHandle> {
        self.manager.subscriptions()
    }

    pub fn identity(&self) -> Option<UserId> {
        self.manager.identity()
    }

    /// Change the calling identity; live subscriptions rerun on this thread.
    pub fn set_identity(&self, identity: Option<UserId>) {
        self.manager.set_identity(identity);
    }

    // --- Worker Access ---

    /// Wait until everything sent so far has been applied and delivered.
    pub fn flush(&self) -> Result<()> {
        self.inspect(|_| ())
    }

    /// Merged fields the client currently holds for a document.
    pub fn document(&self, collection: &str, id: impl Into<DocumentId>) -> Result<Option<Fields>> {
        let collection = collection.to_string();
        let id = id.into();
        self.inspect(move |merge| merge.document(&collection, &id).cloned())
    }

    /// Number of subscriptions asserting a document.
    pub fn refcount(&self, collection: &str, id: impl Into<DocumentId>) -> Result<usize> {
        let collection = collection.to_string();
        let id = id.into();
        self.inspect(move |merge| merge.refcount(&collection, &id))
    }

    /// Number of interest edges a subscription holds.
    pub fn edge_count(&self, sub: SubscriptionId) -> Result<usize> {
        self.inspect(move |merge| merge.edge_count(sub))
    }

    fn inspect<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&MergeBox) -> T + Send + 'static,
    {
        let (reply, response) = bounded(1);
        self.commands
            .send(Command::Inspect(Box::new(move |merge| {
                let _ = reply.send(f(merge));
            })))
            .map_err(|_| SyncError::SessionClosed)?;

        response
            .recv_timeout(self.config.flush_timeout)
            .map_err(|e| match e {
                RecvTimeoutError::Timeout => SyncError::FlushTimeout,
                RecvTimeoutError::Disconnected => SyncError::SessionClosed,
            })
    }

    // --- Teardown ---

    /// Disconnect: stop every subscription and shut the worker down.
    pub fn close(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };

        self.manager.stop_all(StopCause::Disconnected);
        let _ = self.commands.send(Command::Shutdown);
        self.connected.store(false, Ordering::SeqCst);

        if handle.thread().id() != thread::current().id() && handle.join().is_err() {
            tracing::warn!(client = %self.id, "session worker panicked");
        }
        tracing::debug!(client = %self.id, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
