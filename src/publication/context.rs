//! The per-run object a publish handler talks to.

use crate::error::{HandlerError, Result, SyncError};
use crate::session::Command;
use crate::subscriptions::SubscriptionManager;
use crate::types::{DocumentId, FieldDiff, Fields, RunKey, SubscriptionId, UserId};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

/// Cleanup registered through [`PublicationContext::on_stop`].
pub type StopCallback = Box<dyn FnOnce() + Send>;

/// Handle given to a publish handler for one run of one subscription.
///
/// Cheap to clone; clones share the same run. Once the run is deactivated
/// (subscription stopped or rerun) every mutation becomes a no-op, so late
/// events from adapters cannot leak past teardown.
#[derive(Clone)]
pub struct PublicationContext {
    run: Arc<RunState>,
}

struct RunState {
    key: RunKey,
    name: String,
    identity: Option<UserId>,
    commands: Sender<Command>,
    manager: Weak<SubscriptionManager>,
    inner: Mutex<RunInner>,
}

#[derive(Default)]
struct RunInner {
    /// Edges asserted by this run, per collection.
    documents: HashMap<String, HashSet<DocumentId>>,
    ready: bool,
    deactivated: bool,
    stop_callbacks: Vec<StopCallback>,
}

impl PublicationContext {
    pub(crate) fn new(
        key: RunKey,
        name: String,
        identity: Option<UserId>,
        commands: Sender<Command>,
        manager: Weak<SubscriptionManager>,
    ) -> Self {
        Self {
            run: Arc::new(RunState {
                key,
                name,
                identity,
                commands,
                manager,
                inner: Mutex::new(RunInner::default()),
            }),
        }
    }

    pub fn subscription_id(&self) -> SubscriptionId {
        self.run.key.subscription
    }

    /// Name of the publication being served.
    pub fn name(&self) -> &str {
        &self.run.name
    }

    /// Who is asking. Constant for the lifetime of this run.
    pub fn identity(&self) -> Option<&UserId> {
        self.run.identity.as_ref()
    }

    pub(crate) fn key(&self) -> RunKey {
        self.run.key
    }

    // --- Mutations ---

    /// Assert a document with its initial fields.
    ///
    /// Fails with [`SyncError::DuplicateAdd`] if this subscription already
    /// asserts the document; the subscription is then stopped with that error.
    pub fn added(&self, collection: &str, id: impl Into<DocumentId>, fields: Fields) -> Result<()> {
        let id = id.into();
        {
            let mut inner = self.run.inner.lock();
            if inner.deactivated {
                tracing::trace!(key = ?self.run.key, collection, %id, "dropping added on inactive run");
                return Ok(());
            }
            let ids = inner.documents.entry(collection.to_string()).or_default();
            if ids.insert(id.clone()) {
                self.send(Command::Added {
                    run: self.run.key,
                    collection: collection.to_string(),
                    id,
                    fields,
                });
                return Ok(());
            }
        }

        self.fail(SyncError::DuplicateAdd {
            collection: collection.to_string(),
            id,
        })
    }

    /// Change fields of a document this subscription asserts.
    ///
    /// A `None` entry clears the field. Fails with
    /// [`SyncError::UnknownDocument`] if the document is not asserted.
    pub fn changed(&self, collection: &str, id: impl Into<DocumentId>, diff: FieldDiff) -> Result<()> {
        let id = id.into();
        {
            let inner = self.run.inner.lock();
            if inner.deactivated {
                return Ok(());
            }
            let known = inner
                .documents
                .get(collection)
                .is_some_and(|ids| ids.contains(&id));
            if known {
                if !diff.is_empty() {
                    self.send(Command::Changed {
                        run: self.run.key,
                        collection: collection.to_string(),
                        id,
                        diff,
                    });
                }
                return Ok(());
            }
        }

        self.fail(SyncError::UnknownDocument {
            collection: collection.to_string(),
            id,
        })
    }

    /// Retract a document. Retracting something not asserted is a no-op.
    pub fn removed(&self, collection: &str, id: impl Into<DocumentId>) {
        let id = id.into();
        let mut inner = self.run.inner.lock();
        if inner.deactivated {
            return;
        }
        let removed = inner
            .documents
            .get_mut(collection)
            .is_some_and(|ids| ids.remove(&id));
        if removed {
            self.send(Command::Removed {
                run: self.run.key,
                collection: collection.to_string(),
                id,
            });
        }
    }

    /// Signal that the initial record set is fully asserted. Idempotent.
    pub fn ready(&self) {
        {
            let mut inner = self.run.inner.lock();
            if inner.deactivated || inner.ready {
                return;
            }
            inner.ready = true;
            self.send(Command::Ready(self.run.key));
        }
        if let Some(manager) = self.run.manager.upgrade() {
            manager.mark_ready(self.run.key);
        }
    }

    /// Register cleanup to run once when this run ends.
    ///
    /// Callbacks run in registration order. Registering on a run that has
    /// already ended runs the callback immediately.
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) {
        let mut inner = self.run.inner.lock();
        if inner.deactivated {
            drop(inner);
            run_stop_callbacks(vec![Box::new(callback)]);
            return;
        }
        inner.stop_callbacks.push(Box::new(callback));
    }

    /// Stop this subscription without an error.
    pub fn stop(&self) {
        if let Some(manager) = self.run.manager.upgrade() {
            manager.stop_run(self.run.key, None);
        }
    }

    /// Stop this subscription, reporting `error` to the client.
    pub fn error(&self, error: HandlerError) {
        if let Some(manager) = self.run.manager.upgrade() {
            manager.stop_run(self.run.key, Some(SyncError::HandlerExecution(error)));
        }
    }

    pub fn is_ready(&self) -> bool {
        self.run.inner.lock().ready
    }

    /// True once this run has been deactivated.
    pub fn is_stopped(&self) -> bool {
        self.run.inner.lock().deactivated
    }

    /// End the run: later mutations are dropped. Returns pending callbacks.
    pub(crate) fn deactivate(&self) -> Vec<StopCallback> {
        let mut inner = self.run.inner.lock();
        if inner.deactivated {
            return Vec::new();
        }
        inner.deactivated = true;
        inner.documents.clear();
        std::mem::take(&mut inner.stop_callbacks)
    }

    fn fail(&self, error: SyncError) -> Result<()> {
        tracing::warn!(key = ?self.run.key, name = %self.run.name, %error, "publish handler error");
        if let Some(manager) = self.run.manager.upgrade() {
            manager.stop_run(self.run.key, Some(error.clone()));
        }
        Err(error)
    }

    fn send(&self, command: Command) {
        if self.run.commands.send(command).is_err() {
            tracing::trace!(key = ?self.run.key, "session worker gone");
        }
    }
}

/// Run callbacks in order. A panicking callback does not stop the others.
pub(crate) fn run_stop_callbacks(callbacks: Vec<StopCallback>) {
    for callback in callbacks {
        if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
            tracing::warn!("onStop callback panicked");
        }
    }
}
