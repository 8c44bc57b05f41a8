//! Per-client subscription registry and lifecycle driver.

use crate::error::{Result, SyncError};
use crate::publication::{run_handler, run_stop_callbacks, HandlerRegistry, PublicationContext};
use crate::session::{Command, SessionConfig};
use crate::types::{ClientId, RunKey, SubscriptionId, UserId};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::types::{StopCause, SubscriptionEntry, SubscriptionHandle, SubscriptionState};

/// Active subscriptions by ID, plus a name index for deduplication.
#[derive(Default)]
struct Registry {
    subscriptions: HashMap<SubscriptionId, Arc<SubscriptionEntry>>,
    by_name: HashMap<String, Vec<SubscriptionId>>,
    closed: bool,
}

impl Registry {
    /// An active subscription with this name and structurally equal params.
    fn find(&self, name: &str, params: &[Value]) -> Option<Arc<SubscriptionEntry>> {
        self.by_name
            .get(name)?
            .iter()
            .filter_map(|id| self.subscriptions.get(id))
            .find(|entry| entry.matches(name, params) && entry.state().is_active())
            .cloned()
    }

    fn insert(&mut self, entry: Arc<SubscriptionEntry>) {
        self.by_name
            .entry(entry.name.clone())
            .or_default()
            .push(entry.id);
        self.subscriptions.insert(entry.id, entry);
    }

    fn remove(&mut self, id: SubscriptionId) {
        let Some(entry) = self.subscriptions.remove(&id) else {
            return;
        };
        if let Some(ids) = self.by_name.get_mut(&entry.name) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_name.remove(&entry.name);
            }
        }
    }
}

/// Drives every subscription of one client.
///
/// Handlers run on the thread that caused them to run (subscribe, identity
/// change). Merge mutations only go out as [`Command`]s to the session worker.
pub struct SubscriptionManager {
    client: ClientId,
    handlers: Arc<HandlerRegistry>,
    commands: Sender<Command>,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    /// Ambient identity and its version stamp, updated together.
    identity: RwLock<(Option<UserId>, u64)>,
    rerun_on_identity_change: bool,
    weak_self: Weak<SubscriptionManager>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        client: ClientId,
        handlers: Arc<HandlerRegistry>,
        commands: Sender<Command>,
        config: &SessionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            client,
            handlers,
            commands,
            registry: Mutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            identity: RwLock::new((None, 0)),
            rerun_on_identity_change: config.rerun_on_identity_change,
            weak_self: weak_self.clone(),
        })
    }

    /// Subscribe to a publication.
    ///
    /// A request matching an active subscription returns that subscription
    /// instead of starting a new one.
    pub fn subscribe(&self, name: &str, params: Vec<Value>) -> Result<SubscriptionHandle> {
        let entry = {
            let mut registry = self.registry.lock();
            if registry.closed {
                return Err(SyncError::SessionClosed);
            }
            if let Some(existing) = registry.find(name, &params) {
                tracing::debug!(client = %self.client, sub = %existing.id, name, "subscription deduplicated");
                return Ok(self.handle(existing));
            }
            let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
            let entry = Arc::new(SubscriptionEntry::new(id, name, params));
            registry.insert(Arc::clone(&entry));
            entry
        };

        tracing::debug!(client = %self.client, sub = %entry.id, name, "subscription starting");
        self.start_run(&entry);
        Ok(self.handle(entry))
    }

    /// Number of subscriptions that have not stopped.
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().subscriptions.len()
    }

    /// Handles to every active subscription.
    pub fn subscriptions(&self) -> Vec<SubscriptionHandle> {
        let entries: Vec<_> = self.registry.lock().subscriptions.values().cloned().collect();
        entries.into_iter().map(|e| self.handle(e)).collect()
    }

    pub fn identity(&self) -> Option<UserId> {
        self.identity.read().0.clone()
    }

    /// Change the calling identity and rerun every live subscription.
    pub fn set_identity(&self, identity: Option<UserId>) {
        let version = {
            let mut current = self.identity.write();
            if current.0 == identity {
                return;
            }
            current.0 = identity;
            current.1 += 1;
            current.1
        };

        if !self.rerun_on_identity_change {
            return;
        }

        let entries: Vec<_> = self.registry.lock().subscriptions.values().cloned().collect();
        for entry in entries {
            self.rerun(&entry, version);
        }
    }

    // --- Lifecycle ---

    /// Invoke the handler for a fresh run of `entry`.
    fn start_run(&self, entry: &Arc<SubscriptionEntry>) {
        let ctx = {
            let mut status = entry.status.lock();
            if status.state == SubscriptionState::Stopped {
                // Stopped mid-rerun: the previous run is retired by now.
                let pending = status.pending_stop.take();
                drop(status);
                if let Some(cause) = pending {
                    self.notify_stopped(entry, &cause);
                }
                return;
            }
            // Read under the status lock so a concurrent identity change either
            // is seen here or sees this run as Initializing and reruns it.
            let (identity, version) = self.identity.read().clone();
            status.generation += 1;
            let key = RunKey {
                subscription: entry.id,
                generation: status.generation,
            };
            let ctx = PublicationContext::new(
                key,
                entry.name.clone(),
                identity,
                self.commands.clone(),
                self.weak_self.clone(),
            );
            status.run = Some(ctx.clone());
            status.state = SubscriptionState::Initializing;
            status.context_version = version;
            // Sent under the status lock so a concurrent stop retires after it.
            self.send(Command::Activate(key));
            ctx
        };

        let Some(handler) = self.handlers.get(&entry.name) else {
            tracing::warn!(client = %self.client, name = %entry.name, "unknown publication");
            self.stop_run(ctx.key(), Some(SyncError::PublicationNotFound(entry.name.clone())));
            return;
        };

        if let Err(err) = run_handler(handler.as_ref(), &ctx, &entry.params) {
            tracing::warn!(client = %self.client, sub = %entry.id, name = %entry.name, error = %err, "publish handler failed");
            self.stop_run(ctx.key(), Some(err));
        }
    }

    /// Retract the current run and run the handler again.
    ///
    /// Stopped subscriptions, including those stopped by an error, are
    /// never rerun.
    fn rerun(&self, entry: &Arc<SubscriptionEntry>, version: u64) {
        let previous = {
            let mut status = entry.status.lock();
            match status.state {
                SubscriptionState::Initializing | SubscriptionState::Ready => {}
                _ => return,
            }
            if status.context_version >= version {
                return;
            }
            status.state = SubscriptionState::Rerunning;
            status.run.take()
        };

        tracing::debug!(client = %self.client, sub = %entry.id, name = %entry.name, "subscription rerunning");
        if let Some(ctx) = previous {
            run_stop_callbacks(ctx.deactivate());
            self.send(Command::Retire(ctx.key()));
        }
        self.start_run(entry);
    }

    /// Record that the run `key` called `ready()`.
    pub(crate) fn mark_ready(&self, key: RunKey) {
        let Some(entry) = self.entry(key.subscription) else {
            return;
        };
        let mut status = entry.status.lock();
        if status.generation == key.generation && status.state == SubscriptionState::Initializing {
            status.state = SubscriptionState::Ready;
            tracing::debug!(client = %self.client, sub = %entry.id, "subscription ready");
        }
    }

    /// Stop the subscription owning run `key`, unless that run is stale.
    pub(crate) fn stop_run(&self, key: RunKey, error: Option<SyncError>) {
        if let Some(entry) = self.entry(key.subscription) {
            self.stop_entry(&entry, StopCause::from_error(error), Some(key.generation));
        }
    }

    /// Move a subscription to `Stopped`.
    ///
    /// Order: deactivate the run, run its onStop callbacks, retract its edges
    /// as one batch, then tell the client. During a rerun the rerunning
    /// thread owns the previous run, so the client is told once it has
    /// retired that run.
    pub(crate) fn stop_entry(
        &self,
        entry: &Arc<SubscriptionEntry>,
        cause: StopCause,
        generation: Option<u64>,
    ) {
        let run = {
            let mut status = entry.status.lock();
            if status.state == SubscriptionState::Stopped {
                return;
            }
            if generation.is_some_and(|g| g != status.generation) {
                return;
            }
            let rerunning = status.state == SubscriptionState::Rerunning;
            // The run asking to stop is the one being retired.
            if rerunning && generation.is_some() {
                return;
            }
            status.state = SubscriptionState::Stopped;
            status.error = cause.error().cloned();
            if rerunning {
                status.pending_stop = Some(cause);
                drop(status);
                self.registry.lock().remove(entry.id);
                tracing::debug!(client = %self.client, sub = %entry.id, "stop deferred until rerun retires");
                return;
            }
            status.run.take()
        };

        self.registry.lock().remove(entry.id);

        if let Some(ctx) = run {
            run_stop_callbacks(ctx.deactivate());
            self.send(Command::Retire(ctx.key()));
        }

        self.notify_stopped(entry, &cause);
    }

    /// Final step of a stop: tell the client, unless it is gone.
    fn notify_stopped(&self, entry: &SubscriptionEntry, cause: &StopCause) {
        match cause {
            StopCause::Requested => {
                tracing::debug!(client = %self.client, sub = %entry.id, "subscription stopped");
                self.send(Command::Nosub {
                    sub: entry.id,
                    error: None,
                });
            }
            StopCause::Failed(err) => {
                tracing::debug!(client = %self.client, sub = %entry.id, error = %err, "subscription stopped with error");
                self.send(Command::Nosub {
                    sub: entry.id,
                    error: Some(err.to_payload()),
                });
            }
            StopCause::Disconnected => {
                tracing::debug!(client = %self.client, sub = %entry.id, "subscription stopped on disconnect");
            }
        }
    }

    /// Stop everything and refuse new subscriptions.
    pub(crate) fn stop_all(&self, cause: StopCause) {
        let entries: Vec<_> = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            registry.subscriptions.values().cloned().collect()
        };
        for entry in entries {
            self.stop_entry(&entry, cause.clone(), None);
        }
    }

    fn entry(&self, id: SubscriptionId) -> Option<Arc<SubscriptionEntry>> {
        self.registry.lock().subscriptions.get(&id).cloned()
    }

    fn handle(&self, entry: Arc<SubscriptionEntry>) -> SubscriptionHandle {
        SubscriptionHandle {
            entry,
            manager: self.weak_self.clone(),
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::trace!(client = %self.client, "session worker gone");
        }
    }
}
