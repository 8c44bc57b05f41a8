//! Session worker: the single owner of a client's merge box.

use crate::merge::MergeBox;
use crate::protocol::{ErrorPayload, ServerMessage, Transport};
use crate::types::{ClientId, DocumentId, FieldDiff, Fields, RunKey, SubscriptionId};
use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Work for the session worker. Applied strictly in arrival order.
pub(crate) enum Command {
    /// A run starts; its mutations are accepted from now on.
    Activate(RunKey),
    Added {
        run: RunKey,
        collection: String,
        id: DocumentId,
        fields: Fields,
    },
    Changed {
        run: RunKey,
        collection: String,
        id: DocumentId,
        diff: FieldDiff,
    },
    Removed {
        run: RunKey,
        collection: String,
        id: DocumentId,
    },
    Ready(RunKey),
    /// A run ends; retract all its edges as one batch.
    Retire(RunKey),
    Nosub {
        sub: SubscriptionId,
        error: Option<ErrorPayload>,
    },
    /// Run a closure against the merge box; doubles as a barrier.
    Inspect(Box<dyn FnOnce(&MergeBox) + Send>),
    Shutdown,
}

pub(crate) struct Worker {
    client: ClientId,
    merge: MergeBox,
    /// Current generation per subscription with an active run.
    live: HashMap<SubscriptionId, u64>,
    transport: Box<dyn Transport>,
    connected: Arc<AtomicBool>,
    on_disconnect: Option<Box<dyn FnOnce() + Send>>,
}

impl Worker {
    pub(crate) fn new(
        client: ClientId,
        transport: Box<dyn Transport>,
        connected: Arc<AtomicBool>,
        on_disconnect: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            client,
            merge: MergeBox::new(),
            live: HashMap::new(),
            transport,
            connected,
            on_disconnect: Some(on_disconnect),
        }
    }

    pub(crate) fn run(mut self, commands: Receiver<Command>) {
        tracing::debug!(client = %self.client, "session worker started");
        while let Ok(command) = commands.recv() {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.handle(command);
        }
        tracing::debug!(client = %self.client, "session worker exiting");
    }

    fn handle(&mut self, command: Command) {
        let mut out = Vec::new();

        match command {
            Command::Activate(run) => {
                if self.connected.load(Ordering::SeqCst) {
                    self.live.insert(run.subscription, run.generation);
                }
            }
            Command::Added {
                run,
                collection,
                id,
                fields,
            } => {
                if self.accepts(run) {
                    if let Err(err) = self.merge.assert(run.subscription, &collection, id, fields, &mut out) {
                        tracing::warn!(client = %self.client, %err, "merge box rejected added");
                    }
                }
            }
            Command::Changed {
                run,
                collection,
                id,
                diff,
            } => {
                if self.accepts(run) {
                    if let Err(err) = self.merge.update(run.subscription, &collection, id, &diff, &mut out) {
                        tracing::warn!(client = %self.client, %err, "merge box rejected changed");
                    }
                }
            }
            Command::Removed {
                run,
                collection,
                id,
            } => {
                if self.accepts(run) {
                    self.merge.retract(run.subscription, &collection, id, &mut out);
                }
            }
            Command::Ready(run) => {
                if self.accepts(run) {
                    out.push(ServerMessage::Ready {
                        subs: vec![run.subscription],
                    });
                }
            }
            Command::Retire(run) => {
                if self.accepts(run) {
                    self.live.remove(&run.subscription);
                    self.merge.teardown(run.subscription, &mut out);
                }
            }
            Command::Nosub { sub, error } => {
                out.push(ServerMessage::Nosub { id: sub, error });
            }
            Command::Inspect(f) => f(&self.merge),
            Command::Shutdown => {}
        }

        self.deliver(out);
    }

    /// Whether mutations from `run` still apply.
    fn accepts(&self, run: RunKey) -> bool {
        let live = self.live.get(&run.subscription) == Some(&run.generation);
        if !live {
            tracing::trace!(client = %self.client, ?run, "dropping command from retired run");
        }
        live
    }

    fn deliver(&mut self, out: Vec<ServerMessage>) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        for message in out {
            if let Err(err) = self.transport.send(message) {
                tracing::warn!(client = %self.client, %err, "transport failed, disconnecting");
                self.disconnect();
                return;
            }
        }
    }

    fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.merge.clear();
        self.live.clear();
        if let Some(on_disconnect) = self.on_disconnect.take() {
            on_disconnect();
        }
    }
}
