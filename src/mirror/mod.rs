//! Client-side mirror of the merged document stream.
//!
//! The mirror applies `added`/`changed`/`removed` messages per collection.
//! Messages for a collection that has not been declared yet are buffered in
//! arrival order and replayed when it is declared. `ready` messages flip a
//! per-subscription flag.
//!
//! # Example
//!
//! ```ignore
//! let mut mirror = ClientMirror::new();
//! mirror.drain(&receiver)?;            // "posts" arrives before it is declared
//! mirror.declare_collection("posts")?; // buffered messages are replayed
//! let post = mirror.document("posts", &"p1".into());
//! ```

mod collection;

pub use collection::LocalCollection;

use crate::error::{Result, SyncError};
use crate::protocol::{ErrorPayload, ServerMessage};
use crate::types::{apply_diff, DocumentId, FieldDiff, Fields, SubscriptionId};
use crossbeam_channel::Receiver;
use std::collections::{HashMap, HashSet};

/// Mirror configuration.
#[derive(Clone, Debug)]
pub struct MirrorConfig {
    /// Max messages buffered per undeclared collection (None = unbounded).
    pub max_buffered_per_collection: Option<usize>,

    /// Reject `added` for present documents and `changed`/`removed` for
    /// missing ones. When false these are tolerated.
    pub strict: bool,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            max_buffered_per_collection: None,
            strict: true,
        }
    }
}

/// Client-side document store fed by a session's message stream.
#[derive(Debug, Default)]
pub struct ClientMirror {
    config: MirrorConfig,
    collections: HashMap<String, LocalCollection>,
    /// Messages for undeclared collections, in arrival order.
    pending: HashMap<String, Vec<ServerMessage>>,
    ready: HashSet<SubscriptionId>,
    stopped: HashMap<SubscriptionId, Option<ErrorPayload>>,
}

impl ClientMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MirrorConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    // --- Collections ---

    /// Declare a collection and replay anything buffered for it.
    ///
    /// Returns the number of replayed messages. Declaring twice is a no-op.
    /// Every buffered message is applied even if one is rejected; the first
    /// rejection is returned afterwards.
    pub fn declare_collection(&mut self, name: &str) -> Result<usize> {
        if self.collections.contains_key(name) {
            return Ok(0);
        }
        self.collections
            .insert(name.to_string(), LocalCollection::new(name));

        let buffered = self.pending.remove(name).unwrap_or_default();
        let count = buffered.len();
        let mut first_error = None;
        for message in buffered {
            if let Err(err) = self.apply_document(message) {
                tracing::warn!(collection = name, %err, "buffered message rejected on replay");
                first_error.get_or_insert(err);
            }
        }
        if count > 0 {
            tracing::debug!(collection = name, count, "replayed buffered messages");
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn collection(&self, name: &str) -> Option<&LocalCollection> {
        self.collections.get(name)
    }

    pub fn document(&self, collection: &str, id: &DocumentId) -> Option<&Fields> {
        self.collections.get(collection)?.get(id)
    }

    /// Messages waiting for `collection` to be declared.
    pub fn pending_count(&self, collection: &str) -> usize {
        self.pending.get(collection).map(|p| p.len()).unwrap_or(0)
    }

    // --- Subscriptions ---

    /// Ready and not stopped since.
    pub fn is_ready(&self, sub: SubscriptionId) -> bool {
        self.ready.contains(&sub)
    }

    pub fn is_stopped(&self, sub: SubscriptionId) -> bool {
        self.stopped.contains_key(&sub)
    }

    /// Error a subscription stopped with, if it stopped with one.
    pub fn stop_error(&self, sub: SubscriptionId) -> Option<&ErrorPayload> {
        self.stopped.get(&sub).and_then(|e| e.as_ref())
    }

    // --- Applying ---

    pub fn apply(&mut self, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Ready { subs } => {
                self.ready.extend(subs);
                Ok(())
            }
            ServerMessage::Nosub { id, error } => {
                self.ready.remove(&id);
                self.stopped.insert(id, error);
                Ok(())
            }
            document => {
                let Some(collection) = document.collection() else {
                    return Ok(());
                };
                if self.collections.contains_key(collection) {
                    self.apply_document(document)
                } else {
                    self.buffer(document)
                }
            }
        }
    }

    pub fn apply_all(&mut self, messages: impl IntoIterator<Item = ServerMessage>) -> Result<()> {
        for message in messages {
            self.apply(message)?;
        }
        Ok(())
    }

    /// Apply everything currently queued on `receiver` without blocking.
    pub fn drain(&mut self, receiver: &Receiver<ServerMessage>) -> Result<usize> {
        let mut count = 0;
        while let Ok(message) = receiver.try_recv() {
            self.apply(message)?;
            count += 1;
        }
        Ok(count)
    }

    fn buffer(&mut self, message: ServerMessage) -> Result<()> {
        let collection = message.collection().unwrap_or_default().to_string();
        let queue = self.pending.entry(collection.clone()).or_default();
        if let Some(max) = self.config.max_buffered_per_collection {
            if queue.len() >= max {
                return Err(SyncError::Mirror(format!(
                    "buffer full for undeclared collection {}",
                    collection
                )));
            }
        }
        queue.push(message);
        Ok(())
    }

    fn apply_document(&mut self, message: ServerMessage) -> Result<()> {
        let strict = self.config.strict;
        match message {
            ServerMessage::Added {
                collection,
                id,
                fields,
            } => {
                let local = self.local_mut(&collection)?;
                if local.contains(&id) && strict {
                    return Err(SyncError::DocumentExists { collection, id });
                }
                local.documents_mut().insert(id, fields);
            }
            ServerMessage::Changed {
                collection,
                id,
                fields,
                cleared,
            } => {
                let local = self.local_mut(&collection)?;
                match local.documents_mut().get_mut(&id) {
                    Some(doc) => apply_diff(doc, &changed_to_diff(fields, cleared)),
                    None if strict => {
                        return Err(SyncError::DocumentNotFound { collection, id });
                    }
                    None => {}
                }
            }
            ServerMessage::Removed { collection, id } => {
                let local = self.local_mut(&collection)?;
                if local.documents_mut().remove(&id).is_none() && strict {
                    return Err(SyncError::DocumentNotFound { collection, id });
                }
            }
            ServerMessage::Ready { .. } | ServerMessage::Nosub { .. } => {}
        }
        Ok(())
    }

    fn local_mut(&mut self, collection: &str) -> Result<&mut LocalCollection> {
        self.collections
            .get_mut(collection)
            .ok_or_else(|| SyncError::Mirror(format!("collection {} not declared", collection)))
    }
}

/// Rebuild a field diff from a `changed` message.
pub fn changed_to_diff(fields: Fields, cleared: Vec<String>) -> FieldDiff {
    let mut diff: FieldDiff = fields.into_iter().map(|(k, v)| (k, Some(v))).collect();
    diff.extend(cleared.into_iter().map(|k| (k, None)));
    diff
}
