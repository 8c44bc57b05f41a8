//! Cursors and observations over a [`MemoryCollection`].

use super::collection::{project, MemoryCollection, ObserverEntry, Shared};
use super::selector::Selector;
use crate::error::Result;
use crate::publication::{Cursor, ObserveHandle, Observer};
use crate::types::{DocumentId, Fields};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// Selector plus optional field projection over one collection.
#[derive(Clone, Debug)]
pub struct MemoryCursor {
    collection: MemoryCollection,
    selector: Selector,
    projection: Option<BTreeSet<String>>,
}

impl MemoryCursor {
    pub(super) fn new(collection: MemoryCollection, selector: Selector) -> Self {
        Self {
            collection,
            selector,
            projection: None,
        }
    }

    /// Only publish the named top-level fields.
    pub fn fields(mut self, names: &[&str]) -> Self {
        self.projection = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Current matching documents, projected.
    pub fn fetch(&self) -> Vec<(DocumentId, Fields)> {
        let documents = self.collection.shared.documents.lock();
        documents
            .iter()
            .filter(|(id, fields)| self.selector.matches(id, fields))
            .map(|(id, fields)| (id.clone(), project(self.projection.as_ref(), fields)))
            .collect()
    }

    pub fn count(&self) -> usize {
        let documents = self.collection.shared.documents.lock();
        documents
            .iter()
            .filter(|(id, fields)| self.selector.matches(id, fields))
            .count()
    }
}

impl Cursor for MemoryCursor {
    fn collection_name(&self) -> &str {
        self.collection.name()
    }

    fn observe_changes(&self, observer: Arc<dyn Observer>) -> Result<Box<dyn ObserveHandle>> {
        let shared = &self.collection.shared;

        // Holding the documents lock keeps writers out until the snapshot is
        // delivered and the observer is registered.
        let documents = shared.documents.lock();
        let id = shared.next_observer.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(ObserverEntry::new(
            id,
            self.selector.clone(),
            self.projection.clone(),
            observer,
        ));
        shared.observers.lock().push(Arc::clone(&entry));

        for (doc_id, fields) in documents.iter() {
            entry.notify(doc_id, None, Some(fields));
        }
        drop(documents);

        tracing::trace!(collection = %shared.name, observer = id, "observe started");
        Ok(Box::new(MemoryObserveHandle {
            shared: Arc::downgrade(shared),
            entry,
        }))
    }
}

/// Live observation of a [`MemoryCursor`]. Stops when dropped.
pub struct MemoryObserveHandle {
    shared: Weak<Shared>,
    entry: Arc<ObserverEntry>,
}

impl ObserveHandle for MemoryObserveHandle {
    fn stop(&mut self) {
        if !self.entry.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.observers.lock().retain(|e| e.id != self.entry.id);
        }
    }
}

impl Drop for MemoryObserveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
