//! Per-client merge box.

use super::collection::CollectionView;
use crate::error::{Result, SyncError};
use crate::protocol::ServerMessage;
use crate::types::{DocumentId, FieldDiff, Fields, SubscriptionId};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Combines the record sets of every subscription of one client.
///
/// Not thread-safe on purpose: a session worker owns it and applies
/// mutations one at a time.
#[derive(Debug, Default)]
pub struct MergeBox {
    collections: HashMap<String, CollectionView>,
    /// Interest edges per subscription, for batched teardown.
    edges: HashMap<SubscriptionId, BTreeMap<String, BTreeSet<DocumentId>>>,
}

impl MergeBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// A subscription starts asserting a document.
    pub fn assert(
        &mut self,
        sub: SubscriptionId,
        collection: &str,
        id: DocumentId,
        fields: Fields,
        out: &mut Vec<ServerMessage>,
    ) -> Result<()> {
        let ids = self
            .edges
            .entry(sub)
            .or_default()
            .entry(collection.to_string())
            .or_default();
        if !ids.insert(id.clone()) {
            return Err(SyncError::DuplicateAdd {
                collection: collection.to_string(),
                id,
            });
        }

        tracing::trace!(%sub, collection, %id, "assert");
        self.collections
            .entry(collection.to_string())
            .or_insert_with(|| CollectionView::new(collection))
            .assert(sub, id, fields, out);
        Ok(())
    }

    /// A subscription changes fields of a document it asserts.
    pub fn update(
        &mut self,
        sub: SubscriptionId,
        collection: &str,
        id: DocumentId,
        diff: &FieldDiff,
        out: &mut Vec<ServerMessage>,
    ) -> Result<()> {
        if !self.has_edge(sub, collection, &id) {
            return Err(SyncError::UnknownDocument {
                collection: collection.to_string(),
                id,
            });
        }

        tracing::trace!(%sub, collection, %id, fields = diff.len(), "update");
        if let Some(view) = self.collections.get_mut(collection) {
            view.update(sub, id, diff, out);
        }
        Ok(())
    }

    /// A subscription stops asserting a document. Unknown edges are a no-op.
    pub fn retract(
        &mut self,
        sub: SubscriptionId,
        collection: &str,
        id: DocumentId,
        out: &mut Vec<ServerMessage>,
    ) {
        let removed = match self.edges.get_mut(&sub) {
            Some(by_collection) => {
                let removed = by_collection
                    .get_mut(collection)
                    .map(|ids| ids.remove(&id))
                    .unwrap_or(false);
                if by_collection.get(collection).is_some_and(|ids| ids.is_empty()) {
                    by_collection.remove(collection);
                }
                if by_collection.is_empty() {
                    self.edges.remove(&sub);
                }
                removed
            }
            None => false,
        };
        if !removed {
            return;
        }

        tracing::trace!(%sub, collection, %id, "retract");
        self.retract_in_view(sub, collection, id, out);
    }

    /// Retract every edge held by a subscription in one pass.
    ///
    /// Returns the number of edges retracted.
    pub fn teardown(&mut self, sub: SubscriptionId, out: &mut Vec<ServerMessage>) -> usize {
        let Some(by_collection) = self.edges.remove(&sub) else {
            return 0;
        };

        let mut count = 0;
        for (collection, ids) in by_collection {
            let Some(view) = self.collections.get_mut(&collection) else {
                continue;
            };
            count += ids.len();
            for id in ids {
                view.retract(sub, id, out);
            }
            if view.is_empty() {
                self.collections.remove(&collection);
            }
        }

        tracing::trace!(%sub, edges = count, "teardown");
        count
    }

    fn retract_in_view(
        &mut self,
        sub: SubscriptionId,
        collection: &str,
        id: DocumentId,
        out: &mut Vec<ServerMessage>,
    ) {
        if let Some(view) = self.collections.get_mut(collection) {
            view.retract(sub, id, out);
            if view.is_empty() {
                self.collections.remove(collection);
            }
        }
    }

    fn has_edge(&self, sub: SubscriptionId, collection: &str, id: &DocumentId) -> bool {
        self.edges
            .get(&sub)
            .and_then(|c| c.get(collection))
            .is_some_and(|ids| ids.contains(id))
    }

    // --- Introspection ---

    /// Merged fields the client currently holds for a document.
    pub fn document(&self, collection: &str, id: &DocumentId) -> Option<&Fields> {
        self.collections
            .get(collection)
            .and_then(|c| c.document(id))
            .map(|d| d.merged())
    }

    /// Number of subscriptions asserting a document.
    pub fn refcount(&self, collection: &str, id: &DocumentId) -> usize {
        self.collections
            .get(collection)
            .and_then(|c| c.document(id))
            .map(|d| d.refcount())
            .unwrap_or(0)
    }

    /// Number of edges a subscription holds.
    pub fn edge_count(&self, sub: SubscriptionId) -> usize {
        self.edges
            .get(&sub)
            .map(|c| c.values().map(|ids| ids.len()).sum())
            .unwrap_or(0)
    }

    /// Number of documents visible across all collections.
    pub fn document_count(&self) -> usize {
        self.collections.values().map(|c| c.len()).sum()
    }

    /// Forget all state without emitting anything.
    pub fn clear(&mut self) {
        self.collections.clear();
        self.edges.clear();
    }
}
