//! Per-collection slice of a client's merged view.

use super::document::DocumentView;
use crate::protocol::ServerMessage;
use crate::types::{split_diff, DocumentId, FieldDiff, Fields, SubscriptionId};
use std::collections::HashMap;

/// All documents of one collection that a client can currently see.
#[derive(Debug)]
pub struct CollectionView {
    name: String,
    documents: HashMap<DocumentId, DocumentView>,
}

impl CollectionView {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn document(&self, id: &DocumentId) -> Option<&DocumentView> {
        self.documents.get(id)
    }

    /// `sub` starts asserting `id`; emits `added` for a new document,
    /// otherwise `changed` for the fields that moved.
    pub fn assert(
        &mut self,
        sub: SubscriptionId,
        id: DocumentId,
        fields: Fields,
        out: &mut Vec<ServerMessage>,
    ) {
        match self.documents.get_mut(&id) {
            Some(doc) => {
                let diff = doc.assert(sub, fields);
                self.push_changed(id, diff, out);
            }
            None => {
                let mut doc = DocumentView::new();
                doc.assert(sub, fields);
                out.push(ServerMessage::Added {
                    collection: self.name.clone(),
                    id: id.clone(),
                    fields: doc.merged().clone(),
                });
                self.documents.insert(id, doc);
            }
        }
    }

    /// Apply `sub`'s field diff and emit what changed in the merged view.
    pub fn update(
        &mut self,
        sub: SubscriptionId,
        id: DocumentId,
        diff: &FieldDiff,
        out: &mut Vec<ServerMessage>,
    ) {
        if let Some(doc) = self.documents.get_mut(&id) {
            let merged = doc.update(sub, diff);
            self.push_changed(id, merged, out);
        }
    }

    /// `sub` stops asserting `id`; emits `removed` when nobody holds it.
    pub fn retract(&mut self, sub: SubscriptionId, id: DocumentId, out: &mut Vec<ServerMessage>) {
        let Some(doc) = self.documents.get_mut(&id) else {
            return;
        };
        let diff = doc.retract(sub);
        if doc.is_empty() {
            self.documents.remove(&id);
            out.push(ServerMessage::Removed {
                collection: self.name.clone(),
                id,
            });
        } else {
            self.push_changed(id, diff, out);
        }
    }

    fn push_changed(&self, id: DocumentId, diff: FieldDiff, out: &mut Vec<ServerMessage>) {
        if diff.is_empty() {
            return;
        }
        let (fields, cleared) = split_diff(diff);
        out.push(ServerMessage::Changed {
            collection: self.name.clone(),
            id,
            fields,
            cleared,
        });
    }
}
