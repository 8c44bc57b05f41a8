//! Local copy of one collection on the client.

use crate::types::{DocumentId, Fields};
use std::collections::BTreeMap;

/// Documents of one declared collection.
#[derive(Clone, Debug, Default)]
pub struct LocalCollection {
    name: String,
    documents: BTreeMap<DocumentId, Fields>,
}

impl LocalCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, id: &DocumentId) -> Option<&Fields> {
        self.documents.get(id)
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.documents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &DocumentId> {
        self.documents.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DocumentId, &Fields)> {
        self.documents.iter()
    }

    pub(crate) fn documents_mut(&mut self) -> &mut BTreeMap<DocumentId, Fields> {
        &mut self.documents
    }
}
