//! Per-document merge of field assertions from several subscriptions.

use crate::types::{apply_diff, FieldDiff, Fields, SubscriptionId};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// One document as seen by one client.
///
/// Each contributing subscription keeps its own field mapping. `merged` is
/// what the client currently holds. For every field in `merged`, at least one
/// contributor asserts exactly that value.
#[derive(Debug, Default)]
pub struct DocumentView {
    contributors: BTreeMap<SubscriptionId, Fields>,
    merged: Fields,
}

impl DocumentView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscriptions asserting this document.
    pub fn refcount(&self) -> usize {
        self.contributors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contributors.is_empty()
    }

    pub fn has_contributor(&self, sub: SubscriptionId) -> bool {
        self.contributors.contains_key(&sub)
    }

    /// Fields currently visible to the client.
    pub fn merged(&self) -> &Fields {
        &self.merged
    }

    /// Fields asserted by one contributor.
    pub fn contribution(&self, sub: SubscriptionId) -> Option<&Fields> {
        self.contributors.get(&sub)
    }

    /// Add a contributor. Returns the change to the merged view.
    ///
    /// Caller guarantees `sub` is not already a contributor.
    pub fn assert(&mut self, sub: SubscriptionId, fields: Fields) -> FieldDiff {
        let touched: BTreeSet<String> = fields.keys().cloned().collect();
        self.contributors.insert(sub, fields);
        self.resolve(touched)
    }

    /// Apply a diff to one contributor. Returns the change to the merged view.
    ///
    /// Caller guarantees `sub` is a contributor.
    pub fn update(&mut self, sub: SubscriptionId, diff: &FieldDiff) -> FieldDiff {
        match self.contributors.get_mut(&sub) {
            Some(fields) => apply_diff(fields, diff),
            None => return FieldDiff::new(),
        }
        self.resolve(diff.keys().cloned().collect())
    }

    /// Drop a contributor. Returns the change to the merged view.
    ///
    /// When the last contributor leaves, the merged view is left untouched
    /// and an empty diff is returned; the document itself goes away.
    pub fn retract(&mut self, sub: SubscriptionId) -> FieldDiff {
        let Some(fields) = self.contributors.remove(&sub) else {
            return FieldDiff::new();
        };
        if self.contributors.is_empty() {
            return FieldDiff::new();
        }
        self.resolve(fields.into_keys().collect())
    }

    /// Recompute the merged value of each named field.
    ///
    /// A merged value survives as long as some contributor still asserts it.
    /// Otherwise the lowest contributor holding the field wins, or the field is
    /// cleared when nobody holds it.
    fn resolve(&mut self, names: BTreeSet<String>) -> FieldDiff {
        let mut diff = FieldDiff::new();

        for name in names {
            if let Some(current) = self.merged.get(&name) {
                if self.contributors.values().any(|f| f.get(&name) == Some(current)) {
                    continue;
                }
            }

            let winner: Option<Value> = self
                .contributors
                .values()
                .find_map(|f| f.get(&name))
                .cloned();

            match winner {
                Some(value) => {
                    self.merged.insert(name.clone(), value.clone());
                    diff.insert(name, Some(value));
                }
                None => {
                    if self.merged.remove(&name).is_some() {
                        diff.insert(name, None);
                    }
                }
            }
        }

        diff
    }
}
