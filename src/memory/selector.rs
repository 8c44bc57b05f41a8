//! Document selectors for the in-memory collection.

use crate::types::{DocumentId, Fields};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Matches documents by id and by top-level field equality.
///
/// All conditions must hold. An empty selector matches everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selector {
    ids: Option<BTreeSet<DocumentId>>,
    equals: BTreeMap<String, Value>,
}

impl Selector {
    /// Match all documents.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match a single document.
    pub fn id(id: impl Into<DocumentId>) -> Self {
        Self::ids([id.into()])
    }

    /// Match any of the given documents.
    pub fn ids(ids: impl IntoIterator<Item = DocumentId>) -> Self {
        Self {
            ids: Some(ids.into_iter().collect()),
            equals: BTreeMap::new(),
        }
    }

    /// Match documents whose `field` equals `value`.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::all().and_eq(field, value)
    }

    pub fn and_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.equals.insert(field.into(), value);
        self
    }

    /// Build from a JSON object such as `{"_id": "a", "owner": "u1"}`.
    ///
    /// `_id` accepts a string or `{"$in": [..]}`; every other key is an
    /// equality test. Anything that is not an object matches everything.
    pub fn from_json(value: &Value) -> Self {
        let Value::Object(map) = value else {
            return Self::all();
        };

        let mut selector = Self::all();
        for (key, value) in map {
            if key == "_id" {
                selector.ids = Some(match value {
                    Value::Object(op) => op
                        .get("$in")
                        .and_then(Value::as_array)
                        .map(|ids| {
                            ids.iter()
                                .filter_map(Value::as_str)
                                .map(DocumentId::from)
                                .collect()
                        })
                        .unwrap_or_default(),
                    Value::String(id) => BTreeSet::from([DocumentId::from(id.as_str())]),
                    _ => BTreeSet::new(),
                });
            } else {
                selector.equals.insert(key.clone(), value.clone());
            }
        }
        selector
    }

    pub fn matches(&self, id: &DocumentId, fields: &Fields) -> bool {
        if let Some(ref ids) = self.ids {
            if !ids.contains(id) {
                return false;
            }
        }
        self.equals
            .iter()
            .all(|(field, expected)| fields.get(field) == Some(expected))
    }
}
