//! Core types for the sync layer.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Top-level field mapping of a published document.
///
/// Values are opaque: nested structure is never merged.
pub type Fields = BTreeMap<String, Value>;

/// Field-level change set. `None` clears the field.
pub type FieldDiff = BTreeMap<String, Option<Value>>;

/// Identifier of a document, unique within its collection.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        DocumentId(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        DocumentId(s)
    }
}

/// Identifier of a subscription, unique within one client session.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Identifier of a connected client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Calling identity visible to publish handlers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One handler run of a subscription.
///
/// The generation is bumped on every rerun, so commands carrying an older
/// key can be recognised as stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub subscription: SubscriptionId,
    pub generation: u64,
}

/// Apply a diff to a field mapping in place.
pub fn apply_diff(fields: &mut Fields, diff: &FieldDiff) {
    for (name, value) in diff {
        match value {
            Some(v) => {
                fields.insert(name.clone(), v.clone());
            }
            None => {
                fields.remove(name);
            }
        }
    }
}

/// Diff that turns `old` into `new`, touching only fields that differ.
pub fn diff_fields(old: &Fields, new: &Fields) -> FieldDiff {
    let mut diff = FieldDiff::new();
    for (name, value) in new {
        if old.get(name) != Some(value) {
            diff.insert(name.clone(), Some(value.clone()));
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            diff.insert(name.clone(), None);
        }
    }
    diff
}

/// Split a diff into set fields and cleared field names.
pub fn split_diff(diff: FieldDiff) -> (Fields, Vec<String>) {
    let mut set = Fields::new();
    let mut cleared = Vec::new();
    for (name, value) in diff {
        match value {
            Some(v) => {
                set.insert(name, v);
            }
            None => cleared.push(name),
        }
    }
    (set, cleared)
}

/// Build a [`Fields`] map from a JSON object. Non-objects yield an empty map.
pub fn fields_from_json(value: Value) -> Fields {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => Fields::new(),
    }
}
