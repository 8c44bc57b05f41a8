//! Mutable in-memory collection with live observers.

use super::cursor::MemoryCursor;
use super::selector::Selector;
use crate::error::{Result, SyncError};
use crate::publication::Observer;
use crate::types::{apply_diff, diff_fields, DocumentId, FieldDiff, Fields};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// One registered observation of a cursor.
pub(super) struct ObserverEntry {
    pub(super) id: u64,
    selector: Selector,
    projection: Option<BTreeSet<String>>,
    observer: Arc<dyn Observer>,
    pub(super) active: AtomicBool,
}

impl ObserverEntry {
    pub(super) fn new(
        id: u64,
        selector: Selector,
        projection: Option<BTreeSet<String>>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            id,
            selector,
            projection,
            observer,
            active: AtomicBool::new(true),
        }
    }

    /// Translate a document transition into observer callbacks.
    ///
    /// `None` on either side means the document is absent.
    pub(super) fn notify(&self, id: &DocumentId, old: Option<&Fields>, new: Option<&Fields>) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }

        let was = old.filter(|f| self.selector.matches(id, f));
        let now = new.filter(|f| self.selector.matches(id, f));
        match (was, now) {
            (None, Some(now)) => self.observer.added(id.clone(), self.project(now)),
            (Some(_), None) => self.observer.removed(id.clone()),
            (Some(was), Some(now)) => {
                let diff = diff_fields(&self.project(was), &self.project(now));
                if !diff.is_empty() {
                    self.observer.changed(id.clone(), diff);
                }
            }
            (None, None) => {}
        }
    }

    fn project(&self, fields: &Fields) -> Fields {
        project(self.projection.as_ref(), fields)
    }
}

/// Keep only the projected fields. `None` keeps everything.
pub(super) fn project(projection: Option<&BTreeSet<String>>, fields: &Fields) -> Fields {
    match projection {
        None => fields.clone(),
        Some(keep) => fields
            .iter()
            .filter(|(name, _)| keep.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    }
}

pub(super) struct Shared {
    pub(super) name: String,
    pub(super) documents: Mutex<BTreeMap<DocumentId, Fields>>,
    pub(super) observers: Mutex<Vec<Arc<ObserverEntry>>>,
    pub(super) next_observer: AtomicU64,
}

impl Shared {
    /// Notify every live observer. Called with the documents lock held so
    /// observers see mutations in commit order.
    fn dispatch(&self, id: &DocumentId, old: Option<&Fields>, new: Option<&Fields>) {
        let observers = self.observers.lock().clone();
        for entry in observers {
            entry.notify(id, old, new);
        }
    }
}

/// Reference query engine: a named set of documents that cursors can
/// observe.
///
/// Cloning yields another handle to the same collection. Observer callbacks
/// run on the mutating thread and must not mutate this collection.
#[derive(Clone)]
pub struct MemoryCollection {
    pub(super) shared: Arc<Shared>,
}

impl MemoryCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                documents: Mutex::new(BTreeMap::new()),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn insert(&self, id: impl Into<DocumentId>, fields: Fields) -> Result<()> {
        let id = id.into();
        let mut documents = self.shared.documents.lock();
        if documents.contains_key(&id) {
            return Err(SyncError::DocumentExists {
                collection: self.shared.name.clone(),
                id,
            });
        }
        self.shared.dispatch(&id, None, Some(&fields));
        documents.insert(id, fields);
        Ok(())
    }

    /// Apply a field diff to an existing document.
    pub fn update(&self, id: impl Into<DocumentId>, diff: FieldDiff) -> Result<()> {
        let id = id.into();
        let mut documents = self.shared.documents.lock();
        let Some(current) = documents.get_mut(&id) else {
            return Err(SyncError::DocumentNotFound {
                collection: self.shared.name.clone(),
                id,
            });
        };

        let old = current.clone();
        apply_diff(current, &diff);
        if old != *current {
            let new = current.clone();
            self.shared.dispatch(&id, Some(&old), Some(&new));
        }
        Ok(())
    }

    /// Remove a document, returning its last fields.
    pub fn remove(&self, id: impl Into<DocumentId>) -> Result<Fields> {
        let id = id.into();
        let mut documents = self.shared.documents.lock();
        let Some(old) = documents.remove(&id) else {
            return Err(SyncError::DocumentNotFound {
                collection: self.shared.name.clone(),
                id,
            });
        };
        self.shared.dispatch(&id, Some(&old), None);
        Ok(old)
    }

    pub fn get(&self, id: &DocumentId) -> Option<Fields> {
        self.shared.documents.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.shared.documents.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.documents.lock().is_empty()
    }

    /// Cursor over the documents matching `selector`.
    pub fn find(&self, selector: Selector) -> MemoryCursor {
        MemoryCursor::new(self.clone(), selector)
    }

    /// Number of live observations.
    pub fn observer_count(&self) -> usize {
        self.shared.observers.lock().len()
    }
}

impl fmt::Debug for MemoryCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCollection")
            .field("name", &self.shared.name)
            .field("len", &self.len())
            .field("observers", &self.observer_count())
            .finish()
    }
}
