//! Observer adapter between a query engine and a publication.
//!
//! A [`Cursor`] is a declarative record set over one collection. Observing it
//! yields `added`/`changed`/`removed` callbacks; all `added` calls of the
//! initial snapshot happen before `observe_changes` returns.

use super::context::PublicationContext;
use crate::error::{Result, SyncError};
use crate::types::{DocumentId, FieldDiff, Fields};
use std::collections::HashSet;
use std::sync::Arc;

/// Receiver of change events for one observed record set.
pub trait Observer: Send + Sync {
    fn added(&self, id: DocumentId, fields: Fields);
    fn changed(&self, id: DocumentId, diff: FieldDiff);
    fn removed(&self, id: DocumentId);
}

/// A live observation. After `stop` no further callbacks are made.
///
/// Stopping does not emit synthetic `removed` events.
pub trait ObserveHandle: Send {
    fn stop(&mut self);
}

/// Subscribable record set over one collection, provided by a query engine.
pub trait Cursor: Send {
    fn collection_name(&self) -> &str;

    /// Start observing. May be called repeatedly; each call is independent.
    fn observe_changes(&self, observer: Arc<dyn Observer>) -> Result<Box<dyn ObserveHandle>>;
}

/// Forwards one cursor's events into a publication context.
struct CursorObserver {
    ctx: PublicationContext,
    collection: String,
}

impl Observer for CursorObserver {
    fn added(&self, id: DocumentId, fields: Fields) {
        // Errors already stopped the subscription.
        let _ = self.ctx.added(&self.collection, id, fields);
    }

    fn changed(&self, id: DocumentId, diff: FieldDiff) {
        let _ = self.ctx.changed(&self.collection, id, diff);
    }

    fn removed(&self, id: DocumentId) {
        self.ctx.removed(&self.collection, id);
    }
}

/// Observe every cursor, then mark the context ready.
pub(crate) fn publish_cursors(ctx: &PublicationContext, cursors: Vec<Box<dyn Cursor>>) -> Result<()> {
    let mut seen = HashSet::new();
    for cursor in &cursors {
        if !seen.insert(cursor.collection_name().to_string()) {
            return Err(SyncError::DuplicateCursorCollection(
                cursor.collection_name().to_string(),
            ));
        }
    }

    for cursor in cursors {
        let observer = Arc::new(CursorObserver {
            ctx: ctx.clone(),
            collection: cursor.collection_name().to_string(),
        });
        let mut handle = cursor.observe_changes(observer)?;
        ctx.on_stop(move || handle.stop());
    }

    ctx.ready();
    Ok(())
}
