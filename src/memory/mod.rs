//! In-memory reference query engine.
//!
//! [`MemoryCollection`] is a small mutable document store whose cursors
//! implement [`Cursor`](crate::publication::Cursor). Publish handlers can
//! return them directly:
//!
//! ```ignore
//! let posts = MemoryCollection::new("posts");
//! server.publish("posts_by", move |_ctx: &PublicationContext, params: &[Value]| {
//!     Ok(Publication::cursor(
//!         posts.find(Selector::eq("owner", params[0].clone())).fields(&["title"]),
//!     ))
//! })?;
//! ```
//!
//! Observing a cursor delivers the matching documents synchronously, then
//! reports documents entering, changing within, and leaving the selector.

mod collection;
mod cursor;
mod selector;

pub use collection::MemoryCollection;
pub use cursor::{MemoryCursor, MemoryObserveHandle};
pub use selector::Selector;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::publication::{Cursor, Observer};
    use crate::types::{fields_from_json, DocumentId, FieldDiff, Fields};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum Event {
        Added(DocumentId, Fields),
        Changed(DocumentId, FieldDiff),
        Removed(DocumentId),
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl Recorder {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    impl Observer for Recorder {
        fn added(&self, id: DocumentId, fields: Fields) {
            self.0.lock().push(Event::Added(id, fields));
        }
        fn changed(&self, id: DocumentId, diff: FieldDiff) {
            self.0.lock().push(Event::Changed(id, diff));
        }
        fn removed(&self, id: DocumentId) {
            self.0.lock().push(Event::Removed(id));
        }
    }

    fn posts() -> MemoryCollection {
        let posts = MemoryCollection::new("posts");
        posts
            .insert("p1", fields_from_json(json!({"owner": "u1", "title": "a", "body": "x"})))
            .unwrap();
        posts
            .insert("p2", fields_from_json(json!({"owner": "u2", "title": "b", "body": "y"})))
            .unwrap();
        posts
    }

    #[test]
    fn test_insert_update_remove() {
        let posts = posts();
        assert_eq!(posts.len(), 2);

        let err = posts.insert("p1", Fields::new()).unwrap_err();
        assert!(matches!(err, SyncError::DocumentExists { .. }));

        let mut diff = FieldDiff::new();
        diff.insert("title".into(), Some(json!("c")));
        posts.update("p1", diff.clone()).unwrap();
        assert_eq!(posts.get(&"p1".into()).unwrap()["title"], json!("c"));

        let err = posts.update("missing", diff).unwrap_err();
        assert!(matches!(err, SyncError::DocumentNotFound { .. }));

        posts.remove("p1").unwrap();
        assert!(posts.get(&"p1".into()).is_none());
        assert!(posts.remove("p1").is_err());
    }

    #[test]
    fn test_fetch_with_projection() {
        let posts = posts();
        let cursor = posts.find(Selector::eq("owner", json!("u1"))).fields(&["title"]);

        assert_eq!(cursor.count(), 1);
        assert_eq!(
            cursor.fetch(),
            vec![("p1".into(), fields_from_json(json!({"title": "a"})))]
        );
        assert_eq!(cursor.collection_name(), "posts");
    }

    #[test]
    fn test_observe_snapshot_then_live() {
        let posts = posts();
        let recorder = Arc::new(Recorder::default());
        let cursor = posts.find(Selector::eq("owner", json!("u1")));

        let _handle = cursor.observe_changes(recorder.clone()).unwrap();
        assert_eq!(
            recorder.take(),
            vec![Event::Added(
                "p1".into(),
                fields_from_json(json!({"owner": "u1", "title": "a", "body": "x"}))
            )]
        );

        // p2 enters the selector.
        let mut diff = FieldDiff::new();
        diff.insert("owner".into(), Some(json!("u1")));
        posts.update("p2", diff).unwrap();

        // p1 leaves it.
        let mut diff = FieldDiff::new();
        diff.insert("owner".into(), Some(json!("u3")));
        posts.update("p1", diff).unwrap();

        let events = recorder.take();
        assert!(matches!(&events[0], Event::Added(id, _) if id.as_str() == "p2"));
        assert_eq!(events[1], Event::Removed("p1".into()));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn test_projection_hides_unrelated_changes() {
        let posts = posts();
        let recorder = Arc::new(Recorder::default());
        let cursor = posts.find(Selector::all()).fields(&["title"]);
        let _handle = cursor.observe_changes(recorder.clone()).unwrap();
        recorder.take();

        let mut diff = FieldDiff::new();
        diff.insert("body".into(), Some(json!("z")));
        posts.update("p1", diff).unwrap();
        assert!(recorder.take().is_empty());

        let mut diff = FieldDiff::new();
        diff.insert("title".into(), None);
        posts.update("p1", diff).unwrap();

        let mut expected = FieldDiff::new();
        expected.insert("title".into(), None);
        assert_eq!(recorder.take(), vec![Event::Changed("p1".into(), expected)]);
    }

    #[test]
    fn test_stop_ends_callbacks() {
        let posts = posts();
        let recorder = Arc::new(Recorder::default());
        let mut handle = posts
            .find(Selector::all())
            .observe_changes(recorder.clone())
            .unwrap();
        assert_eq!(posts.observer_count(), 1);
        recorder.take();

        handle.stop();
        handle.stop();
        assert_eq!(posts.observer_count(), 0);

        posts.insert("p3", Fields::new()).unwrap();
        posts.remove("p1").unwrap();
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_dropping_handle_stops() {
        let posts = posts();
        let recorder = Arc::new(Recorder::default());
        let handle = posts.find(Selector::id("p1")).observe_changes(recorder).unwrap();
        assert_eq!(posts.observer_count(), 1);
        drop(handle);
        assert_eq!(posts.observer_count(), 0);
    }
}
