//! Merge engine combining overlapping record sets.
//!
//! Every subscription of a client asserts documents as `(collection, id)`
//! plus a field mapping. The merge box keeps one merged copy per document,
//! reference-counted by the subscriptions asserting it, and turns each
//! mutation into the minimal `added`/`changed`/`removed` messages:
//!
//! - `added` when the first subscription asserts a document
//! - `changed` when the merged value of some top-level field moves
//! - `removed` when the last asserting subscription lets go
//!
//! When two subscriptions assert different values for one field, any live
//! value may win. A value nobody asserts any more is never kept.

mod collection;
mod document;
mod merge_box;

pub use collection::CollectionView;
pub use document::DocumentView;
pub use merge_box::MergeBox;
