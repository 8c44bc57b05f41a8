//! # Live Sync
//!
//! Server-side live-query synchronization: many overlapping subscriptions
//! per client are merged into one consistent stream of document changes.
//!
//! ## Core Concepts
//!
//! - **Publications**: Named handlers mapping parameters to a record set
//! - **Merge Box**: Per-client reference-counted union of every subscription
//! - **Subscriptions**: Dedup, `ready` tracking, reruns and teardown
//! - **Mirror**: Client-side store applying the merged stream
//!
//! ## Example
//!
//! ```ignore
//! use livesync::{ChannelTransport, ClientMirror, MemoryCollection, Publication,
//!     PublicationContext, Selector, Server};
//! use serde_json::{json, Value};
//!
//! let posts = MemoryCollection::new("posts");
//! let server = Server::default();
//! server.publish("posts", move |_ctx: &PublicationContext, _params: &[Value]| {
//!     Ok(Publication::cursor(posts.find(Selector::all())))
//! })?;
//!
//! let (transport, receiver) = ChannelTransport::new();
//! let session = server.connect(transport)?;
//! let handle = session.subscribe("posts", vec![])?;
//! session.flush()?;
//!
//! let mut mirror = ClientMirror::new();
//! mirror.declare_collection("posts")?;
//! mirror.drain(&receiver)?;
//! assert!(mirror.is_ready(handle.id()));
//! ```

pub mod computation;
pub mod error;
pub mod memory;
pub mod merge;
pub mod mirror;
pub mod protocol;
pub mod publication;
pub mod server;
pub mod session;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use computation::{Computation, Cycle};
pub use error::{HandlerError, Result, SyncError};
pub use memory::{MemoryCollection, MemoryCursor, MemoryObserveHandle, Selector};
pub use merge::{CollectionView, DocumentView, MergeBox};
pub use mirror::{ClientMirror, LocalCollection, MirrorConfig};
pub use protocol::{ChannelTransport, ErrorPayload, ServerMessage, Transport, TransportError};
pub use publication::{
    Cursor, HandlerRegistry, ObserveHandle, Observer, Publication, PublicationContext,
    PublishHandler, StopCallback,
};
pub use server::{Server, ServerConfig};
pub use session::{Session, SessionConfig};
pub use subscriptions::{SubscriptionHandle, SubscriptionManager, SubscriptionState};
pub use types::*;
