//! Subscription lifecycle for one client.
//!
//! A subscription is a (publication name, parameters) pair. The manager:
//! - starts the publish handler and tracks `Starting → Initializing → Ready`
//! - reruns handlers when the calling identity changes
//! - coalesces repeated requests for the same name and parameters
//! - stops subscriptions on request, on handler failure or on disconnect
//!
//! # Example
//!
//! ```ignore
//! let handle = session.subscribe("posts", vec![json!("alice")])?;
//! assert_eq!(handle.id(), session.subscribe("posts", vec![json!("alice")])?.id());
//!
//! session.flush()?;
//! if handle.ready() {
//!     println!("initial posts delivered");
//! }
//! handle.stop();
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub(crate) use types::StopCause;
pub use types::{SubscriptionHandle, SubscriptionState};
