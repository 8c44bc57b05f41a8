//! Publication side: what a publish handler sees.
//!
//! A handler either drives a [`PublicationContext`] by hand
//! (`added`/`changed`/`removed`/`ready`) or returns [`Cursor`]s, which are
//! observed and translated into the same calls automatically.

mod context;
mod handler;
mod observer;

pub(crate) use context::run_stop_callbacks;
pub use context::{PublicationContext, StopCallback};
pub(crate) use handler::run_handler;
pub use handler::{HandlerRegistry, Publication, PublishHandler};
pub use observer::{Cursor, ObserveHandle, Observer};
