//! Publish handlers and their registry.

use super::context::PublicationContext;
use super::observer::{publish_cursors, Cursor};
use crate::error::{HandlerError, Result, SyncError};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// What a publish handler hands back.
pub enum Publication {
    /// The handler drives the context itself and calls `ready()` when done.
    Manual,
    /// Record sets to translate automatically. An empty list is ready at once.
    Cursors(Vec<Box<dyn Cursor>>),
}

impl Publication {
    pub fn cursor(cursor: impl Cursor + 'static) -> Self {
        Publication::Cursors(vec![Box::new(cursor)])
    }

    pub fn empty() -> Self {
        Publication::Cursors(Vec::new())
    }
}

/// Server-side function mapping subscription parameters to a record set.
pub trait PublishHandler: Send + Sync + 'static {
    fn publish(
        &self,
        ctx: &PublicationContext,
        params: &[Value],
    ) -> std::result::Result<Publication, HandlerError>;
}

impl<F> PublishHandler for F
where
    F: Fn(&PublicationContext, &[Value]) -> std::result::Result<Publication, HandlerError>
        + Send
        + Sync
        + 'static,
{
    fn publish(
        &self,
        ctx: &PublicationContext,
        params: &[Value],
    ) -> std::result::Result<Publication, HandlerError> {
        self(ctx, params)
    }
}

/// Named publish handlers shared by every session of a server.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn PublishHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, handler: Arc<dyn PublishHandler>) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(name) {
            return Err(SyncError::PublicationExists(name.to_string()));
        }
        handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PublishHandler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Invoke a handler for one run and wire up whatever it returns.
///
/// A handler error or panic comes back as [`SyncError::HandlerExecution`].
pub(crate) fn run_handler(
    handler: &dyn PublishHandler,
    ctx: &PublicationContext,
    params: &[Value],
) -> Result<()> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.publish(ctx, params)));
    match outcome {
        Ok(Ok(Publication::Manual)) => Ok(()),
        Ok(Ok(Publication::Cursors(cursors))) => publish_cursors(ctx, cursors),
        Ok(Err(err)) => Err(SyncError::HandlerExecution(err)),
        Err(_) => Err(SyncError::HandlerExecution(
            HandlerError::internal().with_reason("Internal server error"),
        )),
    }
}
