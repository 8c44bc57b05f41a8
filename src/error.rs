//! Error types for the sync layer.

use crate::protocol::ErrorPayload;
use crate::types::DocumentId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error code sent to clients when a handler fails without a client-safe error.
pub const INTERNAL_ERROR: &str = "internal-server-error";

/// Main error type for sync operations.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("Duplicate add: {collection}/{id} is already published by this subscription")]
    DuplicateAdd { collection: String, id: DocumentId },

    #[error("Unknown document: {collection}/{id} is not published by this subscription")]
    UnknownDocument { collection: String, id: DocumentId },

    #[error("Handler execution failed: {0}")]
    HandlerExecution(HandlerError),

    #[error("Transport disconnected")]
    TransportDisconnect,

    #[error("Publication not found: {0}")]
    PublicationNotFound(String),

    #[error("Publication already registered: {0}")]
    PublicationExists(String),

    #[error("Publish handler returned multiple cursors for collection {0}")]
    DuplicateCursorCollection(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Timed out waiting for the session worker")]
    FlushTimeout,

    #[error("Failed to start session worker: {0}")]
    WorkerSpawn(String),

    #[error("Computation stopped")]
    ComputationStopped,

    #[error("Document already exists: {collection}/{id}")]
    DocumentExists { collection: String, id: DocumentId },

    #[error("Document not found: {collection}/{id}")]
    DocumentNotFound { collection: String, id: DocumentId },

    #[error("Mirror error: {0}")]
    Mirror(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Client-facing rendering of this error, used in stop notifications.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            SyncError::HandlerExecution(err) => ErrorPayload {
                error: err.error.clone(),
                reason: err.reason.clone(),
            },
            SyncError::PublicationNotFound(name) => ErrorPayload {
                error: "not-found".to_string(),
                reason: Some(format!("Subscription '{}' not found", name)),
            },
            SyncError::DuplicateAdd { .. } => ErrorPayload {
                error: "duplicate-add".to_string(),
                reason: Some(self.to_string()),
            },
            SyncError::UnknownDocument { .. } => ErrorPayload {
                error: "unknown-document".to_string(),
                reason: Some(self.to_string()),
            },
            SyncError::DuplicateCursorCollection(_) => ErrorPayload {
                error: "duplicate-cursor".to_string(),
                reason: Some(self.to_string()),
            },
            _ => ErrorPayload {
                error: INTERNAL_ERROR.to_string(),
                reason: None,
            },
        }
    }
}

/// Failure reported by a publish handler.
///
/// `error` is a short machine-readable code; `reason` is shown to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerError {
    pub error: String,
    pub reason: Option<String>,
}

impl HandlerError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub(crate) fn internal() -> Self {
        Self::new(INTERNAL_ERROR)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} ({})", reason, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<HandlerError> for SyncError {
    fn from(e: HandlerError) -> Self {
        SyncError::HandlerExecution(e)
    }
}

/// Lets handlers propagate context errors with `?`.
impl From<SyncError> for HandlerError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::HandlerExecution(err) => err,
            other => {
                let payload = other.to_payload();
                HandlerError {
                    error: payload.error,
                    reason: payload.reason,
                }
            }
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
