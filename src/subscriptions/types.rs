//! Subscription types.

use super::manager::SubscriptionManager;
use crate::error::SyncError;
use crate::publication::PublicationContext;
use crate::types::SubscriptionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};

/// Lifecycle of a subscription.
///
/// `Starting → Initializing → Ready → (Rerunning ⇄ Ready) → Stopped`.
/// `Stopped` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Starting,
    Initializing,
    Ready,
    Rerunning,
    Stopped,
}

impl SubscriptionState {
    /// Not yet stopped. Active subscriptions absorb duplicate requests.
    pub fn is_active(self) -> bool {
        !matches!(self, SubscriptionState::Stopped)
    }
}

/// Why a subscription stopped.
#[derive(Clone, Debug)]
pub(crate) enum StopCause {
    /// Explicit stop by the client or the handler.
    Requested,
    /// Handler threw, or broke a publication rule.
    Failed(SyncError),
    /// Client went away; nothing is sent.
    Disconnected,
}

impl StopCause {
    pub(crate) fn from_error(error: Option<SyncError>) -> Self {
        match error {
            Some(err) => StopCause::Failed(err),
            None => StopCause::Requested,
        }
    }

    pub(crate) fn error(&self) -> Option<&SyncError> {
        match self {
            StopCause::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Registry record for one subscription.
pub(crate) struct SubscriptionEntry {
    pub(crate) id: SubscriptionId,
    pub(crate) name: String,
    pub(crate) params: Vec<Value>,
    pub(crate) status: Mutex<EntryStatus>,
}

pub(crate) struct EntryStatus {
    pub(crate) state: SubscriptionState,
    /// Bumped on every handler run.
    pub(crate) generation: u64,
    /// Context of the current run.
    pub(crate) run: Option<PublicationContext>,
    pub(crate) error: Option<SyncError>,
    /// Ambient context version the current run was started under.
    pub(crate) context_version: u64,
    /// Stop that arrived while a rerun was retiring the previous run. The
    /// rerun notifies the client once that retirement is queued.
    pub(crate) pending_stop: Option<StopCause>,
}

impl SubscriptionEntry {
    pub(crate) fn new(id: SubscriptionId, name: &str, params: Vec<Value>) -> Self {
        Self {
            id,
            name: name.to_string(),
            params,
            status: Mutex::new(EntryStatus {
                state: SubscriptionState::Starting,
                generation: 0,
                run: None,
                error: None,
                context_version: 0,
                pending_stop: None,
            }),
        }
    }

    /// Same handler name and structurally equal parameters.
    pub(crate) fn matches(&self, name: &str, params: &[Value]) -> bool {
        self.name == name && self.params.as_slice() == params
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.status.lock().state
    }
}

/// Handle to a subscription.
///
/// Deduplicated requests share one subscription, so every handle to it sees
/// the same state and `stop` on any of them stops it for all.
#[derive(Clone)]
pub struct SubscriptionHandle {
    pub(crate) entry: Arc<SubscriptionEntry>,
    pub(crate) manager: Weak<SubscriptionManager>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.entry.id
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn params(&self) -> &[Value] {
        &self.entry.params
    }

    pub fn state(&self) -> SubscriptionState {
        self.entry.state()
    }

    /// True once the current run has delivered its initial record set.
    pub fn ready(&self) -> bool {
        self.state() == SubscriptionState::Ready
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == SubscriptionState::Stopped
    }

    /// Error the subscription stopped with, if any.
    pub fn error(&self) -> Option<SyncError> {
        self.entry.status.lock().error.clone()
    }

    pub fn stop(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.stop_entry(&self.entry, StopCause::Requested, None);
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.entry.id)
            .field("name", &self.entry.name)
            .field("state", &self.state())
            .finish()
    }
}
