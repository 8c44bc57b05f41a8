//! Reactive computations that resubscribe on every run.
//!
//! A computation re-executes its body whenever its inputs change. Inside the
//! body it requests the subscriptions it needs; because identical requests
//! are coalesced by the session, rerunning never causes a retract/re-add.
//! After each run, subscriptions from the previous run that were not
//! requested again are stopped.
//!
//! # Example
//!
//! ```ignore
//! let computation = Computation::new(Arc::clone(&session));
//! computation.run(|cycle| cycle.subscribe("posts", vec![json!(owner)]))??;
//! // owner changes:
//! computation.run(|cycle| cycle.subscribe("posts", vec![json!(new_owner)]))??;
//! computation.stop();
//! ```

use crate::error::{Result, SyncError};
use crate::session::Session;
use crate::subscriptions::SubscriptionHandle;
use crate::types::SubscriptionId;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Subscriptions requested during one run of a computation.
pub struct Cycle<'a> {
    session: &'a Session,
    requested: HashMap<SubscriptionId, SubscriptionHandle>,
}

impl Cycle<'_> {
    pub fn subscribe(&mut self, name: &str, params: Vec<Value>) -> Result<SubscriptionHandle> {
        let handle = self.session.subscribe(name, params)?;
        self.requested.insert(handle.id(), handle.clone());
        Ok(handle)
    }
}

#[derive(Default)]
struct ComputationState {
    handles: HashMap<SubscriptionId, SubscriptionHandle>,
    runs: u64,
    stopped: bool,
}

/// Owner of the subscriptions made by a reactive body.
pub struct Computation {
    session: Arc<Session>,
    state: Mutex<ComputationState>,
}

impl Computation {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            state: Mutex::new(ComputationState::default()),
        }
    }

    /// Execute one run of the body.
    pub fn run<T>(&self, body: impl FnOnce(&mut Cycle<'_>) -> T) -> Result<T> {
        if self.state.lock().stopped {
            return Err(SyncError::ComputationStopped);
        }

        let mut cycle = Cycle {
            session: &self.session,
            requested: HashMap::new(),
        };
        let output = body(&mut cycle);

        let abandoned: Vec<SubscriptionHandle> = {
            let mut state = self.state.lock();
            state.runs += 1;
            if state.stopped {
                // Stopped while the body ran; nothing from this run survives.
                cycle.requested.into_values().collect()
            } else {
                let previous = std::mem::replace(&mut state.handles, cycle.requested);
                previous
                    .into_iter()
                    .filter(|(id, _)| !state.handles.contains_key(id))
                    .map(|(_, handle)| handle)
                    .collect()
            }
        };

        for handle in abandoned {
            tracing::debug!(sub = %handle.id(), "computation dropped subscription");
            handle.stop();
        }
        Ok(output)
    }

    /// Stop the computation and every subscription it holds.
    pub fn stop(&self) {
        let handles: Vec<SubscriptionHandle> = {
            let mut state = self.state.lock();
            state.stopped = true;
            state.handles.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            handle.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Subscriptions kept by the most recent run.
    pub fn handles(&self) -> Vec<SubscriptionHandle> {
        self.state.lock().handles.values().cloned().collect()
    }

    /// Number of completed runs.
    pub fn runs(&self) -> u64 {
        self.state.lock().runs
    }
}

impl Drop for Computation {
    fn drop(&mut self) {
        self.stop();
    }
}
