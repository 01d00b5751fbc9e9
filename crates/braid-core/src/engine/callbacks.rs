//! Completion callback registry.
//!
//! Callbacks are registered against a workflow instance id and fired exactly
//! once when the instance reaches a terminal state, either directly by the
//! engine at the transition or by the monitor's poll loop as a safety net.
//! `take` removes the registration, which is what makes firing exactly-once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::model::WorkflowInstanceStatus;

/// What a callback receives when its workflow terminates.
#[derive(Debug, Clone)]
pub struct CompletionInfo {
    pub instance_id: Uuid,
    pub status: WorkflowInstanceStatus,
    /// End-node output when available, otherwise joined task outputs.
    pub results: serde_json::Value,
}

pub type CompletionCallback =
    Box<dyn Fn(CompletionInfo) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct CallbackRegistry {
    inner: Mutex<HashMap<Uuid, Vec<CompletionCallback>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, instance_id: Uuid, callback: CompletionCallback) {
        self.inner.lock().entry(instance_id).or_default().push(callback);
    }

    /// Remove and return all callbacks for an instance.
    pub fn take(&self, instance_id: Uuid) -> Vec<CompletionCallback> {
        self.inner.lock().remove(&instance_id).unwrap_or_default()
    }

    /// Instances that still have registrations (for the monitor's poll).
    pub fn registered_ids(&self) -> Vec<Uuid> {
        self.inner.lock().keys().copied().collect()
    }

    pub fn has_registration(&self, instance_id: Uuid) -> bool {
        self.inner.lock().contains_key(&instance_id)
    }
}
