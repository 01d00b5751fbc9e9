//! Append-only audit rows: workflow events and context snapshots.
//!
//! Events are totally ordered per workflow by `sequence_number`; a node's
//! completion event is durable before anything downstream of it is
//! dispatched. Snapshots are never edited after creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Normalized event kinds appended to the per-workflow log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
    NodeCompleted,
    NodeFailed,
    TaskCreated,
    TaskCompleted,
    TaskFailed,
    HelpRequested,
    SubdivisionCreated,
    SubdivisionCompleted,
    SnapshotCreated,
    ContextRecovered,
}

/// A single line of the per-workflow event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: Uuid,
    pub workflow_instance_id: Uuid,
    /// Monotonically increasing within one workflow instance; assigned by
    /// the store at append time.
    pub sequence_number: u64,
    pub kind: EventKind,
    pub node_instance_id: Option<Uuid>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A durable, restorable copy of an execution context's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub snapshot_id: Uuid,
    pub workflow_instance_id: Uuid,
    /// Event sequence number at capture time; replaying events after this
    /// number on top of the snapshot reproduces current state.
    pub sequence_number: u64,
    /// Workflow status at capture time.
    pub execution_state: String,
    /// Serialized `ContextImage` (outputs, dependencies, trigger state).
    pub context_data: serde_json::Value,
    /// Node-instance states at capture time, keyed by node instance id.
    pub node_states: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serde_round_trip() {
        let event = WorkflowEvent {
            event_id: Uuid::new_v4(),
            workflow_instance_id: Uuid::new_v4(),
            sequence_number: 7,
            kind: EventKind::NodeCompleted,
            node_instance_id: Some(Uuid::new_v4()),
            data: json!({"output": {"ok": true}}),
            created_at: Utc::now(),
        };

        let s = serde_json::to_string(&event).unwrap();
        let back: WorkflowEvent = serde_json::from_str(&s).unwrap();
        assert_eq!(back.sequence_number, 7);
        assert_eq!(back.kind, EventKind::NodeCompleted);
    }

    #[test]
    fn event_kind_serializes_snake_case() {
        let s = serde_json::to_string(&EventKind::SubdivisionCompleted).unwrap();
        assert_eq!(s, "\"subdivision_completed\"");
    }
}
