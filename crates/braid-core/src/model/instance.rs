//! Execution-side entities: one `WorkflowInstance` per run of a template
//! version, one `NodeInstance` per template node within it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::template::NodeType;
use crate::{BraidError, Result};

// ---------------------------------------------------------------------------
// Workflow instance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInstanceStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowInstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions of the workflow state machine. Terminal states
    /// accept nothing; this is what makes completion monotonic.
    pub fn can_transition_to(&self, next: Self) -> bool {
        use WorkflowInstanceStatus::*;
        match (self, next) {
            (Pending, Running | Cancelled | Failed) => true,
            (Running, Paused | Completed | Failed | Cancelled) => true,
            (Paused, Running | Cancelled | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowInstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One execution of a template version.
///
/// The five `execution_*`/`instance_metadata` fields mirror the in-memory
/// execution context so a crashed engine can rebuild it (see `context`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub instance_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_base_id: Uuid,
    pub executor_id: Uuid,
    pub name: String,
    pub status: WorkflowInstanceStatus,
    pub input_data: serde_json::Value,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,

    // Persisted execution fields.
    pub execution_context: serde_json::Value,
    pub node_dependencies: serde_json::Value,
    pub completed_nodes: Vec<Uuid>,
    pub execution_trace: Vec<String>,
    pub instance_metadata: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

impl WorkflowInstance {
    /// Apply a status transition, enforcing legality and keeping the
    /// `completed_at ⇔ terminal` invariant.
    pub fn transition(&mut self, next: WorkflowInstanceStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(BraidError::Conflict(format!(
                "workflow instance {} cannot move from {} to {next}",
                self.instance_id, self.status
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next == WorkflowInstanceStatus::Running && self.started_at.is_none() {
            self.started_at = Some(self.updated_at);
        }
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Node instance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeInstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeInstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        use NodeInstanceStatus::*;
        match (self, next) {
            (Pending, Running | Completed | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            // Retry path: a failed node may be re-queued.
            (Failed, Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for NodeInstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One execution of one template node within a workflow instance.
///
/// The set of node instances for a workflow instance is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInstance {
    pub node_instance_id: Uuid,
    pub workflow_instance_id: Uuid,
    pub node_id: Uuid,
    pub node_base_id: Uuid,
    pub name: String,
    pub description: String,
    pub node_type: NodeType,
    pub status: NodeInstanceStatus,
    pub input_data: serde_json::Value,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

impl NodeInstance {
    pub fn transition(&mut self, next: NodeInstanceStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(BraidError::Conflict(format!(
                "node instance {} ('{}') cannot move from {} to {next}",
                self.node_instance_id, self.name, self.status
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next == NodeInstanceStatus::Running && self.started_at.is_none() {
            self.started_at = Some(self.updated_at);
        }
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        } else {
            // Re-queued for retry.
            self.completed_at = None;
        }
        Ok(())
    }

    /// Mark completed with an output. A completed node without output is an
    /// invariant violation, so the output is required here by construction.
    pub fn complete(&mut self, output: serde_json::Value) -> Result<()> {
        self.output_data = Some(output);
        self.transition(NodeInstanceStatus::Completed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
