//! Task instances: the dispatchable unit handed to a human or an agent.
//! One task per processor binding of a node; a `mix` binding expands into a
//! human task and an agent task whose outputs are collated by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BraidError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned | Cancelled | Failed) => true,
            (Assigned, InProgress | Completed | Failed | Cancelled) => true,
            // Pausing returns an in-progress task to the assignee's queue.
            (InProgress, Assigned | Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Which sink a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Human,
    Agent,
    Mixed,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Agent => write!(f, "agent"),
            Self::Mixed => write!(f, "mixed"),
        }
    }
}

/// The dispatchable unit attached to a node instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task_instance_id: Uuid,
    pub node_instance_id: Uuid,
    pub workflow_instance_id: Uuid,
    pub processor_id: Uuid,
    pub kind: TaskKind,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_user_id: Option<Uuid>,
    pub assigned_agent_id: Option<Uuid>,
    /// `ContextPayload` serialized for the processor's consumption.
    pub context_data: serde_json::Value,
    pub input_data: serde_json::Value,
    pub output_data: Option<serde_json::Value>,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

impl TaskInstance {
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(BraidError::Conflict(format!(
                "task {} ('{}') cannot move from {} to {next}",
                self.task_instance_id, self.title, self.status
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        match next {
            TaskStatus::Assigned if self.assigned_at.is_none() => {
                self.assigned_at = Some(self.updated_at);
            }
            TaskStatus::InProgress if self.started_at.is_none() => {
                self.started_at = Some(self.updated_at);
            }
            _ => {}
        }
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// The acting user must be the assignee for any human task action.
    pub fn ensure_assignee(&self, user_id: Uuid) -> Result<()> {
        if self.assigned_user_id == Some(user_id) {
            Ok(())
        } else {
            Err(BraidError::PermissionDenied(format!(
                "task {} is not assigned to user {user_id}",
                self.task_instance_id
            )))
        }
    }
}
