//! Task subdivision: "this task was replaced by a nested workflow".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubdivisionStatus {
    Created,
    Executing,
    Completed,
    Failed,
}

impl SubdivisionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SubdivisionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Record of one task's replacement by a nested workflow execution.
///
/// At most one non-terminal subdivision may exist per
/// `(original_task_id, subdivider_id, subdivision_name)` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubdivision {
    pub subdivision_id: Uuid,
    pub original_task_id: Uuid,
    pub subdivider_id: Uuid,
    pub subdivision_name: String,
    pub subdivision_description: String,
    pub sub_workflow_base_id: Uuid,
    pub sub_workflow_instance_id: Option<Uuid>,
    /// Chained subdivisions keep only the parent's id; the tree is resolved
    /// by lookup at merge/recovery time.
    pub parent_subdivision_id: Option<Uuid>,
    pub context_passed: serde_json::Value,
    pub status: SubdivisionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
}

impl TaskSubdivision {
    /// The idempotency key for duplicate-click collapsing.
    pub fn key(&self) -> (Uuid, Uuid, &str) {
        (
            self.original_task_id,
            self.subdivider_id,
            self.subdivision_name.as_str(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(!SubdivisionStatus::Created.is_terminal());
        assert!(!SubdivisionStatus::Executing.is_terminal());
        assert!(SubdivisionStatus::Completed.is_terminal());
        assert!(SubdivisionStatus::Failed.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&SubdivisionStatus::Executing).unwrap();
        assert_eq!(s, "\"executing\"");
    }
}
