//! Human task inbox: the read side of the human queue.
//!
//! State changes (start, submit, reject, …) live on the engine; this module
//! answers "what is on my plate" queries and enriches task details for UI
//! consumption.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ContextPayload, NodeInstance, TaskInstance, TaskStatus};
use crate::store::{InstanceStore, Store, TaskStore};
use crate::Result;

/// A task enriched for display.
#[derive(Debug, Clone)]
pub struct TaskDetails {
    pub task: TaskInstance,
    pub node: NodeInstance,
    pub payload: ContextPayload,
}

/// Per-user tallies for the inbox header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
}

pub struct TaskInbox {
    store: Arc<dyn Store>,
}

impl TaskInbox {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Open tasks for a user, optionally filtered by status, newest first.
    pub async fn list_user_tasks(
        &self,
        user_id: Uuid,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<TaskInstance>> {
        self.store
            .list_user_tasks(user_id, status, limit.unwrap_or(50))
            .await
    }

    /// Full detail view: the task, its node instance and the decoded
    /// context payload (immediate upstream outputs, global summary,
    /// workflow metadata, attachments).
    pub async fn task_details(&self, task_id: Uuid, user_id: Uuid) -> Result<TaskDetails> {
        let task = self.store.get_task(task_id).await?;
        task.ensure_assignee(user_id)?;
        let node = self.store.get_node_instance(task.node_instance_id).await?;
        let payload = ContextPayload::from_value(&task.context_data);
        Ok(TaskDetails {
            task,
            node,
            payload,
        })
    }

    /// Terminal tasks of a user, newest first.
    pub async fn task_history(
        &self,
        user_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<TaskInstance>> {
        self.store
            .list_user_task_history(user_id, limit.unwrap_or(50))
            .await
    }

    /// Status tallies across everything ever assigned to the user.
    pub async fn task_statistics(&self, user_id: Uuid) -> Result<TaskStatistics> {
        let open = self.store.list_user_tasks(user_id, None, usize::MAX).await?;
        let done = self
            .store
            .list_user_task_history(user_id, usize::MAX)
            .await?;

        // Both listings can surface the same row; dedupe by id.
        let mut stats = TaskStatistics::default();
        let mut seen = std::collections::HashSet::new();
        for task in open.iter().chain(done.iter()) {
            if seen.insert(task.task_instance_id) {
                *stats.by_status.entry(task.status.to_string()).or_default() += 1;
            }
        }
        stats.total = seen.len();
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    use crate::model::TaskKind;
    use crate::store::MemoryStore;

    fn task(user_id: Uuid, title: &str, status: TaskStatus) -> TaskInstance {
        let now = Utc::now();
        TaskInstance {
            task_instance_id: Uuid::new_v4(),
            node_instance_id: Uuid::new_v4(),
            workflow_instance_id: Uuid::new_v4(),
            processor_id: Uuid::new_v4(),
            kind: TaskKind::Human,
            title: title.into(),
            description: String::new(),
            status,
            assigned_user_id: Some(user_id),
            assigned_agent_id: None,
            context_data: json!({}),
            input_data: json!({}),
            output_data: None,
            result_summary: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            assigned_at: Some(now),
            started_at: None,
            completed_at: status.is_terminal().then_some(now),
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store
            .insert_task(task(user, "open", TaskStatus::Assigned))
            .await
            .unwrap();
        store
            .insert_task(task(user, "busy", TaskStatus::InProgress))
            .await
            .unwrap();
        store
            .insert_task(task(Uuid::new_v4(), "other", TaskStatus::Assigned))
            .await
            .unwrap();

        let inbox = TaskInbox::new(store);
        let assigned = inbox
            .list_user_tasks(user, Some(TaskStatus::Assigned), None)
            .await
            .unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].title, "open");

        let all = inbox.list_user_tasks(user, None, None).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn statistics_tally_by_status() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        store
            .insert_task(task(user, "a", TaskStatus::Assigned))
            .await
            .unwrap();
        store
            .insert_task(task(user, "b", TaskStatus::Completed))
            .await
            .unwrap();
        store
            .insert_task(task(user, "c", TaskStatus::Completed))
            .await
            .unwrap();

        let inbox = TaskInbox::new(store);
        let stats = inbox.task_statistics(user).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status["assigned"], 1);
        assert_eq!(stats.by_status["completed"], 2);
    }

    #[tokio::test]
    async fn details_enforce_assignee() {
        let store = Arc::new(MemoryStore::new());
        let user = Uuid::new_v4();
        let t = task(user, "mine", TaskStatus::Assigned);
        let task_id = t.task_instance_id;
        store.insert_task(t).await.unwrap();

        let inbox = TaskInbox::new(store);
        let err = inbox.task_details(task_id, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, crate::BraidError::PermissionDenied(_)));
    }
}
