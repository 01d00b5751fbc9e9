//! Repository traits: one logical operation per method, no business logic.
//!
//! The engine only ever talks to `dyn Store`; the in-memory implementation
//! in [`memory`] is the single-writer system of record for this crate, and
//! every method is treated as a suspension point by callers.

mod memory;

pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{
    Attachment, ContextSnapshot, EdgeCondition, EventKind, NodeInstance, NodeType, Position,
    Processor, TaskInstance, TaskStatus, TaskSubdivision, TemplateGraph, WorkflowEvent,
    WorkflowInstance, WorkflowInstanceStatus,
};
use crate::Result;

// ---------------------------------------------------------------------------
// Template publication specs
// ---------------------------------------------------------------------------

/// Node description used when publishing a template version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub node_type: NodeType,
    #[serde(default)]
    pub position: Position,
    /// Processors bound to this node, by id.
    #[serde(default)]
    pub processor_ids: Vec<Uuid>,
}

/// Connection description; endpoints reference node names within the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub from_node: String,
    pub to_node: String,
    #[serde(default)]
    pub condition: Option<EdgeCondition>,
}

/// A complete template to publish as a new base (version 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub creator_id: Uuid,
    #[serde(default)]
    pub parent_base_id: Option<Uuid>,
    pub nodes: Vec<NodeSpec>,
    pub connections: Vec<ConnectionSpec>,
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Per-table counts from a cascade delete.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CascadeReport {
    pub node_instances: usize,
    pub task_instances: usize,
    pub snapshots: usize,
    pub events: usize,
    pub soft: bool,
}

/// Status tallies for one workflow instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStatistics {
    pub node_status_counts: BTreeMap<String, usize>,
    pub task_status_counts: BTreeMap<String, usize>,
    pub duration_seconds: Option<i64>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkflowStore {
    /// Validate and persist a new template base (version 1). Returns the
    /// published graph.
    async fn publish_template(&self, spec: TemplateSpec) -> Result<TemplateGraph>;

    /// Persist an already-assembled template version (merge output).
    async fn publish_template_graph(&self, graph: TemplateGraph) -> Result<()>;

    async fn get_template(&self, workflow_id: Uuid) -> Result<TemplateGraph>;

    /// Highest non-deleted version for a base.
    async fn current_template(&self, workflow_base_id: Uuid) -> Result<TemplateGraph>;

    /// Number of merged templates already parented under a base. Used for
    /// `<name>_merged_<n>` naming.
    async fn merged_child_count(&self, workflow_base_id: Uuid) -> Result<usize>;

    async fn register_processor(&self, processor: Processor) -> Result<()>;
    async fn get_processor(&self, processor_id: Uuid) -> Result<Processor>;

    /// Processors bound to a template node, in binding order.
    async fn node_processors(&self, node_id: Uuid) -> Result<Vec<Processor>>;
    async fn bind_processor(&self, node_id: Uuid, processor_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait InstanceStore {
    async fn insert_instance(&self, instance: WorkflowInstance) -> Result<()>;
    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance>;
    /// Full-row replace. Callers hold the per-workflow lock.
    async fn save_instance(&self, instance: WorkflowInstance) -> Result<()>;

    async fn list_instances_by_status(
        &self,
        statuses: &[WorkflowInstanceStatus],
    ) -> Result<Vec<WorkflowInstance>>;

    async fn insert_node_instances(&self, node_instances: Vec<NodeInstance>) -> Result<()>;
    async fn get_node_instance(&self, node_instance_id: Uuid) -> Result<NodeInstance>;
    async fn save_node_instance(&self, node_instance: NodeInstance) -> Result<()>;
    async fn list_node_instances(&self, workflow_instance_id: Uuid) -> Result<Vec<NodeInstance>>;

    /// Soft (default) or hard delete of an instance and everything it owns.
    async fn delete_instance_cascade(
        &self,
        instance_id: Uuid,
        soft: bool,
    ) -> Result<CascadeReport>;
}

#[async_trait]
pub trait TaskStore {
    async fn insert_task(&self, task: TaskInstance) -> Result<()>;
    async fn get_task(&self, task_id: Uuid) -> Result<TaskInstance>;
    async fn save_task(&self, task: TaskInstance) -> Result<()>;
    async fn delete_task(&self, task_id: Uuid) -> Result<()>;

    async fn list_node_tasks(&self, node_instance_id: Uuid) -> Result<Vec<TaskInstance>>;
    async fn list_instance_tasks(&self, workflow_instance_id: Uuid) -> Result<Vec<TaskInstance>>;

    /// Indexed human inbox query, newest first.
    async fn list_user_tasks(
        &self,
        user_id: Uuid,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskInstance>>;

    /// Terminal tasks of a user, newest first.
    async fn list_user_task_history(&self, user_id: Uuid, limit: usize)
        -> Result<Vec<TaskInstance>>;

    async fn add_node_attachment(&self, node_id: Uuid, attachment: Attachment) -> Result<()>;
    async fn node_attachments(&self, node_id: Uuid) -> Result<Vec<Attachment>>;
}

#[async_trait]
pub trait SubdivisionStore {
    async fn insert_subdivision(&self, subdivision: TaskSubdivision) -> Result<()>;
    async fn get_subdivision(&self, subdivision_id: Uuid) -> Result<TaskSubdivision>;
    async fn save_subdivision(&self, subdivision: TaskSubdivision) -> Result<()>;

    /// The non-terminal subdivision for an idempotency key, if any.
    async fn find_active_subdivision(
        &self,
        original_task_id: Uuid,
        subdivider_id: Uuid,
        subdivision_name: &str,
    ) -> Result<Option<TaskSubdivision>>;

    async fn list_task_subdivisions(&self, original_task_id: Uuid)
        -> Result<Vec<TaskSubdivision>>;

    /// Subdivisions whose original task belongs to the given workflow
    /// instance.
    async fn list_instance_subdivisions(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Vec<TaskSubdivision>>;
}

#[async_trait]
pub trait SnapshotStore {
    async fn append_snapshot(&self, snapshot: ContextSnapshot) -> Result<()>;
    async fn latest_snapshot(&self, workflow_instance_id: Uuid)
        -> Result<Option<ContextSnapshot>>;
    /// Drop all but the newest `keep` snapshots; returns how many were removed.
    async fn cleanup_snapshots(&self, workflow_instance_id: Uuid, keep: usize) -> Result<usize>;
}

#[async_trait]
pub trait EventStore {
    /// Append an event, assigning the next per-workflow sequence number.
    async fn append_event(
        &self,
        workflow_instance_id: Uuid,
        kind: EventKind,
        node_instance_id: Option<Uuid>,
        data: serde_json::Value,
    ) -> Result<WorkflowEvent>;

    /// Events with `sequence_number > after`, in order.
    async fn events_after(
        &self,
        workflow_instance_id: Uuid,
        after: u64,
    ) -> Result<Vec<WorkflowEvent>>;

    /// Most recent events, newest last.
    async fn event_history(
        &self,
        workflow_instance_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WorkflowEvent>>;
}

/// Everything the engine needs from persistence, as one object-safe bound.
pub trait Store:
    WorkflowStore
    + InstanceStore
    + TaskStore
    + SubdivisionStore
    + SnapshotStore
    + EventStore
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: WorkflowStore
        + InstanceStore
        + TaskStore
        + SubdivisionStore
        + SnapshotStore
        + EventStore
        + Send
        + Sync
{
}

/// Status tallies and duration for one instance (join across tables).
pub async fn execution_statistics(
    store: &dyn Store,
    instance_id: Uuid,
) -> Result<ExecutionStatistics> {
    let instance = store.get_instance(instance_id).await?;
    let nodes = store.list_node_instances(instance_id).await?;
    let tasks = store.list_instance_tasks(instance_id).await?;

    let mut stats = ExecutionStatistics::default();
    for node in &nodes {
        *stats
            .node_status_counts
            .entry(node.status.to_string())
            .or_default() += 1;
    }
    for task in &tasks {
        *stats
            .task_status_counts
            .entry(task.status.to_string())
            .or_default() += 1;
    }
    stats.duration_seconds = match (instance.started_at, instance.completed_at) {
        (Some(start), Some(end)) => Some((end - start).num_seconds()),
        (Some(start), None) => Some((chrono::Utc::now() - start).num_seconds()),
        _ => None,
    };
    Ok(stats)
}
