//! In-memory store: append-ordered tables behind one `parking_lot` lock.
//!
//! Listing order is insertion order, which is what makes dispatch
//! deterministic. Lookups are linear scans; the store targets a single
//! engine process, not analytical volumes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
    CascadeReport, ConnectionSpec, EventStore, InstanceStore, SnapshotStore, SubdivisionStore,
    TaskStore, TemplateSpec, WorkflowStore,
};
use crate::model::{
    Attachment, ContextSnapshot, EventKind, Node, NodeConnection, NodeInstance, NodeProcessor,
    Processor, TaskInstance, TaskStatus, TaskSubdivision, TemplateGraph, Workflow, WorkflowEvent,
    WorkflowInstance, WorkflowInstanceStatus,
};
use crate::{BraidError, Result};

#[derive(Default)]
struct State {
    workflows: Vec<Workflow>,
    nodes: Vec<Node>,
    connections: Vec<NodeConnection>,
    processors: Vec<Processor>,
    bindings: Vec<NodeProcessor>,
    instances: Vec<WorkflowInstance>,
    node_instances: Vec<NodeInstance>,
    tasks: Vec<TaskInstance>,
    subdivisions: Vec<TaskSubdivision>,
    snapshots: HashMap<Uuid, Vec<ContextSnapshot>>,
    events: HashMap<Uuid, Vec<WorkflowEvent>>,
    event_seq: HashMap<Uuid, u64>,
    attachments: HashMap<Uuid, Vec<Attachment>>,
}

/// Single-process system of record.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn assemble_graph(state: &State, workflow: Workflow) -> TemplateGraph {
        let nodes = state
            .nodes
            .iter()
            .filter(|n| n.workflow_id == workflow.workflow_id && !n.is_deleted)
            .cloned()
            .collect();
        let connections = state
            .connections
            .iter()
            .filter(|c| c.workflow_id == workflow.workflow_id && !c.is_deleted)
            .cloned()
            .collect();
        TemplateGraph {
            workflow,
            nodes,
            connections,
        }
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn publish_template(&self, spec: TemplateSpec) -> Result<TemplateGraph> {
        let now = Utc::now();
        let workflow = Workflow {
            workflow_id: Uuid::new_v4(),
            workflow_base_id: Uuid::new_v4(),
            name: spec.name.clone(),
            description: spec.description.clone(),
            version: 1,
            parent_base_id: spec.parent_base_id,
            creator_id: spec.creator_id,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };

        let mut nodes = Vec::with_capacity(spec.nodes.len());
        let mut by_name: HashMap<&str, &Node> = HashMap::new();
        for node_spec in &spec.nodes {
            let node = Node {
                node_id: Uuid::new_v4(),
                node_base_id: Uuid::new_v4(),
                workflow_id: workflow.workflow_id,
                name: node_spec.name.clone(),
                description: node_spec.description.clone(),
                node_type: node_spec.node_type,
                position: node_spec.position,
                created_at: now,
                updated_at: now,
                is_deleted: false,
            };
            nodes.push(node);
        }
        for node in &nodes {
            if by_name.insert(node.name.as_str(), node).is_some() {
                return Err(BraidError::Validation(format!(
                    "template '{}' has duplicate node name '{}'",
                    spec.name, node.name
                )));
            }
        }

        let mut connections = Vec::with_capacity(spec.connections.len());
        for ConnectionSpec {
            from_node,
            to_node,
            condition,
        } in &spec.connections
        {
            let from = by_name.get(from_node.as_str()).ok_or_else(|| {
                BraidError::Validation(format!("connection references unknown node '{from_node}'"))
            })?;
            let to = by_name.get(to_node.as_str()).ok_or_else(|| {
                BraidError::Validation(format!("connection references unknown node '{to_node}'"))
            })?;
            connections.push(NodeConnection {
                connection_id: Uuid::new_v4(),
                workflow_id: workflow.workflow_id,
                from_node_base_id: from.node_base_id,
                to_node_base_id: to.node_base_id,
                condition: condition.clone(),
                created_at: now,
                updated_at: now,
                is_deleted: false,
            });
        }

        let graph = TemplateGraph {
            workflow,
            nodes,
            connections,
        };
        graph.validate()?;

        let mut state = self.state.write();
        for (node, node_spec) in graph.nodes.iter().zip(&spec.nodes) {
            for processor_id in &node_spec.processor_ids {
                if !state
                    .processors
                    .iter()
                    .any(|p| p.processor_id == *processor_id && !p.is_deleted)
                {
                    return Err(BraidError::NotFound(format!("processor {processor_id}")));
                }
                state.bindings.push(NodeProcessor {
                    node_id: node.node_id,
                    processor_id: *processor_id,
                    created_at: now,
                });
            }
        }
        state.workflows.push(graph.workflow.clone());
        state.nodes.extend(graph.nodes.iter().cloned());
        state.connections.extend(graph.connections.iter().cloned());
        Ok(graph)
    }

    async fn publish_template_graph(&self, graph: TemplateGraph) -> Result<()> {
        graph.validate()?;
        let mut state = self.state.write();
        state.workflows.push(graph.workflow);
        state.nodes.extend(graph.nodes);
        state.connections.extend(graph.connections);
        Ok(())
    }

    async fn get_template(&self, workflow_id: Uuid) -> Result<TemplateGraph> {
        let state = self.state.read();
        let workflow = state
            .workflows
            .iter()
            .find(|w| w.workflow_id == workflow_id && !w.is_deleted)
            .cloned()
            .ok_or_else(|| BraidError::NotFound(format!("workflow {workflow_id}")))?;
        Ok(Self::assemble_graph(&state, workflow))
    }

    async fn current_template(&self, workflow_base_id: Uuid) -> Result<TemplateGraph> {
        let state = self.state.read();
        let workflow = state
            .workflows
            .iter()
            .filter(|w| w.workflow_base_id == workflow_base_id && !w.is_deleted)
            .max_by_key(|w| w.version)
            .cloned()
            .ok_or_else(|| BraidError::NotFound(format!("workflow base {workflow_base_id}")))?;
        Ok(Self::assemble_graph(&state, workflow))
    }

    async fn merged_child_count(&self, workflow_base_id: Uuid) -> Result<usize> {
        let state = self.state.read();
        Ok(state
            .workflows
            .iter()
            .filter(|w| w.parent_base_id == Some(workflow_base_id) && !w.is_deleted)
            .count())
    }

    async fn register_processor(&self, processor: Processor) -> Result<()> {
        processor.validate()?;
        let mut state = self.state.write();
        if state
            .processors
            .iter()
            .any(|p| p.processor_id == processor.processor_id)
        {
            return Err(BraidError::Conflict(format!(
                "processor {} already registered",
                processor.processor_id
            )));
        }
        state.processors.push(processor);
        Ok(())
    }

    async fn get_processor(&self, processor_id: Uuid) -> Result<Processor> {
        let state = self.state.read();
        state
            .processors
            .iter()
            .find(|p| p.processor_id == processor_id && !p.is_deleted)
            .cloned()
            .ok_or_else(|| BraidError::NotFound(format!("processor {processor_id}")))
    }

    async fn node_processors(&self, node_id: Uuid) -> Result<Vec<Processor>> {
        let state = self.state.read();
        let mut processors = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.node_id == node_id) {
            if let Some(p) = state
                .processors
                .iter()
                .find(|p| p.processor_id == binding.processor_id && !p.is_deleted)
            {
                processors.push(p.clone());
            }
        }
        Ok(processors)
    }

    async fn bind_processor(&self, node_id: Uuid, processor_id: Uuid) -> Result<()> {
        let mut state = self.state.write();
        if !state.nodes.iter().any(|n| n.node_id == node_id) {
            return Err(BraidError::NotFound(format!("node {node_id}")));
        }
        if !state
            .processors
            .iter()
            .any(|p| p.processor_id == processor_id && !p.is_deleted)
        {
            return Err(BraidError::NotFound(format!("processor {processor_id}")));
        }
        state.bindings.push(NodeProcessor {
            node_id,
            processor_id,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn insert_instance(&self, instance: WorkflowInstance) -> Result<()> {
        let mut state = self.state.write();
        if state
            .instances
            .iter()
            .any(|i| i.instance_id == instance.instance_id)
        {
            return Err(BraidError::Conflict(format!(
                "instance {} already exists",
                instance.instance_id
            )));
        }
        state.instances.push(instance);
        Ok(())
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance> {
        let state = self.state.read();
        state
            .instances
            .iter()
            .find(|i| i.instance_id == instance_id && !i.is_deleted)
            .cloned()
            .ok_or_else(|| BraidError::NotFound(format!("workflow instance {instance_id}")))
    }

    async fn save_instance(&self, instance: WorkflowInstance) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .instances
            .iter_mut()
            .find(|i| i.instance_id == instance.instance_id)
            .ok_or_else(|| {
                BraidError::NotFound(format!("workflow instance {}", instance.instance_id))
            })?;
        *slot = instance;
        Ok(())
    }

    async fn list_instances_by_status(
        &self,
        statuses: &[WorkflowInstanceStatus],
    ) -> Result<Vec<WorkflowInstance>> {
        let state = self.state.read();
        Ok(state
            .instances
            .iter()
            .filter(|i| !i.is_deleted && statuses.contains(&i.status))
            .cloned()
            .collect())
    }

    async fn insert_node_instances(&self, node_instances: Vec<NodeInstance>) -> Result<()> {
        let mut state = self.state.write();
        state.node_instances.extend(node_instances);
        Ok(())
    }

    async fn get_node_instance(&self, node_instance_id: Uuid) -> Result<NodeInstance> {
        let state = self.state.read();
        state
            .node_instances
            .iter()
            .find(|n| n.node_instance_id == node_instance_id && !n.is_deleted)
            .cloned()
            .ok_or_else(|| BraidError::NotFound(format!("node instance {node_instance_id}")))
    }

    async fn save_node_instance(&self, node_instance: NodeInstance) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .node_instances
            .iter_mut()
            .find(|n| n.node_instance_id == node_instance.node_instance_id)
            .ok_or_else(|| {
                BraidError::NotFound(format!("node instance {}", node_instance.node_instance_id))
            })?;
        *slot = node_instance;
        Ok(())
    }

    async fn list_node_instances(&self, workflow_instance_id: Uuid) -> Result<Vec<NodeInstance>> {
        let state = self.state.read();
        Ok(state
            .node_instances
            .iter()
            .filter(|n| n.workflow_instance_id == workflow_instance_id && !n.is_deleted)
            .cloned()
            .collect())
    }

    async fn delete_instance_cascade(
        &self,
        instance_id: Uuid,
        soft: bool,
    ) -> Result<CascadeReport> {
        let mut state = self.state.write();
        if !state
            .instances
            .iter()
            .any(|i| i.instance_id == instance_id && !i.is_deleted)
        {
            return Err(BraidError::NotFound(format!(
                "workflow instance {instance_id}"
            )));
        }

        let mut report = CascadeReport {
            soft,
            ..Default::default()
        };

        if soft {
            for i in state
                .instances
                .iter_mut()
                .filter(|i| i.instance_id == instance_id)
            {
                i.is_deleted = true;
                i.updated_at = Utc::now();
            }
            for n in state
                .node_instances
                .iter_mut()
                .filter(|n| n.workflow_instance_id == instance_id && !n.is_deleted)
            {
                n.is_deleted = true;
                report.node_instances += 1;
            }
            for t in state
                .tasks
                .iter_mut()
                .filter(|t| t.workflow_instance_id == instance_id && !t.is_deleted)
            {
                t.is_deleted = true;
                report.task_instances += 1;
            }
            report.snapshots = state
                .snapshots
                .get(&instance_id)
                .map_or(0, |s| s.len());
            report.events = state.events.get(&instance_id).map_or(0, |e| e.len());
        } else {
            state.instances.retain(|i| i.instance_id != instance_id);
            let before_nodes = state.node_instances.len();
            state
                .node_instances
                .retain(|n| n.workflow_instance_id != instance_id);
            report.node_instances = before_nodes - state.node_instances.len();

            let before_tasks = state.tasks.len();
            state
                .tasks
                .retain(|t| t.workflow_instance_id != instance_id);
            report.task_instances = before_tasks - state.tasks.len();

            report.snapshots = state
                .snapshots
                .remove(&instance_id)
                .map_or(0, |s| s.len());
            report.events = state.events.remove(&instance_id).map_or(0, |e| e.len());
            state.event_seq.remove(&instance_id);
        }

        Ok(report)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: TaskInstance) -> Result<()> {
        let mut state = self.state.write();
        state.tasks.push(task);
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<TaskInstance> {
        let state = self.state.read();
        state
            .tasks
            .iter()
            .find(|t| t.task_instance_id == task_id && !t.is_deleted)
            .cloned()
            .ok_or_else(|| BraidError::NotFound(format!("task {task_id}")))
    }

    async fn save_task(&self, task: TaskInstance) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .tasks
            .iter_mut()
            .find(|t| t.task_instance_id == task.task_instance_id)
            .ok_or_else(|| BraidError::NotFound(format!("task {}", task.task_instance_id)))?;
        *slot = task;
        Ok(())
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<()> {
        let mut state = self.state.write();
        let before = state.tasks.len();
        state.tasks.retain(|t| t.task_instance_id != task_id);
        if state.tasks.len() == before {
            return Err(BraidError::NotFound(format!("task {task_id}")));
        }
        Ok(())
    }

    async fn list_node_tasks(&self, node_instance_id: Uuid) -> Result<Vec<TaskInstance>> {
        let state = self.state.read();
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.node_instance_id == node_instance_id && !t.is_deleted)
            .cloned()
            .collect())
    }

    async fn list_instance_tasks(&self, workflow_instance_id: Uuid) -> Result<Vec<TaskInstance>> {
        let state = self.state.read();
        Ok(state
            .tasks
            .iter()
            .filter(|t| t.workflow_instance_id == workflow_instance_id && !t.is_deleted)
            .cloned()
            .collect())
    }

    async fn list_user_tasks(
        &self,
        user_id: Uuid,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<TaskInstance>> {
        let state = self.state.read();
        let mut tasks: Vec<TaskInstance> = state
            .tasks
            .iter()
            .filter(|t| {
                t.assigned_user_id == Some(user_id)
                    && !t.is_deleted
                    && status.map_or(true, |s| t.status == s)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn list_user_task_history(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TaskInstance>> {
        let state = self.state.read();
        let mut tasks: Vec<TaskInstance> = state
            .tasks
            .iter()
            .filter(|t| {
                t.assigned_user_id == Some(user_id) && !t.is_deleted && t.status.is_terminal()
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn add_node_attachment(&self, node_id: Uuid, attachment: Attachment) -> Result<()> {
        let mut state = self.state.write();
        state.attachments.entry(node_id).or_default().push(attachment);
        Ok(())
    }

    async fn node_attachments(&self, node_id: Uuid) -> Result<Vec<Attachment>> {
        let state = self.state.read();
        Ok(state.attachments.get(&node_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl SubdivisionStore for MemoryStore {
    async fn insert_subdivision(&self, subdivision: TaskSubdivision) -> Result<()> {
        let mut state = self.state.write();
        let duplicate = state.subdivisions.iter().any(|s| {
            s.key() == subdivision.key() && !s.status.is_terminal() && !s.is_deleted
        });
        if duplicate {
            return Err(BraidError::Conflict(format!(
                "an active subdivision named '{}' already exists for this task",
                subdivision.subdivision_name
            )));
        }
        state.subdivisions.push(subdivision);
        Ok(())
    }

    async fn get_subdivision(&self, subdivision_id: Uuid) -> Result<TaskSubdivision> {
        let state = self.state.read();
        state
            .subdivisions
            .iter()
            .find(|s| s.subdivision_id == subdivision_id && !s.is_deleted)
            .cloned()
            .ok_or_else(|| BraidError::NotFound(format!("subdivision {subdivision_id}")))
    }

    async fn save_subdivision(&self, subdivision: TaskSubdivision) -> Result<()> {
        let mut state = self.state.write();
        let slot = state
            .subdivisions
            .iter_mut()
            .find(|s| s.subdivision_id == subdivision.subdivision_id)
            .ok_or_else(|| {
                BraidError::NotFound(format!("subdivision {}", subdivision.subdivision_id))
            })?;
        *slot = subdivision;
        Ok(())
    }

    async fn find_active_subdivision(
        &self,
        original_task_id: Uuid,
        subdivider_id: Uuid,
        subdivision_name: &str,
    ) -> Result<Option<TaskSubdivision>> {
        let state = self.state.read();
        Ok(state
            .subdivisions
            .iter()
            .find(|s| {
                s.key() == (original_task_id, subdivider_id, subdivision_name)
                    && !s.status.is_terminal()
                    && !s.is_deleted
            })
            .cloned())
    }

    async fn list_task_subdivisions(
        &self,
        original_task_id: Uuid,
    ) -> Result<Vec<TaskSubdivision>> {
        let state = self.state.read();
        Ok(state
            .subdivisions
            .iter()
            .filter(|s| s.original_task_id == original_task_id && !s.is_deleted)
            .cloned()
            .collect())
    }

    async fn list_instance_subdivisions(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Vec<TaskSubdivision>> {
        let state = self.state.read();
        let task_ids: Vec<Uuid> = state
            .tasks
            .iter()
            .filter(|t| t.workflow_instance_id == workflow_instance_id)
            .map(|t| t.task_instance_id)
            .collect();
        Ok(state
            .subdivisions
            .iter()
            .filter(|s| task_ids.contains(&s.original_task_id) && !s.is_deleted)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn append_snapshot(&self, snapshot: ContextSnapshot) -> Result<()> {
        let mut state = self.state.write();
        state
            .snapshots
            .entry(snapshot.workflow_instance_id)
            .or_default()
            .push(snapshot);
        Ok(())
    }

    async fn latest_snapshot(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Option<ContextSnapshot>> {
        let state = self.state.read();
        Ok(state
            .snapshots
            .get(&workflow_instance_id)
            .and_then(|s| s.last().cloned()))
    }

    async fn cleanup_snapshots(&self, workflow_instance_id: Uuid, keep: usize) -> Result<usize> {
        let mut state = self.state.write();
        let Some(snapshots) = state.snapshots.get_mut(&workflow_instance_id) else {
            return Ok(0);
        };
        if snapshots.len() <= keep {
            return Ok(0);
        }
        let removed = snapshots.len() - keep;
        snapshots.drain(..removed);
        Ok(removed)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(
        &self,
        workflow_instance_id: Uuid,
        kind: EventKind,
        node_instance_id: Option<Uuid>,
        data: serde_json::Value,
    ) -> Result<WorkflowEvent> {
        let mut state = self.state.write();
        let seq = state.event_seq.entry(workflow_instance_id).or_insert(0);
        *seq += 1;
        let event = WorkflowEvent {
            event_id: Uuid::new_v4(),
            workflow_instance_id,
            sequence_number: *seq,
            kind,
            node_instance_id,
            data,
            created_at: Utc::now(),
        };
        state
            .events
            .entry(workflow_instance_id)
            .or_default()
            .push(event.clone());
        Ok(event)
    }

    async fn events_after(
        &self,
        workflow_instance_id: Uuid,
        after: u64,
    ) -> Result<Vec<WorkflowEvent>> {
        let state = self.state.read();
        Ok(state
            .events
            .get(&workflow_instance_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence_number > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn event_history(
        &self,
        workflow_instance_id: Uuid,
        limit: usize,
    ) -> Result<Vec<WorkflowEvent>> {
        let state = self.state.read();
        Ok(state
            .events
            .get(&workflow_instance_id)
            .map(|events| {
                let skip = events.len().saturating_sub(limit);
                events[skip..].to_vec()
            })
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeType, Position, ProcessorKind, SubdivisionStatus};
    use crate::store::{ConnectionSpec, NodeSpec};
    use serde_json::json;

    fn template_spec() -> TemplateSpec {
        TemplateSpec {
            name: "review-flow".into(),
            description: String::new(),
            creator_id: Uuid::new_v4(),
            parent_base_id: None,
            nodes: vec![
                NodeSpec {
                    name: "start".into(),
                    description: String::new(),
                    node_type: NodeType::Start,
                    position: Position::default(),
                    processor_ids: vec![],
                },
                NodeSpec {
                    name: "review".into(),
                    description: String::new(),
                    node_type: NodeType::Processor,
                    position: Position { x: 100.0, y: 0.0 },
                    processor_ids: vec![],
                },
                NodeSpec {
                    name: "end".into(),
                    description: String::new(),
                    node_type: NodeType::End,
                    position: Position { x: 200.0, y: 0.0 },
                    processor_ids: vec![],
                },
            ],
            connections: vec![
                ConnectionSpec {
                    from_node: "start".into(),
                    to_node: "review".into(),
                    condition: None,
                },
                ConnectionSpec {
                    from_node: "review".into(),
                    to_node: "end".into(),
                    condition: None,
                },
            ],
        }
    }

    #[tokio::test]
    async fn publish_and_fetch_template() {
        let store = MemoryStore::new();
        let graph = store.publish_template(template_spec()).await.unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.connections.len(), 2);

        let fetched = store.get_template(graph.workflow.workflow_id).await.unwrap();
        assert_eq!(fetched.nodes.len(), 3);

        let current = store
            .current_template(graph.workflow.workflow_base_id)
            .await
            .unwrap();
        assert_eq!(current.workflow.workflow_id, graph.workflow.workflow_id);
    }

    #[tokio::test]
    async fn publish_rejects_unknown_connection_endpoint() {
        let store = MemoryStore::new();
        let mut spec = template_spec();
        spec.connections.push(ConnectionSpec {
            from_node: "review".into(),
            to_node: "ghost".into(),
            condition: None,
        });
        let err = store.publish_template(spec).await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn processor_binding_round_trip() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let processor = Processor {
            processor_id: Uuid::new_v4(),
            name: "alice".into(),
            kind: ProcessorKind::Human,
            user_id: Some(Uuid::new_v4()),
            agent_id: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };
        store.register_processor(processor.clone()).await.unwrap();

        let graph = store.publish_template(template_spec()).await.unwrap();
        let review = &graph.nodes[1];
        store
            .bind_processor(review.node_id, processor.processor_id)
            .await
            .unwrap();

        let bound = store.node_processors(review.node_id).await.unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].name, "alice");
    }

    #[tokio::test]
    async fn event_sequence_is_monotonic_per_instance() {
        let store = MemoryStore::new();
        let instance_id = Uuid::new_v4();
        let other = Uuid::new_v4();

        let e1 = store
            .append_event(instance_id, EventKind::WorkflowStarted, None, json!({}))
            .await
            .unwrap();
        let e2 = store
            .append_event(instance_id, EventKind::NodeCompleted, None, json!({}))
            .await
            .unwrap();
        let f1 = store
            .append_event(other, EventKind::WorkflowStarted, None, json!({}))
            .await
            .unwrap();

        assert_eq!(e1.sequence_number, 1);
        assert_eq!(e2.sequence_number, 2);
        assert_eq!(f1.sequence_number, 1);

        let after = store.events_after(instance_id, 1).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].sequence_number, 2);
    }

    #[tokio::test]
    async fn snapshot_retention() {
        let store = MemoryStore::new();
        let instance_id = Uuid::new_v4();
        for seq in 0..5 {
            store
                .append_snapshot(ContextSnapshot {
                    snapshot_id: Uuid::new_v4(),
                    workflow_instance_id: instance_id,
                    sequence_number: seq,
                    execution_state: "running".into(),
                    context_data: json!({}),
                    node_states: json!({}),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let removed = store.cleanup_snapshots(instance_id, 2).await.unwrap();
        assert_eq!(removed, 3);

        let latest = store.latest_snapshot(instance_id).await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 4);
    }

    #[tokio::test]
    async fn duplicate_active_subdivision_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let task_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let make = |status| TaskSubdivision {
            subdivision_id: Uuid::new_v4(),
            original_task_id: task_id,
            subdivider_id: user_id,
            subdivision_name: "deep-dive".into(),
            subdivision_description: String::new(),
            sub_workflow_base_id: Uuid::new_v4(),
            sub_workflow_instance_id: None,
            parent_subdivision_id: None,
            context_passed: json!({}),
            status,
            created_at: now,
            updated_at: now,
            completed_at: None,
            is_deleted: false,
        };

        store
            .insert_subdivision(make(SubdivisionStatus::Executing))
            .await
            .unwrap();
        let err = store
            .insert_subdivision(make(SubdivisionStatus::Created))
            .await
            .unwrap_err();
        assert!(matches!(err, BraidError::Conflict(_)));

        // A terminal subdivision does not block a new one with the same name.
        let found = store
            .find_active_subdivision(task_id, user_id, "deep-dive")
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn cascade_soft_delete_flags_children() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let instance_id = Uuid::new_v4();

        store
            .insert_instance(WorkflowInstance {
                instance_id,
                workflow_id: Uuid::new_v4(),
                workflow_base_id: Uuid::new_v4(),
                executor_id: Uuid::new_v4(),
                name: "run".into(),
                status: WorkflowInstanceStatus::Running,
                input_data: json!({}),
                output_data: None,
                error_message: None,
                execution_context: json!({}),
                node_dependencies: json!({}),
                completed_nodes: vec![],
                execution_trace: vec![],
                instance_metadata: json!({}),
                created_at: now,
                updated_at: now,
                started_at: Some(now),
                completed_at: None,
                is_deleted: false,
            })
            .await
            .unwrap();

        store
            .insert_node_instances(vec![NodeInstance {
                node_instance_id: Uuid::new_v4(),
                workflow_instance_id: instance_id,
                node_id: Uuid::new_v4(),
                node_base_id: Uuid::new_v4(),
                name: "a".into(),
                description: String::new(),
                node_type: NodeType::Processor,
                status: crate::model::NodeInstanceStatus::Pending,
                input_data: json!({}),
                output_data: None,
                error_message: None,
                retry_count: 0,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
                is_deleted: false,
            }])
            .await
            .unwrap();

        let report = store.delete_instance_cascade(instance_id, true).await.unwrap();
        assert!(report.soft);
        assert_eq!(report.node_instances, 1);

        let err = store.get_instance(instance_id).await.unwrap_err();
        assert!(matches!(err, BraidError::NotFound(_)));
    }
}
