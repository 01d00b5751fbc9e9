//! In-memory execution context: the per-instance reasoning surface for
//! "what runs next".
//!
//! One context exists per live workflow instance. All mutation goes through
//! the per-workflow lock held by the owner (`ContextManager` hands out
//! `Arc<tokio::sync::Mutex<ExecutionContext>>`); the context itself is plain
//! data. The database, not this object, is the system of record.

pub mod manager;

pub use manager::{ContextManager, ContextManagerStats};

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{EdgeCondition, NodeInstance, NodeType, TemplateGraph};
use crate::{BraidError, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Scheduling state of a node instance inside the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Executing,
    Completed,
    Failed,
}

/// An edge between two node instances, with its optional condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRule {
    pub from: Uuid,
    pub to: Uuid,
    pub condition: Option<EdgeCondition>,
}

/// Deep-cloned, serializable image of a context. `Snapshot()` returns this;
/// `restore_from_image` accepts it. Field-for-field equality is the
/// round-trip contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextImage {
    pub workflow_instance_id: Uuid,
    pub dependencies_full: HashMap<Uuid, HashSet<Uuid>>,
    pub dependencies_remaining: HashMap<Uuid, HashSet<Uuid>>,
    pub successors: HashMap<Uuid, Vec<Uuid>>,
    pub edges: Vec<EdgeRule>,
    pub node_states: HashMap<Uuid, NodeState>,
    pub node_names: HashMap<Uuid, String>,
    pub node_outputs: HashMap<Uuid, serde_json::Value>,
    pub completed_nodes: HashSet<Uuid>,
    pub current_executing: HashSet<Uuid>,
    pub skipped_edges: HashSet<(Uuid, Uuid)>,
    pub pending_triggers: Vec<Uuid>,
    pub triggered: HashSet<Uuid>,
    pub last_event_sequence: u64,
}

/// Outcome of a context health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHealth {
    pub healthy: bool,
    pub reasons: Vec<String>,
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Dependency tracking, ready-node detection and output propagation for one
/// workflow instance.
#[derive(Debug)]
pub struct ExecutionContext {
    image: ContextImage,
    last_dispatch: Option<DateTime<Utc>>,
    last_activity: DateTime<Utc>,
    updates_since_snapshot: u32,
}

impl ExecutionContext {
    pub fn new(workflow_instance_id: Uuid) -> Self {
        Self {
            image: ContextImage {
                workflow_instance_id,
                ..Default::default()
            },
            last_dispatch: None,
            last_activity: Utc::now(),
            updates_since_snapshot: 0,
        }
    }

    pub fn workflow_instance_id(&self) -> Uuid {
        self.image.workflow_instance_id
    }

    /// Build dependency state from the template graph and this instance's
    /// node instances; mark start nodes ready. Idempotent: a second call on
    /// an initialized context is a no-op.
    pub fn initialize(&mut self, graph: &TemplateGraph, node_instances: &[NodeInstance]) {
        if !self.image.node_states.is_empty() {
            return;
        }

        let by_base: HashMap<Uuid, &NodeInstance> = node_instances
            .iter()
            .map(|ni| (ni.node_base_id, ni))
            .collect();

        for ni in node_instances {
            self.image.node_states.insert(ni.node_instance_id, NodeState::Pending);
            self.image
                .node_names
                .insert(ni.node_instance_id, ni.name.clone());
            self.image
                .dependencies_full
                .insert(ni.node_instance_id, HashSet::new());
            self.image
                .dependencies_remaining
                .insert(ni.node_instance_id, HashSet::new());
            self.image
                .successors
                .insert(ni.node_instance_id, Vec::new());
        }

        // Map template edges (node-base endpoints) onto node instances.
        for conn in &graph.connections {
            let (Some(from), Some(to)) = (
                by_base.get(&conn.from_node_base_id),
                by_base.get(&conn.to_node_base_id),
            ) else {
                continue;
            };
            let (from, to) = (from.node_instance_id, to.node_instance_id);
            self.image
                .dependencies_full
                .entry(to)
                .or_default()
                .insert(from);
            self.image
                .dependencies_remaining
                .entry(to)
                .or_default()
                .insert(from);
            let successors = self.image.successors.entry(from).or_default();
            if !successors.contains(&to) {
                successors.push(to);
            }
            self.image.edges.push(EdgeRule {
                from,
                to,
                condition: conn.condition.clone(),
            });
        }

        // Start nodes are immediately ready.
        for node in &graph.nodes {
            if node.node_type != NodeType::Start {
                continue;
            }
            if let Some(ni) = by_base.get(&node.node_base_id) {
                self.trigger(ni.node_instance_id);
            }
        }

        self.touch();
    }

    /// Recovery path: install a dependency set for one node instance.
    pub fn register_dependencies(&mut self, node_instance_id: Uuid, upstream: HashSet<Uuid>) {
        let remaining: HashSet<Uuid> = upstream
            .iter()
            .copied()
            .filter(|up| !self.image.completed_nodes.contains(up))
            .collect();
        self.image
            .dependencies_full
            .insert(node_instance_id, upstream);
        self.image
            .dependencies_remaining
            .insert(node_instance_id, remaining);
        self.image
            .node_states
            .entry(node_instance_id)
            .or_insert(NodeState::Pending);
    }

    fn trigger(&mut self, node_instance_id: Uuid) {
        if self.image.triggered.contains(&node_instance_id) {
            return;
        }
        self.image
            .node_states
            .insert(node_instance_id, NodeState::Ready);
        self.image.triggered.insert(node_instance_id);
        self.image.pending_triggers.push(node_instance_id);
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Move a ready node into the executing set (the engine dispatched it).
    pub fn mark_executing(&mut self, node_instance_id: Uuid) -> Result<()> {
        match self.image.node_states.get(&node_instance_id) {
            Some(NodeState::Ready | NodeState::Pending) => {}
            Some(state) => {
                return Err(BraidError::Conflict(format!(
                    "node instance {node_instance_id} cannot start executing from {state:?}"
                )));
            }
            None => {
                return Err(BraidError::NotFound(format!(
                    "node instance {node_instance_id} is not tracked by this context"
                )));
            }
        }
        self.image
            .node_states
            .insert(node_instance_id, NodeState::Executing);
        self.image.triggered.insert(node_instance_id);
        self.image.current_executing.insert(node_instance_id);
        self.touch();
        Ok(())
    }

    /// Record an output, complete the node, decrement successor dependencies
    /// and queue newly-ready successors. Idempotent for already-completed
    /// nodes (event replay hits this path).
    pub fn mark_completed(&mut self, node_instance_id: Uuid, output: serde_json::Value) {
        if self.image.completed_nodes.contains(&node_instance_id) {
            return;
        }

        self.image
            .node_outputs
            .insert(node_instance_id, output.clone());
        self.image
            .node_states
            .insert(node_instance_id, NodeState::Completed);
        self.image.triggered.insert(node_instance_id);
        self.image.completed_nodes.insert(node_instance_id);
        self.image.current_executing.remove(&node_instance_id);
        self.updates_since_snapshot += 1;

        // Conditional edges: an unsatisfied predicate records a skip so the
        // payload composer hands downstream a null for this source.
        let skipped: Vec<(Uuid, Uuid)> = self
            .image
            .edges
            .iter()
            .filter(|e| e.from == node_instance_id)
            .filter(|e| {
                e.condition
                    .as_ref()
                    .is_some_and(|cond| !cond.evaluate(&output))
            })
            .map(|e| (e.from, e.to))
            .collect();
        self.image.skipped_edges.extend(skipped);

        let successors = self
            .image
            .successors
            .get(&node_instance_id)
            .cloned()
            .unwrap_or_default();
        for successor in successors {
            if let Some(remaining) = self.image.dependencies_remaining.get_mut(&successor) {
                remaining.remove(&node_instance_id);
                let unblocked = remaining.is_empty();
                if unblocked
                    && self.image.node_states.get(&successor) == Some(&NodeState::Pending)
                {
                    self.trigger(successor);
                }
            }
        }

        self.touch();
    }

    pub fn mark_failed(&mut self, node_instance_id: Uuid) {
        self.image
            .node_states
            .insert(node_instance_id, NodeState::Failed);
        self.image.triggered.insert(node_instance_id);
        self.image.current_executing.remove(&node_instance_id);
        self.touch();
    }

    /// Drain the pending trigger queue. Each node instance is returned at
    /// most once over the lifetime of this context object.
    pub fn get_ready_nodes(&mut self) -> Vec<Uuid> {
        let drained: Vec<Uuid> = std::mem::take(&mut self.image.pending_triggers)
            .into_iter()
            .filter(|id| self.image.node_states.get(id) == Some(&NodeState::Ready))
            .collect();
        if !drained.is_empty() {
            self.last_dispatch = Some(Utc::now());
        }
        drained
    }

    pub fn has_pending_triggers(&self) -> bool {
        !self.image.pending_triggers.is_empty()
    }

    /// Put an already-drained node back on the trigger queue (dispatch was
    /// rolled back, e.g. the agent queue refused the enqueue).
    pub fn requeue_trigger(&mut self, node_instance_id: Uuid) {
        self.image
            .node_states
            .insert(node_instance_id, NodeState::Ready);
        if !self.image.pending_triggers.contains(&node_instance_id) {
            self.image.pending_triggers.push(node_instance_id);
        }
    }

    /// Deep-cloned image suitable for [`ExecutionContext::restore_from_image`].
    pub fn snapshot(&self) -> ContextImage {
        self.image.clone()
    }

    /// Replace current state wholesale; used to revert side effects a child
    /// execution caused to shared in-memory state.
    pub fn restore_from_image(&mut self, image: ContextImage) {
        self.image = image;
        self.touch();
    }

    pub fn state_of(&self, node_instance_id: Uuid) -> Option<NodeState> {
        self.image.node_states.get(&node_instance_id).copied()
    }

    pub fn output_of(&self, node_instance_id: Uuid) -> Option<&serde_json::Value> {
        self.image.node_outputs.get(&node_instance_id)
    }

    pub fn node_name(&self, node_instance_id: Uuid) -> Option<&str> {
        self.image
            .node_names
            .get(&node_instance_id)
            .map(String::as_str)
    }

    pub fn is_completed(&self, node_instance_id: Uuid) -> bool {
        self.image.completed_nodes.contains(&node_instance_id)
    }

    pub fn is_edge_skipped(&self, from: Uuid, to: Uuid) -> bool {
        self.image.skipped_edges.contains(&(from, to))
    }

    pub fn upstream_of(&self, node_instance_id: Uuid) -> HashSet<Uuid> {
        self.image
            .dependencies_full
            .get(&node_instance_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn completed_nodes(&self) -> &HashSet<Uuid> {
        &self.image.completed_nodes
    }

    pub fn last_event_sequence(&self) -> u64 {
        self.image.last_event_sequence
    }

    pub fn set_last_event_sequence(&mut self, sequence: u64) {
        self.image.last_event_sequence = sequence;
    }

    pub fn updates_since_snapshot(&self) -> u32 {
        self.updates_since_snapshot
    }

    pub fn reset_snapshot_counter(&mut self) {
        self.updates_since_snapshot = 0;
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    /// Internal consistency probe. Ready work sitting undispatched past the
    /// grace period, or a completed node without an output, is unhealthy.
    pub fn health_check(&self, grace: chrono::Duration) -> ContextHealth {
        let mut reasons = Vec::new();
        let now = Utc::now();

        if !self.image.pending_triggers.is_empty() {
            let reference = self.last_dispatch.unwrap_or(self.last_activity);
            if now - reference > grace {
                reasons.push(format!(
                    "{} ready node(s) undispatched for longer than the grace period",
                    self.image.pending_triggers.len()
                ));
            }
        }

        for id in &self.image.completed_nodes {
            if !self.image.node_outputs.contains_key(id) {
                reasons.push(format!("completed node {id} has no recorded output"));
            }
        }

        for id in &self.image.current_executing {
            if self.image.node_states.get(id) != Some(&NodeState::Executing) {
                reasons.push(format!(
                    "node {id} is in the executing set but not in executing state"
                ));
            }
        }

        ContextHealth {
            healthy: reasons.is_empty(),
            reasons,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
