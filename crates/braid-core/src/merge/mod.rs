//! Template merge: flatten a tree of subdivision executions back into one
//! static workflow template.
//!
//! Every selected node is replaced, in one pass, by the business body of
//! its child workflow, recursively when a child's own node is also
//! selected. Preserved nodes and their connections copy through; boundary
//! connections fan out to the replacement's entry and exit points. The
//! result is published as a new template base parented under the root's.

pub mod tree;

pub use tree::{TemplateTree, TemplateTreeNode, TreeStatistics};

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::{
    EdgeCondition, Node, NodeConnection, NodeType, Position, TemplateGraph, Workflow,
};
use crate::store::{Store, WorkflowStore};
use crate::{BraidError, Result};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub subdivision_id: Uuid,
    pub subdivision_name: String,
    pub replaced_node_name: String,
    pub workflow_base_id: Uuid,
    pub depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergePreview {
    pub root_workflow_base_id: Uuid,
    pub candidates: Vec<MergeCandidate>,
    pub statistics: TreeStatistics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeStats {
    pub nodes_created: usize,
    pub connections_created: usize,
    pub replacements: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub new_workflow_base_id: Uuid,
    pub new_workflow_id: Uuid,
    pub name: String,
    pub stats: MergeStats,
}

// ---------------------------------------------------------------------------
// Drafts
// ---------------------------------------------------------------------------

/// A node of the merged template before ids are allocated. Keys are
/// `node_base_id` for preserved root nodes and the composite
/// `node_base_id@subdivision_name` for expanded nodes, so repeated base ids
/// across different subdivisions cannot collide.
#[derive(Debug, Clone)]
struct DraftNode {
    key: String,
    name: String,
    description: String,
    node_type: NodeType,
    position: Position,
    /// Template node whose processor bindings carry over.
    copy_bindings_from: Option<Uuid>,
}

#[derive(Debug, Clone)]
struct DraftConnection {
    from: String,
    to: String,
    condition: Option<EdgeCondition>,
}

/// An expanded child body: its business nodes, internal connections, and
/// the keys boundary connections attach to.
#[derive(Debug, Clone, Default)]
struct Fragment {
    nodes: Vec<DraftNode>,
    connections: Vec<DraftConnection>,
    entries: Vec<String>,
    exits: Vec<String>,
}

impl Fragment {
    /// Translate the fragment so its bounding-box center lands on `target`.
    fn translate_to(&mut self, target: Position) {
        if self.nodes.is_empty() {
            return;
        }
        let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
        let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
        for node in &self.nodes {
            min_x = min_x.min(node.position.x);
            min_y = min_y.min(node.position.y);
            max_x = max_x.max(node.position.x);
            max_y = max_y.max(node.position.y);
        }
        let dx = target.x - (min_x + max_x) / 2.0;
        let dy = target.y - (min_y + max_y) / 2.0;
        for node in &mut self.nodes {
            node.position.x += dx;
            node.position.y += dy;
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct MergeEngine {
    store: Arc<dyn Store>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Candidates and tree statistics, without writing anything.
    pub async fn preview_merge(&self, root_instance_id: Uuid) -> Result<MergePreview> {
        let tree = TemplateTree::build(self.store.as_ref(), root_instance_id).await?;
        let candidates = tree
            .candidates()
            .into_iter()
            .map(|node| MergeCandidate {
                subdivision_id: node.subdivision_id.unwrap_or_default(),
                subdivision_name: node.subdivision_name.clone(),
                replaced_node_name: node.replaced_node_name.clone().unwrap_or_default(),
                workflow_base_id: node.workflow_base_id,
                depth: node.depth,
            })
            .collect();
        Ok(MergePreview {
            root_workflow_base_id: tree.root().workflow_base_id,
            candidates,
            statistics: tree.statistics(),
        })
    }

    /// Produce and persist the flattened template.
    pub async fn execute_merge(
        &self,
        root_instance_id: Uuid,
        selected_subdivisions: &[Uuid],
        user_id: Uuid,
    ) -> Result<MergeOutcome> {
        if selected_subdivisions.is_empty() {
            return Err(BraidError::Validation(
                "at least one subdivision must be selected for a merge".into(),
            ));
        }

        let tree = TemplateTree::build(self.store.as_ref(), root_instance_id).await?;
        let merge_indices: HashSet<usize> =
            tree.merge_set(selected_subdivisions)?.into_iter().collect();
        let root_graph = self.store.get_template(tree.root().workflow_id).await?;

        // Root-level replacements: children of the root that are in the set.
        let mut replaced_at_root: HashMap<Uuid, usize> = HashMap::new();
        for &child in tree.children_of(0) {
            if merge_indices.contains(&child) {
                let base = tree.nodes[child].replaced_node_base_id.ok_or_else(|| {
                    BraidError::FatalInternal("tree child without replaced node".into())
                })?;
                replaced_at_root.insert(base, child);
            }
        }
        if replaced_at_root.is_empty() {
            return Err(BraidError::Validation(
                "selected subdivisions do not replace any node of the root template".into(),
            ));
        }

        // Preserved nodes copy straight through under new identities.
        let mut draft_nodes: Vec<DraftNode> = Vec::new();
        let mut draft_connections: Vec<DraftConnection> = Vec::new();

        for node in &root_graph.nodes {
            if replaced_at_root.contains_key(&node.node_base_id) {
                continue;
            }
            draft_nodes.push(DraftNode {
                key: node.node_base_id.to_string(),
                name: node.name.clone(),
                description: node.description.clone(),
                node_type: node.node_type,
                position: node.position,
                copy_bindings_from: Some(node.node_id),
            });
        }

        // Expand each root-level replacement (recursion handles deeper
        // selections) and translate it onto the replaced node's position.
        let mut fragments: HashMap<Uuid, Fragment> = HashMap::new();
        for (&replaced_base, &child_index) in &replaced_at_root {
            let mut fragment = self.expand(&tree, &merge_indices, child_index).await?;
            let target = root_graph
                .nodes
                .iter()
                .find(|n| n.node_base_id == replaced_base)
                .map(|n| n.position)
                .unwrap_or(tree.nodes[child_index].replaced_position);
            fragment.translate_to(target);

            draft_nodes.extend(fragment.nodes.iter().cloned());
            draft_connections.extend(fragment.connections.iter().cloned());
            fragments.insert(replaced_base, fragment);
        }

        // Rebuild root connections under the replacement maps.
        let sources = |base: Uuid| -> Vec<String> {
            match fragments.get(&base) {
                Some(fragment) => fragment.exits.clone(),
                None => vec![base.to_string()],
            }
        };
        let sinks = |base: Uuid| -> Vec<String> {
            match fragments.get(&base) {
                Some(fragment) => fragment.entries.clone(),
                None => vec![base.to_string()],
            }
        };
        for conn in &root_graph.connections {
            for from in sources(conn.from_node_base_id) {
                for to in sinks(conn.to_node_base_id) {
                    draft_connections.push(DraftConnection {
                        from: from.clone(),
                        to,
                        condition: conn.condition.clone(),
                    });
                }
            }
        }

        self.materialize(
            &root_graph,
            draft_nodes,
            draft_connections,
            replaced_at_root.len(),
            user_id,
        )
        .await
    }

    /// Expand one tree node into a fragment of business nodes. A business
    /// node that is itself a selected replacement splices in its own
    /// fragment recursively.
    fn expand<'a>(
        &'a self,
        tree: &'a TemplateTree,
        merge_indices: &'a HashSet<usize>,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Fragment>> + Send + 'a>> {
        Box::pin(async move {
            let tree_node = &tree.nodes[index];
            let graph = self.store.get_template(tree_node.workflow_id).await?;

            let business: Vec<&Node> = graph
                .nodes
                .iter()
                .filter(|n| n.node_type == NodeType::Processor)
                .collect();
            if business.is_empty() {
                return Err(BraidError::Validation(format!(
                    "subdivision '{}' has no business nodes to merge",
                    tree_node.subdivision_name
                )));
            }
            let business_bases: HashSet<Uuid> =
                business.iter().map(|n| n.node_base_id).collect();

            let start_base = graph
                .start_node()
                .map(|n| n.node_base_id)
                .ok_or_else(|| {
                    BraidError::Validation(format!(
                        "subdivision '{}' template has no start node",
                        tree_node.subdivision_name
                    ))
                })?;
            let end_bases: HashSet<Uuid> =
                graph.end_nodes().iter().map(|n| n.node_base_id).collect();

            // Entry points: business successors of start; fall back to
            // business nodes with no internal inbound edge.
            let mut entry_bases: Vec<Uuid> = graph
                .connections
                .iter()
                .filter(|c| c.from_node_base_id == start_base)
                .filter(|c| business_bases.contains(&c.to_node_base_id))
                .map(|c| c.to_node_base_id)
                .collect();
            if entry_bases.is_empty() {
                entry_bases = business
                    .iter()
                    .filter(|n| {
                        !graph.connections.iter().any(|c| {
                            c.to_node_base_id == n.node_base_id
                                && business_bases.contains(&c.from_node_base_id)
                        })
                    })
                    .map(|n| n.node_base_id)
                    .collect();
            }

            // Exit points: business predecessors of any end node; fall back
            // to business nodes with no internal outbound edge.
            let mut exit_bases: Vec<Uuid> = graph
                .connections
                .iter()
                .filter(|c| end_bases.contains(&c.to_node_base_id))
                .filter(|c| business_bases.contains(&c.from_node_base_id))
                .map(|c| c.from_node_base_id)
                .collect();
            if exit_bases.is_empty() {
                exit_bases = business
                    .iter()
                    .filter(|n| {
                        !graph.connections.iter().any(|c| {
                            c.from_node_base_id == n.node_base_id
                                && business_bases.contains(&c.to_node_base_id)
                        })
                    })
                    .map(|n| n.node_base_id)
                    .collect();
            }

            // Deeper replacements within this template.
            let mut replaced_here: HashMap<Uuid, usize> = HashMap::new();
            for &child in tree.children_of(index) {
                if merge_indices.contains(&child) {
                    if let Some(base) = tree.nodes[child].replaced_node_base_id {
                        replaced_here.insert(base, child);
                    }
                }
            }

            let mut fragment = Fragment::default();
            let mut inner_fragments: HashMap<Uuid, Fragment> = HashMap::new();

            for node in &business {
                if let Some(&child_index) = replaced_here.get(&node.node_base_id) {
                    let mut inner = self.expand(tree, merge_indices, child_index).await?;
                    inner.translate_to(node.position);
                    fragment.nodes.extend(inner.nodes.iter().cloned());
                    fragment.connections.extend(inner.connections.iter().cloned());
                    inner_fragments.insert(node.node_base_id, inner);
                } else {
                    fragment.nodes.push(DraftNode {
                        key: format!("{}@{}", node.node_base_id, tree_node.subdivision_name),
                        name: node.name.clone(),
                        description: node.description.clone(),
                        node_type: NodeType::Processor,
                        position: node.position,
                        copy_bindings_from: Some(node.node_id),
                    });
                }
            }

            let sources = |base: Uuid| -> Vec<String> {
                match inner_fragments.get(&base) {
                    Some(inner) => inner.exits.clone(),
                    None => vec![format!("{}@{}", base, tree_node.subdivision_name)],
                }
            };
            let sinks = |base: Uuid| -> Vec<String> {
                match inner_fragments.get(&base) {
                    Some(inner) => inner.entries.clone(),
                    None => vec![format!("{}@{}", base, tree_node.subdivision_name)],
                }
            };

            // Internal business-to-business connections.
            for conn in &graph.connections {
                if business_bases.contains(&conn.from_node_base_id)
                    && business_bases.contains(&conn.to_node_base_id)
                {
                    for from in sources(conn.from_node_base_id) {
                        for to in sinks(conn.to_node_base_id) {
                            fragment.connections.push(DraftConnection {
                                from: from.clone(),
                                to,
                                condition: conn.condition.clone(),
                            });
                        }
                    }
                }
            }

            fragment.entries = entry_bases.into_iter().flat_map(&sinks).collect();
            fragment.exits = exit_bases.into_iter().flat_map(&sources).collect();

            if fragment.entries.is_empty() || fragment.exits.is_empty() {
                return Err(BraidError::Validation(format!(
                    "subdivision '{}' has no usable entry or exit points",
                    tree_node.subdivision_name
                )));
            }

            debug!(
                subdivision = %tree_node.subdivision_name,
                nodes = fragment.nodes.len(),
                entries = fragment.entries.len(),
                exits = fragment.exits.len(),
                "expanded replacement fragment"
            );
            Ok(fragment)
        })
    }

    /// Allocate real identities, validate the merged topology, persist.
    async fn materialize(
        &self,
        root_graph: &TemplateGraph,
        draft_nodes: Vec<DraftNode>,
        draft_connections: Vec<DraftConnection>,
        replacements: usize,
        user_id: Uuid,
    ) -> Result<MergeOutcome> {
        let now = Utc::now();
        let ordinal = self
            .store
            .merged_child_count(root_graph.workflow.workflow_base_id)
            .await?
            + 1;
        let name = format!("{}_merged_{}", root_graph.workflow.name, ordinal);

        let workflow = Workflow {
            workflow_id: Uuid::new_v4(),
            workflow_base_id: Uuid::new_v4(),
            name: name.clone(),
            description: format!(
                "Merged from '{}' with {replacements} replacement(s)",
                root_graph.workflow.name
            ),
            version: 1,
            parent_base_id: Some(root_graph.workflow.workflow_base_id),
            creator_id: user_id,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };

        let mut key_to_node: HashMap<String, Node> = HashMap::new();
        let mut bindings_to_copy: Vec<(Uuid, Uuid)> = Vec::new(); // (source node_id, new node_id)
        let mut nodes = Vec::with_capacity(draft_nodes.len());
        for draft in &draft_nodes {
            if key_to_node.contains_key(&draft.key) {
                return Err(BraidError::FatalInternal(format!(
                    "merge produced a duplicate node key '{}'",
                    draft.key
                )));
            }
            let node = Node {
                node_id: Uuid::new_v4(),
                node_base_id: Uuid::new_v4(),
                workflow_id: workflow.workflow_id,
                name: draft.name.clone(),
                description: draft.description.clone(),
                node_type: draft.node_type,
                position: draft.position,
                created_at: now,
                updated_at: now,
                is_deleted: false,
            };
            if let Some(source) = draft.copy_bindings_from {
                bindings_to_copy.push((source, node.node_id));
            }
            key_to_node.insert(draft.key.clone(), node.clone());
            nodes.push(node);
        }

        let mut seen_pairs: HashSet<(Uuid, Uuid)> = HashSet::new();
        let mut connections = Vec::new();
        for draft in &draft_connections {
            let from = key_to_node.get(&draft.from).ok_or_else(|| {
                BraidError::FatalInternal(format!("connection references unknown key '{}'", draft.from))
            })?;
            let to = key_to_node.get(&draft.to).ok_or_else(|| {
                BraidError::FatalInternal(format!("connection references unknown key '{}'", draft.to))
            })?;
            if !seen_pairs.insert((from.node_base_id, to.node_base_id)) {
                continue;
            }
            connections.push(NodeConnection {
                connection_id: Uuid::new_v4(),
                workflow_id: workflow.workflow_id,
                from_node_base_id: from.node_base_id,
                to_node_base_id: to.node_base_id,
                condition: draft.condition.clone(),
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
        // Exactly one start, at least one end, no dangling endpoints, no
        // cycles.
        graph.validate()?;

        // No orphans: every node of a multi-node template participates in
        // at least one connection.
        if graph.nodes.len() > 1 {
            for node in &graph.nodes {
                let connected = graph.connections.iter().any(|c| {
                    c.from_node_base_id == node.node_base_id
                        || c.to_node_base_id == node.node_base_id
                });
                if !connected {
                    return Err(BraidError::Validation(format!(
                        "merged template would orphan node '{}'",
                        node.name
                    )));
                }
            }
        }

        let stats = MergeStats {
            nodes_created: graph.nodes.len(),
            connections_created: graph.connections.len(),
            replacements,
        };
        let outcome = MergeOutcome {
            new_workflow_base_id: graph.workflow.workflow_base_id,
            new_workflow_id: graph.workflow.workflow_id,
            name,
            stats: stats.clone(),
        };

        self.store.publish_template_graph(graph).await?;
        for (source, target) in bindings_to_copy {
            for processor in self.store.node_processors(source).await? {
                self.store
                    .bind_processor(target, processor.processor_id)
                    .await?;
            }
        }

        info!(
            new_base = %outcome.new_workflow_base_id,
            name = %outcome.name,
            nodes = stats.nodes_created,
            connections = stats.connections_created,
            "merged template published"
        );
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
