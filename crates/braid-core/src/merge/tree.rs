//! The template tree induced by a chain of subdivisions.
//!
//! Nodes are workflow templates, not subdivisions: the root is the root
//! instance's template, and each edge is labelled by the parent-template
//! node the child replaces. The tree is the single source of truth during a
//! merge; no subdivision-table queries happen after it is built.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::Position;
use crate::store::{InstanceStore, Store, SubdivisionStore, TaskStore, WorkflowStore};
use crate::{BraidError, Result};

/// One template in the tree. Index 0 is always the root.
#[derive(Debug, Clone)]
pub struct TemplateTreeNode {
    pub parent: Option<usize>,
    pub depth: usize,
    /// `None` for the root.
    pub subdivision_id: Option<Uuid>,
    pub subdivision_name: String,
    pub workflow_base_id: Uuid,
    /// The executed template version.
    pub workflow_id: Uuid,
    pub workflow_instance_id: Uuid,
    /// Identity of the parent-template node this child replaces.
    pub replaced_node_base_id: Option<Uuid>,
    pub replaced_node_name: Option<String>,
    /// Where the replacement body should be centered.
    pub replaced_position: Position,
}

/// Tree statistics for previews.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeStatistics {
    pub total_templates: usize,
    pub candidates: usize,
    pub max_depth: usize,
}

#[derive(Debug)]
pub struct TemplateTree {
    pub nodes: Vec<TemplateTreeNode>,
    children: HashMap<usize, Vec<usize>>,
}

impl TemplateTree {
    /// Walk the subdivision records under a root instance, breadth first.
    pub async fn build(store: &dyn Store, root_instance_id: Uuid) -> Result<Self> {
        let root_instance = store.get_instance(root_instance_id).await?;

        let mut tree = Self {
            nodes: vec![TemplateTreeNode {
                parent: None,
                depth: 0,
                subdivision_id: None,
                subdivision_name: String::new(),
                workflow_base_id: root_instance.workflow_base_id,
                workflow_id: root_instance.workflow_id,
                workflow_instance_id: root_instance_id,
                replaced_node_base_id: None,
                replaced_node_name: None,
                replaced_position: Position::default(),
            }],
            children: HashMap::new(),
        };

        let mut visited: HashSet<Uuid> = HashSet::from([root_instance_id]);
        let mut queue: Vec<usize> = vec![0];

        while let Some(index) = queue.pop() {
            let parent_instance_id = tree.nodes[index].workflow_instance_id;
            let parent_workflow_id = tree.nodes[index].workflow_id;
            let parent_graph = store.get_template(parent_workflow_id).await?;

            let subdivisions = store.list_instance_subdivisions(parent_instance_id).await?;
            for subdivision in subdivisions {
                let Some(child_instance_id) = subdivision.sub_workflow_instance_id else {
                    continue;
                };
                if !visited.insert(child_instance_id) {
                    continue;
                }

                let task = store.get_task(subdivision.original_task_id).await?;
                let node_row = store.get_node_instance(task.node_instance_id).await?;
                let position = parent_graph
                    .nodes
                    .iter()
                    .find(|n| n.node_id == node_row.node_id)
                    .map(|n| n.position)
                    .unwrap_or_default();

                let child_instance = store.get_instance(child_instance_id).await?;
                let child_index = tree.nodes.len();
                tree.nodes.push(TemplateTreeNode {
                    parent: Some(index),
                    depth: tree.nodes[index].depth + 1,
                    subdivision_id: Some(subdivision.subdivision_id),
                    subdivision_name: subdivision.subdivision_name.clone(),
                    workflow_base_id: child_instance.workflow_base_id,
                    workflow_id: child_instance.workflow_id,
                    workflow_instance_id: child_instance_id,
                    replaced_node_base_id: Some(node_row.node_base_id),
                    replaced_node_name: Some(node_row.name.clone()),
                    replaced_position: position,
                });
                tree.children.entry(index).or_default().push(child_index);
                queue.push(child_index);
            }
        }

        Ok(tree)
    }

    pub fn root(&self) -> &TemplateTreeNode {
        &self.nodes[0]
    }

    pub fn children_of(&self, index: usize) -> &[usize] {
        self.children.get(&index).map_or(&[], Vec::as_slice)
    }

    /// Every non-root template is a merge candidate.
    pub fn candidates(&self) -> Vec<&TemplateTreeNode> {
        self.nodes.iter().filter(|n| n.parent.is_some()).collect()
    }

    pub fn find_by_subdivision(&self, subdivision_id: Uuid) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.subdivision_id == Some(subdivision_id))
    }

    /// The recursive merge set: every selection plus every ancestor on its
    /// chain to the root, deepest first.
    pub fn merge_set(&self, selected: &[Uuid]) -> Result<Vec<usize>> {
        let mut set: HashSet<usize> = HashSet::new();
        for subdivision_id in selected {
            let mut index = self.find_by_subdivision(*subdivision_id).ok_or_else(|| {
                BraidError::NotFound(format!(
                    "subdivision {subdivision_id} is not part of this execution tree"
                ))
            })?;
            loop {
                set.insert(index);
                match self.nodes[index].parent {
                    Some(0) | None => break,
                    Some(parent) => index = parent,
                }
            }
        }
        let mut indices: Vec<usize> = set.into_iter().collect();
        indices.sort_by(|a, b| self.nodes[*b].depth.cmp(&self.nodes[*a].depth));
        Ok(indices)
    }

    pub fn max_depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    pub fn statistics(&self) -> TreeStatistics {
        TreeStatistics {
            total_templates: self.nodes.len(),
            candidates: self.nodes.len().saturating_sub(1),
            max_depth: self.max_depth(),
        }
    }
}
