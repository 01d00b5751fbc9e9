//! Workflow template types: versioned definitions, nodes, connections and
//! processor bindings. Templates are immutable once published; the merge
//! engine creates new versions rather than editing in place.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BraidError, Result};

// ---------------------------------------------------------------------------
// Workflow (template) version row
// ---------------------------------------------------------------------------

/// One published version of a workflow template.
///
/// `workflow_base_id` is identity across versions; `workflow_id` identifies
/// this version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: Uuid,
    pub workflow_base_id: Uuid,
    pub name: String,
    pub description: String,
    pub version: u32,
    /// Merged templates are parented under the base they were merged from.
    pub parent_base_id: Option<Uuid>,
    pub creator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// The kind of a template node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Processor,
    End,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Processor => write!(f, "processor"),
            Self::End => write!(f, "end"),
        }
    }
}

/// Editor canvas position of a node. Carried through merges so replacement
/// bodies land where the replaced node sat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A vertex of a workflow template.
///
/// `node_base_id` is identity across template versions; `node_id` identifies
/// this version's copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: Uuid,
    pub node_base_id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub description: String,
    pub node_type: NodeType,
    pub position: Position,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Predicate evaluated over the source node's output.
///
/// An unsatisfied condition turns the edge into a "skip" edge: the dependency
/// counts as satisfied, and downstream receives a null entry for that source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeCondition {
    /// Dot-separated path into the source output (`"result.score"`).
    pub field: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Exists,
}

impl EdgeCondition {
    /// Evaluate against the source node's output. A missing field satisfies
    /// only `Ne` (and fails `Exists`).
    pub fn evaluate(&self, output: &serde_json::Value) -> bool {
        let found = lookup_path(output, &self.field);
        match (self.op, found) {
            (ConditionOp::Exists, v) => v.is_some(),
            (ConditionOp::Eq, Some(v)) => *v == self.value,
            (ConditionOp::Eq, None) => false,
            (ConditionOp::Ne, Some(v)) => *v != self.value,
            (ConditionOp::Ne, None) => true,
            (ConditionOp::Gt, Some(v)) => compare_numbers(v, &self.value, |a, b| a > b),
            (ConditionOp::Lt, Some(v)) => compare_numbers(v, &self.value, |a, b| a < b),
            (ConditionOp::Gt | ConditionOp::Lt, None) => false,
        }
    }
}

fn lookup_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn compare_numbers(a: &serde_json::Value, b: &serde_json::Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// A directed, optionally conditional edge between two template nodes.
///
/// Endpoints are node-base identities so the same edge maps cleanly onto
/// node instances of any execution of this template version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConnection {
    pub connection_id: Uuid,
    pub workflow_id: Uuid,
    pub from_node_base_id: Uuid,
    pub to_node_base_id: Uuid,
    pub condition: Option<EdgeCondition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

/// What a processor resolves to at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    Human,
    Agent,
    Mix,
}

impl std::fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Agent => write!(f, "agent"),
            Self::Mix => write!(f, "mix"),
        }
    }
}

/// A work processor: a human user, an agent, or both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processor {
    pub processor_id: Uuid,
    pub name: String,
    pub kind: ProcessorKind,
    pub user_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

impl Processor {
    /// A processor is well-formed when its references match its kind.
    pub fn validate(&self) -> Result<()> {
        let ok = match self.kind {
            ProcessorKind::Human => self.user_id.is_some(),
            ProcessorKind::Agent => self.agent_id.is_some(),
            ProcessorKind::Mix => self.user_id.is_some() && self.agent_id.is_some(),
        };
        if ok {
            Ok(())
        } else {
            Err(BraidError::Validation(format!(
                "processor '{}' of kind {} is missing its {} reference",
                self.name,
                self.kind,
                match self.kind {
                    ProcessorKind::Human => "user",
                    ProcessorKind::Agent => "agent",
                    ProcessorKind::Mix => "user or agent",
                }
            )))
        }
    }
}

/// Many-to-many link from a template node to a processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProcessor {
    pub node_id: Uuid,
    pub processor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Template graph aggregate
// ---------------------------------------------------------------------------

/// One template version with its nodes and connections, loaded together.
#[derive(Debug, Clone)]
pub struct TemplateGraph {
    pub workflow: Workflow,
    pub nodes: Vec<Node>,
    pub connections: Vec<NodeConnection>,
}

impl TemplateGraph {
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Start)
    }

    pub fn end_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::End)
            .collect()
    }

    /// Upstream node-base ids per node-base id.
    pub fn upstream_map(&self) -> HashMap<Uuid, HashSet<Uuid>> {
        let mut map: HashMap<Uuid, HashSet<Uuid>> = HashMap::new();
        for node in &self.nodes {
            map.entry(node.node_base_id).or_default();
        }
        for conn in &self.connections {
            map.entry(conn.to_node_base_id)
                .or_default()
                .insert(conn.from_node_base_id);
        }
        map
    }

    /// Downstream node-base ids per node-base id, in connection insertion
    /// order. Insertion order is what makes dispatch deterministic.
    pub fn successor_map(&self) -> HashMap<Uuid, Vec<Uuid>> {
        let mut map: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for node in &self.nodes {
            map.entry(node.node_base_id).or_default();
        }
        for conn in &self.connections {
            let entry = map.entry(conn.from_node_base_id).or_default();
            if !entry.contains(&conn.to_node_base_id) {
                entry.push(conn.to_node_base_id);
            }
        }
        map
    }

    /// Structural publish-time validation: exactly one start node, at least
    /// one end node, connection endpoints exist, and the graph is acyclic.
    pub fn validate(&self) -> Result<()> {
        let starts = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Start)
            .count();
        if starts != 1 {
            return Err(BraidError::Validation(format!(
                "template '{}' must have exactly one start node, found {starts}",
                self.workflow.name
            )));
        }
        if self.end_nodes().is_empty() {
            return Err(BraidError::Validation(format!(
                "template '{}' must have at least one end node",
                self.workflow.name
            )));
        }

        let known: HashSet<Uuid> = self.nodes.iter().map(|n| n.node_base_id).collect();
        for conn in &self.connections {
            if !known.contains(&conn.from_node_base_id) || !known.contains(&conn.to_node_base_id) {
                return Err(BraidError::Validation(format!(
                    "template '{}' has a connection with a dangling endpoint",
                    self.workflow.name
                )));
            }
        }

        if has_cycle(&known, &self.connections) {
            return Err(BraidError::Validation(format!(
                "template '{}' contains a dependency cycle",
                self.workflow.name
            )));
        }

        Ok(())
    }
}

/// Kahn's algorithm over node-base ids; true when some node never reaches
/// in-degree zero.
pub fn has_cycle(node_ids: &HashSet<Uuid>, connections: &[NodeConnection]) -> bool {
    let mut in_degree: HashMap<Uuid, usize> = node_ids.iter().map(|id| (*id, 0)).collect();
    let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

    for conn in connections {
        if let Some(deg) = in_degree.get_mut(&conn.to_node_base_id) {
            *deg += 1;
        }
        dependents
            .entry(conn.from_node_base_id)
            .or_default()
            .push(conn.to_node_base_id);
    }

    let mut queue: Vec<Uuid> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut processed = 0;

    while let Some(id) = queue.pop() {
        processed += 1;
        if let Some(deps) = dependents.get(&id) {
            for dep in deps {
                if let Some(deg) = in_degree.get_mut(dep) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(*dep);
                    }
                }
            }
        }
    }

    processed != node_ids.len()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(workflow_id: Uuid, name: &str, node_type: NodeType) -> Node {
        let now = Utc::now();
        Node {
            node_id: Uuid::new_v4(),
            node_base_id: Uuid::new_v4(),
            workflow_id,
            name: name.into(),
            description: String::new(),
            node_type,
            position: Position::default(),
            created_at: now,
            updated_at: now,
            is_deleted: false,
        }
    }

    fn connect(workflow_id: Uuid, from: &Node, to: &Node) -> NodeConnection {
        let now = Utc::now();
        NodeConnection {
            connection_id: Uuid::new_v4(),
            workflow_id,
            from_node_base_id: from.node_base_id,
            to_node_base_id: to.node_base_id,
            condition: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        }
    }

    fn graph(nodes: Vec<Node>, connections: Vec<NodeConnection>) -> TemplateGraph {
        let now = Utc::now();
        TemplateGraph {
            workflow: Workflow {
                workflow_id: Uuid::new_v4(),
                workflow_base_id: Uuid::new_v4(),
                name: "test".into(),
                description: String::new(),
                version: 1,
                parent_base_id: None,
                creator_id: Uuid::new_v4(),
                created_at: now,
                updated_at: now,
                is_deleted: false,
            },
            nodes,
            connections,
        }
    }

    #[test]
    fn linear_template_validates() {
        let wf = Uuid::new_v4();
        let start = node(wf, "start", NodeType::Start);
        let a = node(wf, "a", NodeType::Processor);
        let end = node(wf, "end", NodeType::End);
        let conns = vec![connect(wf, &start, &a), connect(wf, &a, &end)];
        let g = graph(vec![start, a, end], conns);
        g.validate().expect("linear template is valid");
    }

    #[test]
    fn missing_start_rejected() {
        let wf = Uuid::new_v4();
        let a = node(wf, "a", NodeType::Processor);
        let end = node(wf, "end", NodeType::End);
        let conns = vec![connect(wf, &a, &end)];
        let g = graph(vec![a, end], conns);
        let err = g.validate().unwrap_err();
        assert!(err.to_string().contains("start"));
    }

    #[test]
    fn cycle_rejected() {
        let wf = Uuid::new_v4();
        let start = node(wf, "start", NodeType::Start);
        let a = node(wf, "a", NodeType::Processor);
        let b = node(wf, "b", NodeType::Processor);
        let end = node(wf, "end", NodeType::End);
        let conns = vec![
            connect(wf, &start, &a),
            connect(wf, &a, &b),
            connect(wf, &b, &a),
            connect(wf, &b, &end),
        ];
        let g = graph(vec![start, a, b, end], conns);
        let err = g.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn dangling_endpoint_rejected() {
        let wf = Uuid::new_v4();
        let start = node(wf, "start", NodeType::Start);
        let end = node(wf, "end", NodeType::End);
        let ghost = node(wf, "ghost", NodeType::Processor);
        let conns = vec![connect(wf, &start, &ghost), connect(wf, &start, &end)];
        let g = graph(vec![start, end], conns);
        let err = g.validate().unwrap_err();
        assert!(err.to_string().contains("dangling"));
    }

    #[test]
    fn successor_order_is_insertion_order() {
        let wf = Uuid::new_v4();
        let start = node(wf, "start", NodeType::Start);
        let a = node(wf, "a", NodeType::Processor);
        let b = node(wf, "b", NodeType::Processor);
        let end = node(wf, "end", NodeType::End);
        let conns = vec![
            connect(wf, &start, &a),
            connect(wf, &start, &b),
            connect(wf, &a, &end),
            connect(wf, &b, &end),
        ];
        let (sa, sb) = (start.node_base_id, (a.node_base_id, b.node_base_id));
        let g = graph(vec![start, a, b, end], conns);
        let successors = g.successor_map();
        assert_eq!(successors[&sa], vec![sb.0, sb.1]);
    }

    #[test]
    fn condition_eq_and_exists() {
        let cond = EdgeCondition {
            field: "result.approved".into(),
            op: ConditionOp::Eq,
            value: json!(true),
        };
        assert!(cond.evaluate(&json!({"result": {"approved": true}})));
        assert!(!cond.evaluate(&json!({"result": {"approved": false}})));
        assert!(!cond.evaluate(&json!({})));

        let exists = EdgeCondition {
            field: "score".into(),
            op: ConditionOp::Exists,
            value: serde_json::Value::Null,
        };
        assert!(exists.evaluate(&json!({"score": 1})));
        assert!(!exists.evaluate(&json!({"other": 1})));
    }

    #[test]
    fn condition_numeric_comparison() {
        let cond = EdgeCondition {
            field: "score".into(),
            op: ConditionOp::Gt,
            value: json!(50),
        };
        assert!(cond.evaluate(&json!({"score": 80})));
        assert!(!cond.evaluate(&json!({"score": 20})));
        assert!(!cond.evaluate(&json!({"score": "high"})));
    }

    #[test]
    fn processor_kind_reference_validation() {
        let now = Utc::now();
        let mut p = Processor {
            processor_id: Uuid::new_v4(),
            name: "reviewer".into(),
            kind: ProcessorKind::Mix,
            user_id: Some(Uuid::new_v4()),
            agent_id: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };
        assert!(p.validate().is_err());
        p.agent_id = Some(Uuid::new_v4());
        assert!(p.validate().is_ok());
    }
}
