//! Payload composition and output collation.
//!
//! Everything a processor sees about its task is assembled here: immediate
//! upstream outputs (null for skipped edges), the global upstream summary,
//! workflow metadata and node attachments. Collation is the inverse
//! direction: folding task outputs back into a single node output.

use std::collections::{HashSet, VecDeque};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::model::payload::summarize_output;
use crate::model::{
    ContextPayload, NodeInstance, TaskInstance, TaskKind, TaskStatus, WorkflowInstance,
    WorkflowMeta,
};
use crate::store::{InstanceStore, Store, TaskStore};
use crate::Result;

/// Build the context payload for one node's tasks.
pub async fn compose_payload(
    store: &dyn Store,
    ctx: &ExecutionContext,
    instance: &WorkflowInstance,
    node_row: &NodeInstance,
) -> Result<ContextPayload> {
    let description = if node_row.description.is_empty() {
        node_row.name.clone()
    } else {
        node_row.description.clone()
    };
    let mut payload = ContextPayload {
        node_description: description,
        workflow_meta: WorkflowMeta {
            instance_id: Some(instance.instance_id),
            workflow_base_id: Some(instance.workflow_base_id),
            instance_name: instance.name.clone(),
            executor_id: Some(instance.executor_id),
            input_data: instance.input_data.clone(),
        },
        ..Default::default()
    };

    // Immediate upstream: one entry per direct parent; a skipped edge
    // contributes an explicit null.
    for upstream in ctx.upstream_of(node_row.node_instance_id) {
        let name = ctx
            .node_name(upstream)
            .map(str::to_string)
            .unwrap_or_else(|| upstream.to_string());
        let value = if ctx.is_edge_skipped(upstream, node_row.node_instance_id) {
            Value::Null
        } else {
            ctx.output_of(upstream).cloned().unwrap_or(Value::Null)
        };
        payload.immediate_upstream.insert(name, value);
    }

    // Global upstream summary: every completed transitive ancestor.
    for ancestor in transitive_upstream(ctx, node_row.node_instance_id) {
        if !ctx.is_completed(ancestor) {
            continue;
        }
        let name = ctx
            .node_name(ancestor)
            .map(str::to_string)
            .unwrap_or_else(|| ancestor.to_string());
        let summary = ctx
            .output_of(ancestor)
            .map(summarize_output)
            .unwrap_or_default();
        payload.all_upstream.insert(name, summary);
    }

    payload.attachments = store.node_attachments(node_row.node_id).await?;
    Ok(payload)
}

/// BFS over the full dependency map.
fn transitive_upstream(ctx: &ExecutionContext, node_instance_id: Uuid) -> Vec<Uuid> {
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut queue: VecDeque<Uuid> = ctx.upstream_of(node_instance_id).into_iter().collect();
    let mut out = Vec::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        out.push(id);
        queue.extend(ctx.upstream_of(id));
    }
    out
}

/// Fold a node's completed task outputs into the node output.
///
/// A single task passes through unchanged. Several tasks (mixed nodes,
/// multiple bindings) merge into one map keyed by task kind, suffixed on
/// collision so nothing is silently dropped.
pub fn collate_task_outputs(tasks: &[TaskInstance]) -> Value {
    let completed: Vec<&TaskInstance> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .collect();

    match completed.as_slice() {
        [] => Value::Null,
        [single] => single.output_data.clone().unwrap_or(Value::Null),
        many => {
            let mut map = serde_json::Map::new();
            for task in many {
                let base_key = match task.kind {
                    TaskKind::Human => "human",
                    TaskKind::Agent => "agent",
                    TaskKind::Mixed => "mixed",
                };
                let mut key = base_key.to_string();
                let mut n = 1;
                while map.contains_key(&key) {
                    n += 1;
                    key = format!("{base_key}_{n}");
                }
                map.insert(key, task.output_data.clone().unwrap_or(Value::Null));
            }
            Value::Object(map)
        }
    }
}

/// The end node's output: one entry per immediate upstream node, null for
/// skipped edges.
pub fn collate_end_output(ctx: &ExecutionContext, end_node_instance_id: Uuid) -> Value {
    let mut map = serde_json::Map::new();
    for upstream in ctx.upstream_of(end_node_instance_id) {
        let name = ctx
            .node_name(upstream)
            .map(str::to_string)
            .unwrap_or_else(|| upstream.to_string());
        let value = if ctx.is_edge_skipped(upstream, end_node_instance_id) {
            Value::Null
        } else {
            ctx.output_of(upstream).cloned().unwrap_or(Value::Null)
        };
        map.insert(name, value);
    }
    Value::Object(map)
}

/// Results delivered to completion callbacks: the end-node output when one
/// exists, otherwise the joined outputs of completed tasks.
pub async fn collect_workflow_results(store: &dyn Store, instance_id: Uuid) -> Result<Value> {
    let nodes = store.list_node_instances(instance_id).await?;
    let end_output = nodes
        .iter()
        .find(|n| n.node_type == crate::model::NodeType::End)
        .and_then(|n| n.output_data.clone());
    if let Some(output) = end_output {
        return Ok(output);
    }

    let tasks = store.list_instance_tasks(instance_id).await?;
    let mut map = serde_json::Map::new();
    for task in tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
    {
        map.insert(
            task.title.clone(),
            task.output_data.clone().unwrap_or(Value::Null),
        );
    }
    Ok(json!({ "tasks": map }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task(kind: TaskKind, status: TaskStatus, output: Option<Value>) -> TaskInstance {
        let now = Utc::now();
        TaskInstance {
            task_instance_id: Uuid::new_v4(),
            node_instance_id: Uuid::new_v4(),
            workflow_instance_id: Uuid::new_v4(),
            processor_id: Uuid::new_v4(),
            kind,
            title: "t".into(),
            description: String::new(),
            status,
            assigned_user_id: None,
            assigned_agent_id: None,
            context_data: json!({}),
            input_data: json!({}),
            output_data: output,
            result_summary: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            is_deleted: false,
        }
    }

    #[test]
    fn single_task_output_passes_through() {
        let tasks = vec![task(
            TaskKind::Agent,
            TaskStatus::Completed,
            Some(json!({"ok": true})),
        )];
        assert_eq!(collate_task_outputs(&tasks), json!({"ok": true}));
    }

    #[test]
    fn mixed_outputs_merge_into_one_map() {
        let tasks = vec![
            task(
                TaskKind::Human,
                TaskStatus::Completed,
                Some(json!({"answer": "42"})),
            ),
            task(
                TaskKind::Agent,
                TaskStatus::Completed,
                Some(json!({"score": 0.9})),
            ),
        ];
        let collated = collate_task_outputs(&tasks);
        assert_eq!(collated["human"], json!({"answer": "42"}));
        assert_eq!(collated["agent"], json!({"score": 0.9}));
    }

    #[test]
    fn colliding_kinds_are_suffixed() {
        let tasks = vec![
            task(TaskKind::Human, TaskStatus::Completed, Some(json!(1))),
            task(TaskKind::Human, TaskStatus::Completed, Some(json!(2))),
        ];
        let collated = collate_task_outputs(&tasks);
        assert_eq!(collated["human"], json!(1));
        assert_eq!(collated["human_2"], json!(2));
    }

    #[test]
    fn cancelled_tasks_are_excluded_from_collation() {
        let tasks = vec![
            task(TaskKind::Agent, TaskStatus::Completed, Some(json!({"a": 1}))),
            task(TaskKind::Human, TaskStatus::Cancelled, Some(json!({"b": 2}))),
        ];
        assert_eq!(collate_task_outputs(&tasks), json!({"a": 1}));
    }
}
