//! The context payload handed to a processor with its task.
//!
//! Named fields replace the original ad-hoc JSON blobs: upstream outputs,
//! the global upstream summary, workflow metadata and attachments, with an
//! opaque `extra` map for extension.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow-level metadata included with every task payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMeta {
    pub instance_id: Option<Uuid>,
    pub workflow_base_id: Option<Uuid>,
    pub instance_name: String,
    pub executor_id: Option<Uuid>,
    pub input_data: serde_json::Value,
}

/// A file associated with a node, surfaced to human processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_id: Uuid,
    pub filename: String,
    pub content_type: String,
}

/// Structured context computed for one task.
///
/// `immediate_upstream` maps upstream node names to their outputs; a null
/// entry means the edge from that node was skipped by its condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextPayload {
    pub node_description: String,
    pub immediate_upstream: BTreeMap<String, serde_json::Value>,
    /// Short summaries for every completed transitive upstream node.
    pub all_upstream: BTreeMap<String, String>,
    pub workflow_meta: WorkflowMeta,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Extension point; subdivision reference results land here.
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ContextPayload {
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }
}

/// Render an output value as a one-line summary for upstream digests.
pub fn summarize_output(output: &serde_json::Value) -> String {
    const MAX: usize = 200;
    let rendered = match output {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "(no output)".into(),
        other => other.to_string(),
    };
    if rendered.chars().count() > MAX {
        let truncated: String = rendered.chars().take(MAX).collect();
        format!("{truncated}…")
    } else {
        rendered
    }
}
