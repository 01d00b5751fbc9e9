//! Workflow definition files: the JSON shape the CLI loads and turns into
//! a publishable template plus processor registrations.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use uuid::Uuid;

use braid_core::model::{EdgeCondition, NodeType, Position, Processor, ProcessorKind};
use braid_core::store::{ConnectionSpec, NodeSpec, Store, TemplateSpec, WorkflowStore};

#[derive(Debug, Deserialize)]
pub struct WorkflowFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub processors: Vec<ProcessorDef>,
    pub nodes: Vec<NodeDef>,
    pub connections: Vec<ConnectionDef>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessorDef {
    pub name: String,
    pub kind: ProcessorKind,
}

#[derive(Debug, Deserialize)]
pub struct NodeDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub position: Position,
    /// Processor names from the `processors` section.
    #[serde(default)]
    pub processors: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionDef {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<EdgeCondition>,
}

impl WorkflowFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Register the file's processors and return the template spec, plus
    /// the synthetic user id human tasks will be assigned to.
    pub async fn register(
        &self,
        store: &dyn Store,
        creator_id: Uuid,
        human_user_id: Uuid,
    ) -> Result<TemplateSpec> {
        let now = chrono::Utc::now();
        let mut processor_ids: HashMap<&str, Uuid> = HashMap::new();

        for def in &self.processors {
            let processor_id = Uuid::new_v4();
            let (user_id, agent_id) = match def.kind {
                ProcessorKind::Human => (Some(human_user_id), None),
                ProcessorKind::Agent => (None, Some(Uuid::new_v4())),
                ProcessorKind::Mix => (Some(human_user_id), Some(Uuid::new_v4())),
            };
            store
                .register_processor(Processor {
                    processor_id,
                    name: def.name.clone(),
                    kind: def.kind,
                    user_id,
                    agent_id,
                    created_at: now,
                    updated_at: now,
                    is_deleted: false,
                })
                .await?;
            processor_ids.insert(def.name.as_str(), processor_id);
        }

        let mut nodes = Vec::with_capacity(self.nodes.len());
        for def in &self.nodes {
            let mut ids = Vec::new();
            for processor_name in &def.processors {
                match processor_ids.get(processor_name.as_str()) {
                    Some(id) => ids.push(*id),
                    None => bail!(
                        "node '{}' references unknown processor '{processor_name}'",
                        def.name
                    ),
                }
            }
            nodes.push(NodeSpec {
                name: def.name.clone(),
                description: def.description.clone(),
                node_type: def.node_type,
                position: def.position,
                processor_ids: ids,
            });
        }

        let connections = self
            .connections
            .iter()
            .map(|def| ConnectionSpec {
                from_node: def.from.clone(),
                to_node: def.to.clone(),
                condition: def.condition.clone(),
            })
            .collect();

        Ok(TemplateSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            creator_id,
            parent_base_id: None,
            nodes,
            connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "name": "review-pipeline",
        "processors": [
            {"name": "writer", "kind": "agent"},
            {"name": "reviewer", "kind": "human"}
        ],
        "nodes": [
            {"name": "start", "type": "start"},
            {"name": "draft", "type": "processor", "processors": ["writer"]},
            {"name": "review", "type": "processor", "processors": ["reviewer"]},
            {"name": "end", "type": "end"}
        ],
        "connections": [
            {"from": "start", "to": "draft"},
            {"from": "draft", "to": "review"},
            {"from": "review", "to": "end"}
        ]
    }"#;

    #[test]
    fn sample_parses() {
        let file: WorkflowFile = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(file.nodes.len(), 4);
        assert_eq!(file.processors.len(), 2);
        assert_eq!(file.connections.len(), 3);
    }

    #[tokio::test]
    async fn register_builds_spec_with_bindings() {
        let file: WorkflowFile = serde_json::from_str(SAMPLE).unwrap();
        let store = braid_core::store::MemoryStore::new();
        let spec = file
            .register(&store, Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        let draft = spec.nodes.iter().find(|n| n.name == "draft").unwrap();
        assert_eq!(draft.processor_ids.len(), 1);
    }

    #[tokio::test]
    async fn unknown_processor_reference_fails() {
        let mut file: WorkflowFile = serde_json::from_str(SAMPLE).unwrap();
        file.nodes[1].processors = vec!["ghost".into()];
        let store = braid_core::store::MemoryStore::new();
        let err = file
            .register(&store, Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
