use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use uuid::Uuid;

use braid_core::store::{MemoryStore, WorkflowStore};

use crate::definition::WorkflowFile;

#[derive(Args)]
pub struct ValidateArgs {
    /// Path to the workflow definition JSON file.
    pub file: PathBuf,
}

/// Parse and structurally validate a definition file (single start node,
/// at least one end, acyclic, known processor references).
pub async fn validate(args: ValidateArgs) -> Result<()> {
    let file = WorkflowFile::load(&args.file)?;
    let store = MemoryStore::new();
    let spec = file
        .register(&store, Uuid::new_v4(), Uuid::new_v4())
        .await?;
    let graph = store.publish_template(spec).await?;

    println!(
        "ok: '{}' ({} nodes, {} connections)",
        graph.workflow.name,
        graph.nodes.len(),
        graph.connections.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn valid_file_passes() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "name": "mini",
                "nodes": [
                    {{"name": "start", "type": "start"}},
                    {{"name": "end", "type": "end"}}
                ],
                "connections": [{{"from": "start", "to": "end"}}]
            }}"#
        )
        .unwrap();

        validate(ValidateArgs {
            file: f.path().to_path_buf(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cyclic_file_fails() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"{{
                "name": "cyclic",
                "nodes": [
                    {{"name": "start", "type": "start"}},
                    {{"name": "a", "type": "processor"}},
                    {{"name": "b", "type": "processor"}},
                    {{"name": "end", "type": "end"}}
                ],
                "connections": [
                    {{"from": "start", "to": "a"}},
                    {{"from": "a", "to": "b"}},
                    {{"from": "b", "to": "a"}},
                    {{"from": "b", "to": "end"}}
                ]
            }}"#
        )
        .unwrap();

        let err = validate(ValidateArgs {
            file: f.path().to_path_buf(),
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }
}
