use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Args;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use braid_core::config::BraidConfig;
use braid_core::dispatch::{
    AgentCallError, AgentClient, AgentInvocation, AgentReply, HttpAgentClient,
};
use braid_core::engine::{ExecuteWorkflowRequest, Submitter};
use braid_core::model::TaskStatus;
use braid_core::services::CoreServices;
use braid_core::store::{InstanceStore, MemoryStore, TaskStore, WorkflowStore};

use crate::definition::WorkflowFile;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the workflow definition JSON file.
    pub file: PathBuf,

    /// Workflow input as a JSON value.
    #[arg(long, default_value = "{}")]
    pub input: String,

    /// Answer auto-submitted for every human task (JSON). Without it, human
    /// tasks are listed and the run waits until they would block forever.
    #[arg(long)]
    pub human_answer: Option<String>,

    /// Call a real agent endpoint instead of the built-in simulator.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Give up after this many seconds.
    #[arg(long, default_value_t = 120)]
    pub timeout_seconds: u64,
}

/// Built-in agent simulator for dry runs: echoes the task back.
struct SimulatedAgent;

#[async_trait]
impl AgentClient for SimulatedAgent {
    async fn invoke(
        &self,
        invocation: &AgentInvocation,
    ) -> std::result::Result<AgentReply, AgentCallError> {
        Ok(AgentReply {
            output_data: json!({
                "ok": true,
                "task": invocation.task_title,
            }),
            summary: Some(format!("simulated output for '{}'", invocation.task_title)),
        })
    }
}

pub async fn run(args: RunArgs) -> Result<()> {
    let input: serde_json::Value =
        serde_json::from_str(&args.input).context("--input is not valid JSON")?;
    let human_answer: Option<serde_json::Value> = args
        .human_answer
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--human-answer is not valid JSON")?;

    let file = WorkflowFile::load(&args.file)?;

    let mut config = BraidConfig::load_or_default();
    if let Some(endpoint) = &args.endpoint {
        config.agent.endpoint = endpoint.clone();
    }

    let client: Arc<dyn AgentClient> = if args.endpoint.is_some() {
        Arc::new(HttpAgentClient::new(&config.agent)?)
    } else {
        Arc::new(SimulatedAgent)
    };

    let store = Arc::new(MemoryStore::new());
    let user_id = Uuid::new_v4();
    let spec = file.register(store.as_ref(), user_id, user_id).await?;
    let graph = store.publish_template(spec).await?;

    let services = CoreServices::new(config, store.clone(), client);
    services.start();

    let instance = services
        .engine
        .execute_workflow(ExecuteWorkflowRequest {
            workflow_base_id: graph.workflow.workflow_base_id,
            instance_name: format!("{}-cli", graph.workflow.name),
            input,
            metadata: json!({"source": "braid-cli"}),
            executor_id: user_id,
        })
        .await?;
    info!(instance_id = %instance.instance_id, "workflow started");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_seconds);
    let final_instance = loop {
        let current = services.store.get_instance(instance.instance_id).await?;
        if current.status.is_terminal() {
            break current;
        }
        if tokio::time::Instant::now() > deadline {
            services.shutdown();
            bail!("workflow did not finish within {}s", args.timeout_seconds);
        }

        // Drive assigned human tasks from the terminal.
        let open = services
            .store
            .list_user_tasks(user_id, Some(TaskStatus::Assigned), 50)
            .await?;
        for task in open {
            match &human_answer {
                Some(answer) => {
                    info!(task = %task.title, "auto-submitting human task");
                    services
                        .engine
                        .submit_task_result(
                            task.task_instance_id,
                            Submitter::User(user_id),
                            answer.clone(),
                            Some("submitted by braid-cli".into()),
                        )
                        .await?;
                }
                None => {
                    println!(
                        "waiting on human task '{}' (task id {}); pass --human-answer to auto-submit",
                        task.title, task.task_instance_id
                    );
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    services.shutdown();

    println!("workflow '{}' finished: {}", file.name, final_instance.status);
    if let Some(output) = &final_instance.output_data {
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    if let Some(error) = &final_instance.error_message {
        println!("error: {error}");
    }
    Ok(())
}
