//! Agent worker pool: a bounded set of workers draining the FIFO task
//! queue the engine routes agent tasks onto.
//!
//! Workers never hold the workflow lock while waiting on the agent
//! endpoint; they claim the task (lock), call out (no lock), then submit
//! the result through the same path humans use (lock again). A result
//! arriving after the workflow left `running` is discarded.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::client::{AgentCallError, AgentClient, AgentInvocation, AgentReply};
use crate::config::EngineConfig;
use crate::engine::{ExecutionEngine, Submitter};
use crate::model::TaskInstance;
use crate::BraidError;

pub struct AgentWorkerPool {
    engine: Arc<ExecutionEngine>,
    client: Arc<dyn AgentClient>,
    queue: async_channel::Receiver<Uuid>,
    config: EngineConfig,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl AgentWorkerPool {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        client: Arc<dyn AgentClient>,
        queue: async_channel::Receiver<Uuid>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            client,
            queue,
            config,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the configured number of workers.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() {
            return;
        }
        for worker_id in 0..self.config.agent_workers {
            let engine = self.engine.clone();
            let client = self.client.clone();
            let queue = self.queue.clone();
            let config = self.config.clone();
            handles.push(tokio::spawn(async move {
                worker_loop(worker_id, engine, client, queue, config).await;
            }));
        }
        info!(workers = self.config.agent_workers, "agent worker pool started");
    }

    /// Workers exit when the queue closes; abort any that are mid-wait.
    pub fn stop(&self) {
        self.queue.close();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }
}

async fn worker_loop(
    worker_id: usize,
    engine: Arc<ExecutionEngine>,
    client: Arc<dyn AgentClient>,
    queue: async_channel::Receiver<Uuid>,
    config: EngineConfig,
) {
    debug!(worker_id, "agent worker online");
    while let Ok(task_id) = queue.recv().await {
        // An unhandled error marks the task failed without crashing the
        // worker.
        if let Err(e) = process_task(&engine, client.as_ref(), task_id, &config).await {
            warn!(worker_id, %task_id, error = %e, "agent task processing error");
            if let Err(e) = engine.fail_task(task_id, e.to_string()).await {
                warn!(worker_id, %task_id, error = %e, "failed to record task failure");
            }
        }
    }
    debug!(worker_id, "agent worker offline");
}

async fn process_task(
    engine: &ExecutionEngine,
    client: &dyn AgentClient,
    task_id: Uuid,
    config: &EngineConfig,
) -> crate::Result<()> {
    let Some(task) = engine.begin_agent_task(task_id).await? else {
        debug!(%task_id, "task no longer runnable; skipping");
        return Ok(());
    };

    let invocation = build_invocation(&task);
    let mut attempt: u32 = 0;

    loop {
        match client.invoke(&invocation).await {
            Ok(reply) => {
                match engine
                    .submit_task_result(task_id, Submitter::Agent, reply.output_data, reply.summary)
                    .await
                {
                    Ok(_) => {}
                    // The workflow went terminal while we were on the wire;
                    // the result is discarded by design.
                    Err(BraidError::Conflict(reason)) => {
                        info!(%task_id, reason, "agent result discarded");
                    }
                    Err(e) => return Err(e),
                }
                return Ok(());
            }
            Err(AgentCallError::NonRetryable(reason)) => {
                return engine
                    .fail_task(task_id, format!("agent error: {reason}"))
                    .await;
            }
            Err(AgentCallError::Retryable(reason)) => {
                attempt += 1;
                if attempt > config.max_task_retries {
                    return engine
                        .fail_task(
                            task_id,
                            format!(
                                "agent error after {attempt} attempt(s): {reason}"
                            ),
                        )
                        .await;
                }
                engine.record_task_retry(task_id).await?;
                let backoff = backoff_delay(config.retry_backoff(), attempt);
                warn!(%task_id, attempt, ?backoff, reason, "agent call failed; backing off");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn build_invocation(task: &TaskInstance) -> AgentInvocation {
    AgentInvocation {
        task_title: task.title.clone(),
        task_description: task.description.clone(),
        context: task.context_data.clone(),
        input_data: task.input_data.clone(),
    }
}

/// Exponential backoff: base doubles per attempt.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << (attempt - 1).min(16))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
