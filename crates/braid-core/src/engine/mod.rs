//! The execution engine: state-machine driver for workflow, node and task
//! instances.
//!
//! Every mutating operation serializes on the per-workflow lock handed out
//! by the context manager; agent workers and human calls funnel through the
//! same `submit_task_result` path. Dispatching a node means creating one
//! task per processor binding and routing agent tasks onto the worker
//! queue; the queue is drained by the pool in `dispatch::agent`.

pub mod callbacks;
pub mod compose;

pub use callbacks::{CallbackRegistry, CompletionCallback, CompletionInfo};

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{ContextManager, ExecutionContext};
use crate::model::{
    EventKind, NodeInstance, NodeInstanceStatus, NodeType, ProcessorKind, TaskInstance, TaskKind,
    TaskStatus, WorkflowInstance, WorkflowInstanceStatus,
};
use crate::store::{EventStore, InstanceStore, Store, TaskStore, WorkflowStore};
use crate::{BraidError, Result};

// ---------------------------------------------------------------------------
// Requests and read models
// ---------------------------------------------------------------------------

/// Everything needed to start a workflow.
#[derive(Debug, Clone)]
pub struct ExecuteWorkflowRequest {
    pub workflow_base_id: Uuid,
    pub instance_name: String,
    pub input: Value,
    pub metadata: Value,
    pub executor_id: Uuid,
}

/// Who is submitting a task result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitter {
    User(Uuid),
    Agent,
}

/// Full read model of one instance for UI consumption.
#[derive(Debug, Clone)]
pub struct TaskFlow {
    pub instance: WorkflowInstance,
    pub nodes: Vec<NodeTaskFlow>,
}

#[derive(Debug, Clone)]
pub struct NodeTaskFlow {
    pub node: NodeInstance,
    pub tasks: Vec<TaskInstance>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    store: Arc<dyn Store>,
    contexts: Arc<ContextManager>,
    config: EngineConfig,
    agent_queue: async_channel::Sender<Uuid>,
    callbacks: Arc<CallbackRegistry>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        contexts: Arc<ContextManager>,
        config: EngineConfig,
        agent_queue: async_channel::Sender<Uuid>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        Self {
            store,
            contexts,
            config,
            agent_queue,
            callbacks,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Observable depth of the agent task queue.
    pub fn agent_queue_depth(&self) -> usize {
        self.agent_queue.len()
    }

    pub fn register_completion_callback(&self, instance_id: Uuid, callback: CompletionCallback) {
        self.callbacks.register(instance_id, callback);
    }

    pub fn callback_registry(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    // -----------------------------------------------------------------------
    // Workflow lifecycle
    // -----------------------------------------------------------------------

    /// Create and start a workflow instance from the current version of a
    /// template base. The start node auto-completes with the submitted
    /// input, which dispatches its successors.
    pub async fn execute_workflow(
        &self,
        request: ExecuteWorkflowRequest,
    ) -> Result<WorkflowInstance> {
        let graph = self
            .store
            .current_template(request.workflow_base_id)
            .await?;
        graph.validate()?;

        let now = Utc::now();
        let instance_id = Uuid::new_v4();
        let instance = WorkflowInstance {
            instance_id,
            workflow_id: graph.workflow.workflow_id,
            workflow_base_id: graph.workflow.workflow_base_id,
            executor_id: request.executor_id,
            name: request.instance_name.clone(),
            status: WorkflowInstanceStatus::Pending,
            input_data: request.input.clone(),
            output_data: None,
            error_message: None,
            execution_context: json!({}),
            node_dependencies: json!({}),
            completed_nodes: vec![],
            execution_trace: vec![],
            instance_metadata: request.metadata.clone(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            is_deleted: false,
        };
        self.store.insert_instance(instance.clone()).await?;

        // The node-instance set is fixed here; nothing is added or removed
        // after the workflow starts.
        let node_instances: Vec<NodeInstance> = graph
            .nodes
            .iter()
            .map(|node| NodeInstance {
                node_instance_id: Uuid::new_v4(),
                workflow_instance_id: instance_id,
                node_id: node.node_id,
                node_base_id: node.node_base_id,
                name: node.name.clone(),
                description: node.description.clone(),
                node_type: node.node_type,
                status: NodeInstanceStatus::Pending,
                input_data: json!({}),
                output_data: None,
                error_message: None,
                retry_count: 0,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
                is_deleted: false,
            })
            .collect();
        self.store
            .insert_node_instances(node_instances.clone())
            .await?;

        let mut context = ExecutionContext::new(instance_id);
        context.initialize(&graph, &node_instances);
        let shared = self.contexts.install(instance_id, context);

        let mut instance = instance;
        instance.transition(WorkflowInstanceStatus::Running)?;
        self.store.save_instance(instance.clone()).await?;
        self.store
            .append_event(
                instance_id,
                EventKind::WorkflowStarted,
                None,
                json!({
                    "executor_id": request.executor_id,
                    "workflow_base_id": request.workflow_base_id,
                }),
            )
            .await?;

        info!(
            %instance_id,
            workflow = %graph.workflow.name,
            node_count = node_instances.len(),
            "workflow execution started"
        );

        let info = {
            let mut ctx = shared.lock().await;

            // Auto-complete the start node with the submitted input.
            let start = node_instances
                .iter()
                .find(|ni| ni.node_type == NodeType::Start)
                .ok_or_else(|| {
                    BraidError::FatalInternal("validated template lost its start node".into())
                })?;
            let mut start_row = self.store.get_node_instance(start.node_instance_id).await?;
            start_row.input_data = request.input.clone();
            start_row.complete(request.input.clone())?;
            self.store.save_node_instance(start_row).await?;
            ctx.mark_completed(start.node_instance_id, request.input.clone());
            self.contexts
                .persist_node_completion(&mut ctx, start.node_instance_id, &request.input)
                .await?;

            self.drain_ready(&instance, &mut ctx).await?;
            self.evaluate_completion(instance_id).await?
        };
        if let Some(info) = info {
            self.fire_callbacks(info).await;
        }
        self.store.get_instance(instance_id).await
    }

    /// Pause: running tasks finish, ready nodes are not dispatched.
    pub async fn pause_workflow(&self, instance_id: Uuid, user_id: Uuid) -> Result<()> {
        let shared = self.contexts.get_or_create(instance_id).await?;
        let _ctx = shared.lock().await;

        let mut instance = self.store.get_instance(instance_id).await?;
        self.ensure_executor(&instance, user_id)?;
        instance.transition(WorkflowInstanceStatus::Paused)?;
        self.store.save_instance(instance).await?;
        self.store
            .append_event(instance_id, EventKind::WorkflowPaused, None, json!({}))
            .await?;
        info!(%instance_id, "workflow paused");
        Ok(())
    }

    /// Resume re-drains whatever became ready while paused.
    pub async fn resume_workflow(&self, instance_id: Uuid, user_id: Uuid) -> Result<()> {
        {
            let shared = self.contexts.get_or_create(instance_id).await?;
            let _ctx = shared.lock().await;

            let mut instance = self.store.get_instance(instance_id).await?;
            self.ensure_executor(&instance, user_id)?;
            instance.transition(WorkflowInstanceStatus::Running)?;
            self.store.save_instance(instance).await?;
            self.store
                .append_event(instance_id, EventKind::WorkflowResumed, None, json!({}))
                .await?;
        }
        info!(%instance_id, "workflow resumed");
        self.advance(instance_id).await
    }

    /// Cancellation cascades to every non-terminal task and node instance.
    /// Idempotent for an already-cancelled workflow.
    pub async fn cancel_workflow(
        &self,
        instance_id: Uuid,
        user_id: Uuid,
        reason: Option<String>,
    ) -> Result<()> {
        let info = {
            let shared = self.contexts.get_or_create(instance_id).await?;
            let mut ctx = shared.lock().await;

            let mut instance = self.store.get_instance(instance_id).await?;
            self.ensure_executor(&instance, user_id)?;
            if instance.status == WorkflowInstanceStatus::Cancelled {
                return Ok(());
            }
            if instance.status.is_terminal() {
                return Err(BraidError::Conflict(format!(
                    "workflow instance {instance_id} is already {}",
                    instance.status
                )));
            }

            for mut task in self.store.list_instance_tasks(instance_id).await? {
                if !task.status.is_terminal() {
                    task.transition(TaskStatus::Cancelled)?;
                    task.error_message = reason.clone();
                    self.store.save_task(task).await?;
                }
            }
            for mut node in self.store.list_node_instances(instance_id).await? {
                if !node.status.is_terminal() {
                    node.transition(NodeInstanceStatus::Cancelled)?;
                    self.store.save_node_instance(node.clone()).await?;
                    ctx.mark_failed(node.node_instance_id);
                }
            }

            instance.error_message = reason.clone();
            instance.transition(WorkflowInstanceStatus::Cancelled)?;
            self.store.save_instance(instance).await?;
            self.store
                .append_event(
                    instance_id,
                    EventKind::WorkflowCancelled,
                    None,
                    json!({ "reason": reason }),
                )
                .await?;
            info!(%instance_id, "workflow cancelled");

            let results = compose::collect_workflow_results(self.store.as_ref(), instance_id)
                .await
                .unwrap_or(Value::Null);
            CompletionInfo {
                instance_id,
                status: WorkflowInstanceStatus::Cancelled,
                results,
            }
        };
        self.fire_callbacks(info).await;
        Ok(())
    }

    /// Cascade delete. A running workflow must be cancelled first.
    pub async fn delete_workflow_instance(
        &self,
        instance_id: Uuid,
        soft: bool,
        user_id: Uuid,
    ) -> Result<crate::store::CascadeReport> {
        let instance = self.store.get_instance(instance_id).await?;
        self.ensure_executor(&instance, user_id)?;
        if instance.status == WorkflowInstanceStatus::Running {
            return Err(BraidError::Validation(format!(
                "workflow instance {instance_id} is running; cancel it before deleting"
            )));
        }
        self.contexts.remove(instance_id);
        let report = self.store.delete_instance_cascade(instance_id, soft).await?;
        info!(
            %instance_id,
            soft,
            node_instances = report.node_instances,
            task_instances = report.task_instances,
            "workflow instance deleted"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Task operations
    // -----------------------------------------------------------------------

    /// Complete a task with its output. When the last outstanding sibling of
    /// the node completes, the node completes with the collated output and
    /// downstream nodes are dispatched.
    pub async fn submit_task_result(
        &self,
        task_id: Uuid,
        submitter: Submitter,
        output: Value,
        summary: Option<String>,
    ) -> Result<TaskInstance> {
        let task_probe = self.store.get_task(task_id).await?;
        let instance_id = task_probe.workflow_instance_id;

        let info = {
            let shared = self.contexts.get_or_create(instance_id).await?;
            let mut ctx = shared.lock().await;

            let instance = self.store.get_instance(instance_id).await?;

            // Re-read inside the lock; the probe may be stale.
            let mut task = self.store.get_task(task_id).await?;
            if let Submitter::User(user_id) = submitter {
                task.ensure_assignee(user_id)?;
            }

            if instance.status.is_terminal() {
                // One exception: a human confirming a task whose node was
                // already completed by a subdivision bridge. Everything else
                // is discarded.
                let node = self.store.get_node_instance(task.node_instance_id).await?;
                let confirmation = matches!(submitter, Submitter::User(_))
                    && !task.status.is_terminal()
                    && node.status == NodeInstanceStatus::Completed;
                if !confirmation {
                    return Err(BraidError::Conflict(format!(
                        "workflow instance {instance_id} is {}; result discarded",
                        instance.status
                    )));
                }
                task.output_data = Some(output.clone());
                task.result_summary = summary;
                task.transition(TaskStatus::Completed)?;
                self.store.save_task(task.clone()).await?;
                self.store
                    .append_event(
                        instance_id,
                        EventKind::TaskCompleted,
                        Some(task.node_instance_id),
                        json!({ "task_id": task_id, "confirmation": true }),
                    )
                    .await?;
                drop(ctx);
                return self.store.get_task(task_id).await;
            }
            if !matches!(task.status, TaskStatus::Assigned | TaskStatus::InProgress) {
                return Err(BraidError::Validation(format!(
                    "task {task_id} cannot be submitted from status {}",
                    task.status
                )));
            }

            task.output_data = Some(output.clone());
            task.result_summary = summary;
            task.transition(TaskStatus::Completed)?;
            self.store.save_task(task.clone()).await?;
            self.store
                .append_event(
                    instance_id,
                    EventKind::TaskCompleted,
                    Some(task.node_instance_id),
                    json!({ "task_id": task_id, "kind": task.kind }),
                )
                .await?;
            debug!(%task_id, node_instance_id = %task.node_instance_id, "task completed");

            self.settle_node(&instance, &mut ctx, task.node_instance_id)
                .await?;
            self.evaluate_completion(instance_id).await?
        };
        if let Some(info) = info {
            self.fire_callbacks(info).await;
        }
        self.store.get_task(task_id).await
    }

    /// Agent-worker failure path: exhausted retries mark the task failed and
    /// propagate through the node.
    pub async fn fail_task(&self, task_id: Uuid, error: String) -> Result<()> {
        let task_probe = self.store.get_task(task_id).await?;
        let instance_id = task_probe.workflow_instance_id;

        let info = {
            let shared = self.contexts.get_or_create(instance_id).await?;
            let mut ctx = shared.lock().await;

            let instance = self.store.get_instance(instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(());
            }

            let mut task = self.store.get_task(task_id).await?;
            if task.status.is_terminal() {
                return Ok(());
            }
            task.error_message = Some(error.clone());
            task.transition(TaskStatus::Failed)?;
            self.store.save_task(task.clone()).await?;
            self.store
                .append_event(
                    instance_id,
                    EventKind::TaskFailed,
                    Some(task.node_instance_id),
                    json!({ "task_id": task_id, "error": error }),
                )
                .await?;
            warn!(%task_id, error, "task failed");

            self.settle_node(&instance, &mut ctx, task.node_instance_id)
                .await?;
            self.evaluate_completion(instance_id).await?
        };
        if let Some(info) = info {
            self.fire_callbacks(info).await;
        }
        Ok(())
    }

    /// Human picks up an assigned task.
    pub async fn start_task(&self, task_id: Uuid, user_id: Uuid) -> Result<TaskInstance> {
        let probe = self.store.get_task(task_id).await?;
        let shared = self
            .contexts
            .get_or_create(probe.workflow_instance_id)
            .await?;
        let _ctx = shared.lock().await;

        let mut task = self.store.get_task(task_id).await?;
        task.ensure_assignee(user_id)?;
        task.transition(TaskStatus::InProgress)?;
        self.store.save_task(task.clone()).await?;
        debug!(%task_id, %user_id, "task started");
        Ok(task)
    }

    /// Park a task: it returns to `assigned` with the note recorded, and
    /// can be picked up again via `start_task`.
    pub async fn pause_task(
        &self,
        task_id: Uuid,
        user_id: Uuid,
        note: Option<String>,
    ) -> Result<TaskInstance> {
        let probe = self.store.get_task(task_id).await?;
        let shared = self
            .contexts
            .get_or_create(probe.workflow_instance_id)
            .await?;
        let _ctx = shared.lock().await;

        let mut task = self.store.get_task(task_id).await?;
        task.ensure_assignee(user_id)?;
        task.transition(TaskStatus::Assigned)?;
        if let Some(note) = note {
            task.error_message = Some(note.clone());
            if let Some(obj) = task.context_data.as_object_mut() {
                obj.insert("pause_note".into(), json!(note));
            }
        }
        self.store.save_task(task.clone()).await?;
        debug!(%task_id, %user_id, "task paused back to assigned");
        Ok(task)
    }

    /// Reject with a mandatory reason; the task fails and propagates.
    pub async fn reject_task(&self, task_id: Uuid, user_id: Uuid, reason: String) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(BraidError::Validation(
                "a rejection reason is required".into(),
            ));
        }
        let task = self.store.get_task(task_id).await?;
        task.ensure_assignee(user_id)?;
        self.fail_task(task_id, format!("rejected: {reason}")).await
    }

    /// Cancel one task. If every sibling ends up cancelled the node is
    /// cancelled too, which fails the workflow (nothing downstream can run).
    pub async fn cancel_task(
        &self,
        task_id: Uuid,
        user_id: Uuid,
        reason: Option<String>,
    ) -> Result<()> {
        let task_probe = self.store.get_task(task_id).await?;
        let instance_id = task_probe.workflow_instance_id;

        let info = {
            let shared = self.contexts.get_or_create(instance_id).await?;
            let mut ctx = shared.lock().await;

            let instance = self.store.get_instance(instance_id).await?;
            let mut task = self.store.get_task(task_id).await?;
            task.ensure_assignee(user_id)?;
            task.error_message = reason;
            task.transition(TaskStatus::Cancelled)?;
            self.store.save_task(task.clone()).await?;

            self.settle_node(&instance, &mut ctx, task.node_instance_id)
                .await?;
            self.evaluate_completion(instance_id).await?
        };
        if let Some(info) = info {
            self.fire_callbacks(info).await;
        }
        Ok(())
    }

    /// Agent worker claims a queued task. Returns `None` when the task or
    /// its workflow moved on while the task sat in the queue (the worker
    /// skips it silently).
    pub async fn begin_agent_task(&self, task_id: Uuid) -> Result<Option<TaskInstance>> {
        let probe = self.store.get_task(task_id).await?;
        let shared = self
            .contexts
            .get_or_create(probe.workflow_instance_id)
            .await?;
        let _ctx = shared.lock().await;

        let instance = self.store.get_instance(probe.workflow_instance_id).await?;
        if instance.status != WorkflowInstanceStatus::Running {
            return Ok(None);
        }
        let mut task = self.store.get_task(task_id).await?;
        if task.status != TaskStatus::Assigned {
            return Ok(None);
        }
        task.transition(TaskStatus::InProgress)?;
        self.store.save_task(task.clone()).await?;
        Ok(Some(task))
    }

    /// Bump the persisted retry counter for an agent task.
    pub async fn record_task_retry(&self, task_id: Uuid) -> Result<u32> {
        let mut task = self.store.get_task(task_id).await?;
        task.retry_count += 1;
        task.updated_at = Utc::now();
        let count = task.retry_count;
        self.store.save_task(task).await?;
        Ok(count)
    }

    /// Fire callbacks for an already-terminal instance (monitor poll path).
    pub async fn fire_callbacks_if_terminal(&self, instance_id: Uuid) -> Result<bool> {
        if !self.callbacks.has_registration(instance_id) {
            return Ok(false);
        }
        let instance = match self.store.get_instance(instance_id).await {
            Ok(instance) => instance,
            Err(BraidError::NotFound(_)) => {
                // The workflow is gone; drop the registrations.
                let _ = self.callbacks.take(instance_id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if !instance.status.is_terminal() {
            return Ok(false);
        }
        let results = compose::collect_workflow_results(self.store.as_ref(), instance_id).await?;
        self.fire_callbacks(CompletionInfo {
            instance_id,
            status: instance.status,
            results,
        })
        .await;
        Ok(true)
    }

    /// Non-state-changing help request; lands in the event log.
    pub async fn request_help(&self, task_id: Uuid, user_id: Uuid, message: String) -> Result<()> {
        let task = self.store.get_task(task_id).await?;
        task.ensure_assignee(user_id)?;
        self.store
            .append_event(
                task.workflow_instance_id,
                EventKind::HelpRequested,
                Some(task.node_instance_id),
                json!({ "task_id": task_id, "user_id": user_id, "message": message }),
            )
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Node progression
    // -----------------------------------------------------------------------

    /// Re-evaluate a node after one of its tasks reached a terminal state.
    async fn settle_node(
        &self,
        instance: &WorkflowInstance,
        ctx: &mut ExecutionContext,
        node_instance_id: Uuid,
    ) -> Result<()> {
        let siblings = self.store.list_node_tasks(node_instance_id).await?;
        let non_cancelled: Vec<&TaskInstance> = siblings
            .iter()
            .filter(|t| t.status != TaskStatus::Cancelled)
            .collect();

        if non_cancelled.is_empty() {
            // Everything cancelled: the node can never complete.
            let mut row = self.store.get_node_instance(node_instance_id).await?;
            if !row.status.is_terminal() {
                row.transition(NodeInstanceStatus::Cancelled)?;
                self.store.save_node_instance(row).await?;
                ctx.mark_failed(node_instance_id);
            }
            return Ok(());
        }

        if non_cancelled.iter().any(|t| t.status == TaskStatus::Failed) {
            let reason = non_cancelled
                .iter()
                .find_map(|t| t.error_message.clone())
                .unwrap_or_else(|| "task failed".into());
            let mut row = self.store.get_node_instance(node_instance_id).await?;
            self.fail_node(ctx, &mut row, &reason).await?;
            return Ok(());
        }

        if non_cancelled.iter().all(|t| t.status == TaskStatus::Completed) {
            let output = compose::collate_task_outputs(&siblings);
            self.complete_node(instance, ctx, node_instance_id, output)
                .await?;
        }
        Ok(())
    }

    /// Complete a node with an output and dispatch whatever became ready.
    async fn complete_node(
        &self,
        instance: &WorkflowInstance,
        ctx: &mut ExecutionContext,
        node_instance_id: Uuid,
        output: Value,
    ) -> Result<()> {
        let mut row = self.store.get_node_instance(node_instance_id).await?;
        if row.status == NodeInstanceStatus::Completed {
            return Ok(());
        }
        row.complete(output.clone())?;
        self.store.save_node_instance(row.clone()).await?;
        ctx.mark_completed(node_instance_id, output.clone());
        self.contexts
            .persist_node_completion(ctx, node_instance_id, &output)
            .await?;
        debug!(node_instance_id = %node_instance_id, node = %row.name, "node completed");

        if instance.status == WorkflowInstanceStatus::Running {
            Box::pin(self.drain_ready(instance, ctx)).await?;
        }
        Ok(())
    }

    /// Subdivision bridge: the child workflow's results complete the parent
    /// node directly once it is the only outstanding work.
    pub async fn complete_node_with_output(
        &self,
        instance_id: Uuid,
        node_instance_id: Uuid,
        output: Value,
    ) -> Result<()> {
        let info = {
            let shared = self.contexts.get_or_create(instance_id).await?;
            let mut ctx = shared.lock().await;
            let instance = self.store.get_instance(instance_id).await?;
            if instance.status.is_terminal() {
                return Err(BraidError::Conflict(format!(
                    "workflow instance {instance_id} is {}",
                    instance.status
                )));
            }
            self.complete_node(&instance, &mut ctx, node_instance_id, output)
                .await?;
            self.evaluate_completion(instance_id).await?
        };
        if let Some(info) = info {
            self.fire_callbacks(info).await;
        }
        Ok(())
    }

    async fn fail_node(
        &self,
        ctx: &mut ExecutionContext,
        row: &mut NodeInstance,
        reason: &str,
    ) -> Result<()> {
        row.error_message = Some(reason.to_string());
        row.transition(NodeInstanceStatus::Failed)?;
        self.store.save_node_instance(row.clone()).await?;
        ctx.mark_failed(row.node_instance_id);
        self.store
            .append_event(
                row.workflow_instance_id,
                EventKind::NodeFailed,
                Some(row.node_instance_id),
                json!({ "reason": reason }),
            )
            .await?;
        warn!(node_instance_id = %row.node_instance_id, node = %row.name, reason, "node failed");
        Ok(())
    }

    /// Drain the ready queue until no node makes immediate progress.
    /// End nodes complete inline, so a chain of them resolves in one call.
    async fn drain_ready(
        &self,
        instance: &WorkflowInstance,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        loop {
            let ready = ctx.get_ready_nodes();
            if ready.is_empty() {
                return Ok(());
            }
            debug!(
                instance_id = %instance.instance_id,
                count = ready.len(),
                "dispatching ready nodes"
            );
            for node_instance_id in ready {
                self.dispatch_node(instance, ctx, node_instance_id).await?;
            }
        }
    }

    /// Dispatch one ready node: end nodes collate and complete, processor
    /// nodes fan out into tasks.
    async fn dispatch_node(
        &self,
        instance: &WorkflowInstance,
        ctx: &mut ExecutionContext,
        node_instance_id: Uuid,
    ) -> Result<()> {
        let mut row = self.store.get_node_instance(node_instance_id).await?;
        match row.node_type {
            NodeType::Start => Ok(()),
            NodeType::End => {
                let output = compose::collate_end_output(ctx, node_instance_id);
                self.complete_node(instance, ctx, node_instance_id, output)
                    .await
            }
            NodeType::Processor => {
                // A node that already left `pending` was dispatched by an
                // earlier context incarnation; never create its tasks twice.
                if row.status != NodeInstanceStatus::Pending {
                    return Ok(());
                }

                let processors = self.store.node_processors(row.node_id).await?;
                if processors.is_empty() {
                    return self.fail_node(ctx, &mut row, "no_binding").await;
                }

                let payload = compose::compose_payload(self.store.as_ref(), ctx, instance, &row)
                    .await?;
                let payload_value = payload.to_value();
                let input_value =
                    serde_json::to_value(&payload.immediate_upstream).unwrap_or(json!({}));

                let mut tasks: Vec<TaskInstance> = Vec::new();
                for processor in &processors {
                    match processor.kind {
                        ProcessorKind::Human => tasks.push(self.build_task(
                            &row,
                            TaskKind::Human,
                            processor.processor_id,
                            processor.user_id,
                            None,
                            &payload_value,
                            &input_value,
                        )),
                        ProcessorKind::Agent => tasks.push(self.build_task(
                            &row,
                            TaskKind::Agent,
                            processor.processor_id,
                            None,
                            processor.agent_id,
                            &payload_value,
                            &input_value,
                        )),
                        // A mix binding is dispatched twice: one human task,
                        // one agent task; the engine collates on completion.
                        ProcessorKind::Mix => {
                            tasks.push(self.build_task(
                                &row,
                                TaskKind::Human,
                                processor.processor_id,
                                processor.user_id,
                                None,
                                &payload_value,
                                &input_value,
                            ));
                            tasks.push(self.build_task(
                                &row,
                                TaskKind::Agent,
                                processor.processor_id,
                                None,
                                processor.agent_id,
                                &payload_value,
                                &input_value,
                            ));
                        }
                    }
                }

                for task in &tasks {
                    self.store.insert_task(task.clone()).await?;
                }

                // Task creation + enqueue is one logical operation: if the
                // queue refuses, roll the tasks back and leave the node for
                // the next drain.
                for task in tasks.iter().filter(|t| t.kind == TaskKind::Agent) {
                    if self.agent_queue.try_send(task.task_instance_id).is_err() {
                        warn!(
                            node_instance_id = %node_instance_id,
                            "agent queue full; rolling back dispatch"
                        );
                        for t in &tasks {
                            let _ = self.store.delete_task(t.task_instance_id).await;
                        }
                        ctx.requeue_trigger(node_instance_id);
                        return Ok(());
                    }
                }

                for task in &tasks {
                    self.store
                        .append_event(
                            instance.instance_id,
                            EventKind::TaskCreated,
                            Some(node_instance_id),
                            json!({
                                "task_id": task.task_instance_id,
                                "kind": task.kind,
                                "title": task.title,
                            }),
                        )
                        .await?;
                }

                row.transition(NodeInstanceStatus::Running)?;
                row.input_data = input_value;
                self.store.save_node_instance(row).await?;
                ctx.mark_executing(node_instance_id)?;
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_task(
        &self,
        row: &NodeInstance,
        kind: TaskKind,
        processor_id: Uuid,
        user_id: Option<Uuid>,
        agent_id: Option<Uuid>,
        payload: &Value,
        input: &Value,
    ) -> TaskInstance {
        let now = Utc::now();
        TaskInstance {
            task_instance_id: Uuid::new_v4(),
            node_instance_id: row.node_instance_id,
            workflow_instance_id: row.workflow_instance_id,
            processor_id,
            kind,
            title: row.name.clone(),
            description: row.description.clone(),
            status: TaskStatus::Assigned,
            assigned_user_id: user_id,
            assigned_agent_id: agent_id,
            context_data: payload.clone(),
            input_data: input.clone(),
            output_data: None,
            result_summary: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            assigned_at: Some(now),
            started_at: None,
            completed_at: None,
            is_deleted: false,
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Re-drain ready nodes for a running workflow (resume and recovery).
    pub async fn advance(&self, instance_id: Uuid) -> Result<()> {
        let info = {
            let instance = self.store.get_instance(instance_id).await?;
            if instance.status != WorkflowInstanceStatus::Running {
                return Ok(());
            }
            let shared = self.contexts.get_or_create(instance_id).await?;
            let mut ctx = shared.lock().await;
            self.drain_ready(&instance, &mut ctx).await?;
            self.evaluate_completion(instance_id).await?
        };
        if let Some(info) = info {
            self.fire_callbacks(info).await;
        }
        Ok(())
    }

    /// Idempotent terminal-state evaluation: completed iff the end node
    /// completed, failed iff a non-cancelled node failed (or was cancelled
    /// individually) with no retry pending. Takes the workflow lock; the
    /// internal paths evaluate inside their own lock hold instead.
    pub async fn check_workflow_completion(&self, instance_id: Uuid) -> Result<()> {
        let info = {
            let shared = self.contexts.get_or_create(instance_id).await?;
            let _ctx = shared.lock().await;
            self.evaluate_completion(instance_id).await?
        };
        if let Some(info) = info {
            self.fire_callbacks(info).await;
        }
        Ok(())
    }

    async fn evaluate_completion(&self, instance_id: Uuid) -> Result<Option<CompletionInfo>> {
        let mut instance = self.store.get_instance(instance_id).await?;
        if instance.status.is_terminal() {
            return Ok(None);
        }

        let nodes = self.store.list_node_instances(instance_id).await?;

        if let Some(end) = nodes
            .iter()
            .find(|n| n.node_type == NodeType::End && n.status == NodeInstanceStatus::Completed)
        {
            instance.output_data = end.output_data.clone();
            instance.transition(WorkflowInstanceStatus::Completed)?;
            self.store.save_instance(instance).await?;
            self.store
                .append_event(instance_id, EventKind::WorkflowCompleted, None, json!({}))
                .await?;
            info!(%instance_id, "workflow completed");

            let results =
                compose::collect_workflow_results(self.store.as_ref(), instance_id).await?;
            return Ok(Some(CompletionInfo {
                instance_id,
                status: WorkflowInstanceStatus::Completed,
                results,
            }));
        }

        let blocked = nodes.iter().find(|n| {
            matches!(
                n.status,
                NodeInstanceStatus::Failed | NodeInstanceStatus::Cancelled
            )
        });
        if let Some(node) = blocked {
            let reason = node
                .error_message
                .clone()
                .unwrap_or_else(|| format!("node '{}' is {}", node.name, node.status));
            instance.error_message = Some(reason.clone());
            instance.transition(WorkflowInstanceStatus::Failed)?;
            self.store.save_instance(instance).await?;
            self.store
                .append_event(
                    instance_id,
                    EventKind::WorkflowFailed,
                    Some(node.node_instance_id),
                    json!({ "reason": reason }),
                )
                .await?;
            warn!(%instance_id, reason, "workflow failed");

            let results =
                compose::collect_workflow_results(self.store.as_ref(), instance_id).await?;
            return Ok(Some(CompletionInfo {
                instance_id,
                status: WorkflowInstanceStatus::Failed,
                results,
            }));
        }

        Ok(None)
    }

    async fn fire_callbacks(&self, info: CompletionInfo) {
        let callbacks = self.callbacks.take(info.instance_id);
        if callbacks.is_empty() {
            return;
        }
        info!(
            instance_id = %info.instance_id,
            status = %info.status,
            count = callbacks.len(),
            "firing completion callbacks"
        );
        for callback in callbacks {
            callback(info.clone()).await;
        }
    }

    // -----------------------------------------------------------------------
    // Read model
    // -----------------------------------------------------------------------

    pub async fn get_workflow_task_flow(&self, instance_id: Uuid) -> Result<TaskFlow> {
        let instance = self.store.get_instance(instance_id).await?;
        let nodes = self.store.list_node_instances(instance_id).await?;
        let tasks = self.store.list_instance_tasks(instance_id).await?;

        let flows = nodes
            .into_iter()
            .map(|node| {
                let node_tasks = tasks
                    .iter()
                    .filter(|t| t.node_instance_id == node.node_instance_id)
                    .cloned()
                    .collect();
                NodeTaskFlow {
                    node,
                    tasks: node_tasks,
                }
            })
            .collect();

        Ok(TaskFlow {
            instance,
            nodes: flows,
        })
    }

    fn ensure_executor(&self, instance: &WorkflowInstance, user_id: Uuid) -> Result<()> {
        if instance.executor_id == user_id {
            Ok(())
        } else {
            Err(BraidError::PermissionDenied(format!(
                "user {user_id} is not the executor of instance {}",
                instance.instance_id
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
