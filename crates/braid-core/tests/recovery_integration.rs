//! Recovery racing live execution.
//!
//! Forced context reloads swap the resident `ExecutionContext` out from
//! under the engine while submissions are in flight. These tests assert the
//! exactly-once guarantees survive that: a node's tasks are never created
//! twice across context incarnations, terminal transitions happen once, and
//! completion callbacks fire once.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use braid_core::config::BraidConfig;
use braid_core::dispatch::{AgentCallError, AgentClient, AgentInvocation, AgentReply};
use braid_core::engine::{ExecuteWorkflowRequest, Submitter};
use braid_core::model::{
    NodeInstanceStatus, NodeType, Position, Processor, ProcessorKind, WorkflowInstanceStatus,
};
use braid_core::services::CoreServices;
use braid_core::store::{
    ConnectionSpec, InstanceStore, MemoryStore, NodeSpec, TaskStore, TemplateSpec, WorkflowStore,
};

struct UnusedAgent;

#[async_trait]
impl AgentClient for UnusedAgent {
    async fn invoke(
        &self,
        _invocation: &AgentInvocation,
    ) -> std::result::Result<AgentReply, AgentCallError> {
        Err(AgentCallError::NonRetryable("no agent in this test".into()))
    }
}

fn services() -> (Arc<CoreServices>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let core = Arc::new(CoreServices::new(
        BraidConfig::default(),
        store.clone(),
        Arc::new(UnusedAgent),
    ));
    (core, store)
}

fn node_spec(name: &str, node_type: NodeType, processor_ids: Vec<Uuid>) -> NodeSpec {
    NodeSpec {
        name: name.into(),
        description: String::new(),
        node_type,
        position: Position::default(),
        processor_ids,
    }
}

fn conn(from: &str, to: &str) -> ConnectionSpec {
    ConnectionSpec {
        from_node: from.into(),
        to_node: to.into(),
        condition: None,
    }
}

/// Publish `start -> A -> B -> end` with both business nodes bound to one
/// human user, and start an instance.
async fn start_chain(core: &CoreServices, store: &MemoryStore, user: Uuid) -> Uuid {
    let now = Utc::now();
    let processor_id = Uuid::new_v4();
    store
        .register_processor(Processor {
            processor_id,
            name: "owner".into(),
            kind: ProcessorKind::Human,
            user_id: Some(user),
            agent_id: None,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        })
        .await
        .unwrap();

    let graph = store
        .publish_template(TemplateSpec {
            name: "recovery-chain".into(),
            description: String::new(),
            creator_id: user,
            parent_base_id: None,
            nodes: vec![
                node_spec("start", NodeType::Start, vec![]),
                node_spec("A", NodeType::Processor, vec![processor_id]),
                node_spec("B", NodeType::Processor, vec![processor_id]),
                node_spec("end", NodeType::End, vec![]),
            ],
            connections: vec![conn("start", "A"), conn("A", "B"), conn("B", "end")],
        })
        .await
        .unwrap();

    core.engine
        .execute_workflow(ExecuteWorkflowRequest {
            workflow_base_id: graph.workflow.workflow_base_id,
            instance_name: "recovery-run".into(),
            input: json!({}),
            metadata: json!({}),
            executor_id: user,
        })
        .await
        .unwrap()
        .instance_id
}

/// Forced reloads hammer the context while the final task result arrives.
/// The workflow must complete exactly once, with exactly one task per node
/// and the completion callback fired exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_recovery_races_live_completion() {
    let (core, store) = services();
    let user = Uuid::new_v4();
    let instance_id = start_chain(&core, &store, user).await;

    // Walk to the last business node: complete A so B is in flight.
    let tasks = store.list_instance_tasks(instance_id).await.unwrap();
    let a_task = tasks.iter().find(|t| t.title == "A").unwrap();
    core.engine
        .submit_task_result(
            a_task.task_instance_id,
            Submitter::User(user),
            json!({"out": "A"}),
            None,
        )
        .await
        .unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    core.engine.register_completion_callback(
        instance_id,
        Box::new(move |info| {
            let counter = counter.clone();
            Box::pin(async move {
                assert_eq!(info.status, WorkflowInstanceStatus::Completed);
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }),
    );

    let tasks = store.list_instance_tasks(instance_id).await.unwrap();
    let b_task_id = tasks
        .iter()
        .find(|t| t.title == "B")
        .unwrap()
        .task_instance_id;

    let recover_monitor = core.monitor.clone();
    let recover = tokio::spawn(async move {
        for _ in 0..10 {
            recover_monitor
                .recover_workflow_context(instance_id, true)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
    let submit_engine = core.engine.clone();
    let submit = tokio::spawn(async move {
        submit_engine
            .submit_task_result(b_task_id, Submitter::User(user), json!({"out": "B"}), None)
            .await
    });

    submit.await.unwrap().unwrap();
    recover.await.unwrap();

    let instance = store.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, WorkflowInstanceStatus::Completed);
    assert_eq!(instance.output_data.unwrap()["B"], json!({"out": "B"}));

    // No task was dispatched twice across context incarnations.
    let tasks = store.list_instance_tasks(instance_id).await.unwrap();
    assert_eq!(tasks.iter().filter(|t| t.title == "A").count(), 1);
    assert_eq!(tasks.iter().filter(|t| t.title == "B").count(), 1);

    // Callbacks fired exactly once, and the poller finds nothing left.
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(core.monitor.poll_callbacks().await.unwrap(), 0);
}

/// The lost-frontier shape (A durable, B never dispatched, context gone)
/// recovered by several concurrent forced recoveries: B's task is created
/// exactly once, and the workflow then runs to completion.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_recoveries_dispatch_lost_frontier_once() {
    let (core, store) = services();
    let user = Uuid::new_v4();
    let instance_id = start_chain(&core, &store, user).await;

    let tasks = store.list_instance_tasks(instance_id).await.unwrap();
    let a_task = tasks.iter().find(|t| t.title == "A").unwrap();
    core.engine
        .submit_task_result(
            a_task.task_instance_id,
            Submitter::User(user),
            json!({"out": "A"}),
            None,
        )
        .await
        .unwrap();

    // Crash window: B's dispatch never became durable and the resident
    // context is gone.
    let tasks = store.list_instance_tasks(instance_id).await.unwrap();
    let b_task = tasks.iter().find(|t| t.title == "B").unwrap();
    let b_node_id = b_task.node_instance_id;
    store.delete_task(b_task.task_instance_id).await.unwrap();
    let mut b_node = store.get_node_instance(b_node_id).await.unwrap();
    b_node.status = NodeInstanceStatus::Pending;
    b_node.started_at = None;
    store.save_node_instance(b_node).await.unwrap();
    core.contexts.remove(instance_id);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let monitor = core.monitor.clone();
        handles.push(tokio::spawn(async move {
            monitor.recover_workflow_context(instance_id, true).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let tasks = store.list_instance_tasks(instance_id).await.unwrap();
    assert_eq!(
        tasks.iter().filter(|t| t.title == "B").count(),
        1,
        "concurrent recoveries must not double-dispatch the frontier"
    );
    let b_node = store.get_node_instance(b_node_id).await.unwrap();
    assert_eq!(b_node.status, NodeInstanceStatus::Running);

    // The recovered workflow finishes normally.
    let b_task = tasks.iter().find(|t| t.title == "B").unwrap();
    core.engine
        .submit_task_result(
            b_task.task_instance_id,
            Submitter::User(user),
            json!({"out": "B"}),
            None,
        )
        .await
        .unwrap();
    let instance = store.get_instance(instance_id).await.unwrap();
    assert_eq!(instance.status, WorkflowInstanceStatus::Completed);
}
