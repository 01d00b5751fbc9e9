//! Process-singleton owner of execution contexts.
//!
//! Hands out one `Arc<tokio::sync::Mutex<ExecutionContext>>` per workflow
//! instance; that mutex is the per-workflow serialization boundary. Resident
//! contexts are capped (LRU) and idle-expired (TTL); on a miss the context
//! is rebuilt from the latest snapshot plus subsequent events, falling back
//! to a structural rebuild from node-instance rows.

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ContextImage, ExecutionContext};
use crate::config::ContextConfig;
use crate::model::{ContextSnapshot, EventKind, NodeInstanceStatus};
use crate::store::{EventStore, InstanceStore, SnapshotStore, Store, WorkflowStore};
use crate::{BraidError, Result};

type SharedContext = Arc<tokio::sync::Mutex<ExecutionContext>>;

struct Entry {
    context: SharedContext,
    last_access: chrono::DateTime<Utc>,
}

/// Residency and recovery statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextManagerStats {
    pub resident: usize,
    pub capacity: usize,
    pub snapshot_recoveries: u64,
    pub structural_rebuilds: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    snapshot_recoveries: u64,
    structural_rebuilds: u64,
    evictions: u64,
}

pub struct ContextManager {
    store: Arc<dyn Store>,
    config: ContextConfig,
    cache: Mutex<LruCache<Uuid, Entry>>,
    counters: Mutex<Counters>,
}

impl ContextManager {
    pub fn new(store: Arc<dyn Store>, config: ContextConfig) -> Self {
        let capacity =
            NonZeroUsize::new(config.max_resident_contexts).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            config,
            cache: Mutex::new(LruCache::new(capacity)),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Fetch the resident context for an instance, recovering or rebuilding
    /// it on a miss.
    pub async fn get_or_create(&self, instance_id: Uuid) -> Result<SharedContext> {
        if let Some(context) = self.lookup(instance_id) {
            return Ok(context);
        }

        let context = match self.recover_from_snapshot(instance_id).await? {
            Some(ctx) => {
                self.counters.lock().snapshot_recoveries += 1;
                ctx
            }
            None => {
                let ctx = self.structural_rebuild(instance_id).await?;
                self.counters.lock().structural_rebuilds += 1;
                ctx
            }
        };

        let shared: SharedContext = Arc::new(tokio::sync::Mutex::new(context));
        let mut cache = self.cache.lock();
        // Another caller may have raced us; keep whichever landed first.
        if let Some(existing) = cache.get_mut(&instance_id) {
            existing.last_access = Utc::now();
            return Ok(existing.context.clone());
        }
        cache.put(
            instance_id,
            Entry {
                context: shared.clone(),
                last_access: Utc::now(),
            },
        );
        Ok(shared)
    }

    fn lookup(&self, instance_id: Uuid) -> Option<SharedContext> {
        let mut cache = self.cache.lock();
        cache.get_mut(&instance_id).map(|entry| {
            entry.last_access = Utc::now();
            entry.context.clone()
        })
    }

    /// Register a freshly built context (workflow startup path).
    pub fn install(&self, instance_id: Uuid, context: ExecutionContext) -> SharedContext {
        let shared: SharedContext = Arc::new(tokio::sync::Mutex::new(context));
        self.cache.lock().put(
            instance_id,
            Entry {
                context: shared.clone(),
                last_access: Utc::now(),
            },
        );
        shared
    }

    pub fn remove(&self, instance_id: Uuid) {
        self.cache.lock().pop(&instance_id);
    }

    /// Drop and rebuild; the stall monitor's recovery primitive.
    ///
    /// Any operation mid-flight on the resident context is waited out
    /// first, so the rebuild never reads a half-written row set.
    pub async fn force_reload(&self, instance_id: Uuid) -> Result<SharedContext> {
        let existing = self.lookup(instance_id);
        let _quiesce = match existing.as_ref() {
            Some(shared) => Some(shared.lock().await),
            None => None,
        };
        self.remove(instance_id);
        let context = self.get_or_create(instance_id).await?;
        self.store
            .append_event(instance_id, EventKind::ContextRecovered, None, json!({}))
            .await?;
        Ok(context)
    }

    /// Evict entries idle for longer than the TTL. Returns how many were
    /// dropped.
    pub fn evict_idle(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.ttl()).unwrap_or_else(|_| {
            chrono::Duration::seconds(i64::MAX / 1_000)
        });
        let now = Utc::now();
        let mut cache = self.cache.lock();
        let stale: Vec<Uuid> = cache
            .iter()
            .filter(|(_, entry)| now - entry.last_access > ttl)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            cache.pop(id);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "evicted idle execution contexts");
            self.counters.lock().evictions += stale.len() as u64;
        }
        stale.len()
    }

    /// Probe one context: internal consistency plus agreement with the
    /// persisted node-instance rows.
    pub async fn health_check(
        &self,
        instance_id: Uuid,
        grace: chrono::Duration,
    ) -> Result<super::ContextHealth> {
        let shared = self.get_or_create(instance_id).await?;
        let ctx = shared.lock().await;
        let mut health = ctx.health_check(grace);

        for row in self.store.list_node_instances(instance_id).await? {
            let in_context = ctx.is_completed(row.node_instance_id);
            let in_store = row.status == NodeInstanceStatus::Completed;
            if in_context != in_store {
                health.healthy = false;
                health.reasons.push(format!(
                    "node instance {} is {} in the store but {} in the context",
                    row.node_instance_id,
                    row.status,
                    if in_context { "completed" } else { "not completed" }
                ));
            }
        }
        Ok(health)
    }

    pub fn health_stats(&self) -> ContextManagerStats {
        let cache = self.cache.lock();
        let counters = self.counters.lock();
        ContextManagerStats {
            resident: cache.len(),
            capacity: cache.cap().get(),
            snapshot_recoveries: counters.snapshot_recoveries,
            structural_rebuilds: counters.structural_rebuilds,
            evictions: counters.evictions,
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Durably record a node completion: update the instance row's execution
    /// fields, append the `node_completed` event, and snapshot when the
    /// update threshold is reached.
    ///
    /// The completion event is appended before anything downstream of the
    /// node can be dispatched, which is the ordering guarantee recovery
    /// relies on.
    pub async fn persist_node_completion(
        &self,
        ctx: &mut ExecutionContext,
        node_instance_id: Uuid,
        output: &serde_json::Value,
    ) -> Result<()> {
        let instance_id = ctx.workflow_instance_id();
        let node_name = ctx.node_name(node_instance_id).unwrap_or("?").to_string();

        let event = self
            .store
            .append_event(
                instance_id,
                EventKind::NodeCompleted,
                Some(node_instance_id),
                json!({ "node_name": node_name, "output": output }),
            )
            .await?;
        ctx.set_last_event_sequence(event.sequence_number);

        self.sync_instance_row(ctx, Some(&node_name)).await?;

        if ctx.updates_since_snapshot() >= self.config.snapshot_every_updates {
            self.snapshot_now(ctx).await?;
        }
        Ok(())
    }

    /// Write the context-derived execution fields back onto the instance row.
    pub async fn sync_instance_row(
        &self,
        ctx: &ExecutionContext,
        completed_node_name: Option<&str>,
    ) -> Result<()> {
        let instance_id = ctx.workflow_instance_id();
        let image = ctx.snapshot();

        let mut instance = self.store.get_instance(instance_id).await?;
        instance.execution_context = json!({
            "node_outputs": image.node_outputs,
            "current_executing": image.current_executing,
        });
        instance.node_dependencies =
            serde_json::to_value(&image.dependencies_full).unwrap_or(json!({}));
        instance.completed_nodes = image.completed_nodes.iter().copied().collect();
        if let Some(name) = completed_node_name {
            instance
                .execution_trace
                .push(format!("node '{name}' completed"));
        }
        instance.updated_at = Utc::now();
        self.store.save_instance(instance).await
    }

    /// Capture a full snapshot row and trim old ones per retention.
    pub async fn snapshot_now(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let instance_id = ctx.workflow_instance_id();
        let image = ctx.snapshot();
        let instance = self.store.get_instance(instance_id).await?;

        let snapshot = ContextSnapshot {
            snapshot_id: Uuid::new_v4(),
            workflow_instance_id: instance_id,
            sequence_number: ctx.last_event_sequence(),
            execution_state: instance.status.to_string(),
            context_data: serde_json::to_value(&image)
                .map_err(|e| BraidError::FatalInternal(format!("snapshot serialize: {e}")))?,
            node_states: serde_json::to_value(&image.node_states).unwrap_or(json!({})),
            created_at: Utc::now(),
        };
        self.store.append_snapshot(snapshot).await?;
        self.store
            .cleanup_snapshots(instance_id, self.config.snapshot_retention)
            .await?;
        ctx.reset_snapshot_counter();

        let event = self
            .store
            .append_event(instance_id, EventKind::SnapshotCreated, None, json!({}))
            .await?;
        ctx.set_last_event_sequence(event.sequence_number);
        debug!(%instance_id, "context snapshot captured");
        Ok(())
    }

    /// Replace a context's state with a previously captured image and
    /// re-sync the instance row (subdivision restore path).
    pub async fn restore_image(&self, instance_id: Uuid, image: ContextImage) -> Result<()> {
        let shared = self.get_or_create(instance_id).await?;
        let mut ctx = shared.lock().await;
        ctx.restore_from_image(image);
        self.sync_instance_row(&ctx, None).await
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    async fn recover_from_snapshot(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<ExecutionContext>> {
        let Some(snapshot) = self.store.latest_snapshot(instance_id).await? else {
            return Ok(None);
        };

        let image: ContextImage = match serde_json::from_value(snapshot.context_data.clone()) {
            Ok(image) => image,
            Err(e) => {
                warn!(%instance_id, error = %e, "snapshot image unreadable; falling back to structural rebuild");
                return Ok(None);
            }
        };

        let mut ctx = ExecutionContext::new(instance_id);
        ctx.restore_from_image(image);

        // Replay completions recorded after the snapshot was cut.
        let events = self
            .store
            .events_after(instance_id, snapshot.sequence_number)
            .await?;
        let mut replayed = 0;
        for event in events {
            if event.kind == EventKind::NodeCompleted {
                if let Some(node_instance_id) = event.node_instance_id {
                    let output = event
                        .data
                        .get("output")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    ctx.mark_completed(node_instance_id, output);
                    replayed += 1;
                }
            }
            ctx.set_last_event_sequence(event.sequence_number);
        }

        info!(
            %instance_id,
            snapshot_sequence = snapshot.sequence_number,
            replayed,
            "execution context recovered from snapshot"
        );
        Ok(Some(ctx))
    }

    /// Last-resort rebuild from node-instance rows and the template graph.
    async fn structural_rebuild(&self, instance_id: Uuid) -> Result<ExecutionContext> {
        let instance = self.store.get_instance(instance_id).await?;
        let graph = self.store.get_template(instance.workflow_id).await?;
        let node_instances = self.store.list_node_instances(instance_id).await?;

        let mut ctx = ExecutionContext::new(instance_id);
        ctx.initialize(&graph, &node_instances);

        for ni in &node_instances {
            match ni.status {
                NodeInstanceStatus::Completed => {
                    let output = ni.output_data.clone().unwrap_or(serde_json::Value::Null);
                    ctx.mark_completed(ni.node_instance_id, output);
                }
                NodeInstanceStatus::Running => {
                    let _ = ctx.mark_executing(ni.node_instance_id);
                }
                NodeInstanceStatus::Failed | NodeInstanceStatus::Cancelled => {
                    ctx.mark_failed(ni.node_instance_id);
                }
                NodeInstanceStatus::Pending => {}
            }
        }

        if let Some(last) = self.store.events_after(instance_id, 0).await?.last() {
            ctx.set_last_event_sequence(last.sequence_number);
        }

        info!(%instance_id, nodes = node_instances.len(), "execution context structurally rebuilt");
        Ok(ctx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::model::{
        NodeInstance, NodeType, WorkflowInstance, WorkflowInstanceStatus,
    };
    use crate::store::{ConnectionSpec, MemoryStore, NodeSpec, TemplateSpec};
    use serde_json::json;

    async fn seed_linear(store: &MemoryStore) -> (Uuid, Vec<NodeInstance>) {
        let spec = TemplateSpec {
            name: "linear".into(),
            description: String::new(),
            creator_id: Uuid::new_v4(),
            parent_base_id: None,
            nodes: vec![
                NodeSpec {
                    name: "start".into(),
                    description: String::new(),
                    node_type: NodeType::Start,
                    position: Default::default(),
                    processor_ids: vec![],
                },
                NodeSpec {
                    name: "a".into(),
                    description: String::new(),
                    node_type: NodeType::Processor,
                    position: Default::default(),
                    processor_ids: vec![],
                },
                NodeSpec {
                    name: "end".into(),
                    description: String::new(),
                    node_type: NodeType::End,
                    position: Default::default(),
                    processor_ids: vec![],
                },
            ],
            connections: vec![
                ConnectionSpec {
                    from_node: "start".into(),
                    to_node: "a".into(),
                    condition: None,
                },
                ConnectionSpec {
                    from_node: "a".into(),
                    to_node: "end".into(),
                    condition: None,
                },
            ],
        };
        let graph = store.publish_template(spec).await.unwrap();

        let now = Utc::now();
        let instance_id = Uuid::new_v4();
        store
            .insert_instance(WorkflowInstance {
                instance_id,
                workflow_id: graph.workflow.workflow_id,
                workflow_base_id: graph.workflow.workflow_base_id,
                executor_id: Uuid::new_v4(),
                name: "run".into(),
                status: WorkflowInstanceStatus::Running,
                input_data: json!({}),
                output_data: None,
                error_message: None,
                execution_context: json!({}),
                node_dependencies: json!({}),
                completed_nodes: vec![],
                execution_trace: vec![],
                instance_metadata: json!({}),
                created_at: now,
                updated_at: now,
                started_at: Some(now),
                completed_at: None,
                is_deleted: false,
            })
            .await
            .unwrap();

        let node_instances: Vec<NodeInstance> = graph
            .nodes
            .iter()
            .map(|n| NodeInstance {
                node_instance_id: Uuid::new_v4(),
                workflow_instance_id: instance_id,
                node_id: n.node_id,
                node_base_id: n.node_base_id,
                name: n.name.clone(),
                description: n.description.clone(),
                node_type: n.node_type,
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
        store
            .insert_node_instances(node_instances.clone())
            .await
            .unwrap();
        (instance_id, node_instances)
    }

    fn manager(store: Arc<MemoryStore>) -> ContextManager {
        ContextManager::new(store, ContextConfig::default())
    }

    #[tokio::test]
    async fn structural_rebuild_marks_start_ready() {
        let store = Arc::new(MemoryStore::new());
        let (instance_id, node_instances) = seed_linear(&store).await;
        let mgr = manager(store);

        let shared = mgr.get_or_create(instance_id).await.unwrap();
        let mut ctx = shared.lock().await;
        let ready = ctx.get_ready_nodes();
        assert_eq!(ready, vec![node_instances[0].node_instance_id]);

        let stats = mgr.health_stats();
        assert_eq!(stats.resident, 1);
        assert_eq!(stats.structural_rebuilds, 1);
    }

    #[tokio::test]
    async fn rebuild_reflects_completed_rows() {
        let store = Arc::new(MemoryStore::new());
        let (instance_id, node_instances) = seed_linear(&store).await;

        // Persist start as completed, as if the engine crashed right after.
        let mut start_row = node_instances[0].clone();
        start_row.complete(json!({"x": 1})).unwrap();
        store.save_node_instance(start_row).await.unwrap();

        let mgr = manager(store);
        let shared = mgr.get_or_create(instance_id).await.unwrap();
        let mut ctx = shared.lock().await;

        // Start's completion unblocks `a`; start itself must not re-dispatch.
        let ready = ctx.get_ready_nodes();
        assert_eq!(ready, vec![node_instances[1].node_instance_id]);
    }

    #[tokio::test]
    async fn snapshot_recovery_replays_later_events() {
        let store = Arc::new(MemoryStore::new());
        let (instance_id, node_instances) = seed_linear(&store).await;
        let mgr = manager(store.clone());

        let start_id = node_instances[0].node_instance_id;
        let a_id = node_instances[1].node_instance_id;

        // Build, complete start, snapshot, then complete `a` (event only).
        {
            let shared = mgr.get_or_create(instance_id).await.unwrap();
            let mut ctx = shared.lock().await;
            let _ = ctx.get_ready_nodes();
            ctx.mark_completed(start_id, json!({"x": 1}));
            mgr.persist_node_completion(&mut ctx, start_id, &json!({"x": 1}))
                .await
                .unwrap();
            mgr.snapshot_now(&mut ctx).await.unwrap();

            ctx.mark_completed(a_id, json!({"ok": true}));
            mgr.persist_node_completion(&mut ctx, a_id, &json!({"ok": true}))
                .await
                .unwrap();
        }

        // Simulate a crash: drop residency, then recover.
        mgr.remove(instance_id);
        let shared = mgr.get_or_create(instance_id).await.unwrap();
        let ctx = shared.lock().await;

        assert!(ctx.is_completed(start_id));
        assert!(ctx.is_completed(a_id), "post-snapshot event was replayed");
        assert_eq!(mgr.health_stats().snapshot_recoveries, 1);
    }

    #[tokio::test]
    async fn health_check_flags_store_disagreement() {
        let store = Arc::new(MemoryStore::new());
        let (instance_id, node_instances) = seed_linear(&store).await;
        let mgr = manager(store.clone());

        // Build the context first, then complete a row behind its back.
        mgr.get_or_create(instance_id).await.unwrap();
        let mut a_row = node_instances[1].clone();
        a_row.complete(json!({"out": 1})).unwrap();
        store.save_node_instance(a_row).await.unwrap();

        let health = mgr
            .health_check(instance_id, chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(!health.healthy);
        assert!(health
            .reasons
            .iter()
            .any(|r| r.contains("in the store but")));
    }

    #[tokio::test]
    async fn eviction_respects_capacity() {
        let store = Arc::new(MemoryStore::new());
        let mut config = ContextConfig::default();
        config.max_resident_contexts = 1;
        let mgr = ContextManager::new(store.clone(), config);

        let (first, _) = seed_linear(&store).await;
        let (second, _) = seed_linear(&store).await;

        mgr.get_or_create(first).await.unwrap();
        mgr.get_or_create(second).await.unwrap();
        assert_eq!(mgr.health_stats().resident, 1, "LRU cap evicted the first");
    }
}
