//! Stall detection and recovery, plus the completion-callback poll loop.
//!
//! A workflow is truly stalled when it sits in `running|pending`, nothing
//! has touched it past the stale threshold, no task is in flight, and at
//! least one pending node has every upstream dependency completed. Recovery
//! force-reloads the execution context (snapshot, else structural rebuild)
//! and re-drains the ready frontier. Attempts are bounded per instance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::context::ContextManager;
use crate::engine::ExecutionEngine;
use crate::model::{NodeInstanceStatus, TaskStatus, WorkflowInstanceStatus};
use crate::store::{InstanceStore, Store, TaskStore, WorkflowStore};
use crate::Result;

/// Counters reported by `stats()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStats {
    pub scans: u64,
    pub stalls_detected: u64,
    pub recoveries: u64,
    pub failed_recoveries: u64,
    pub recovery_attempts_exhausted: u64,
    pub callbacks_fired: u64,
}

/// Result of one manual or scheduled scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub stalled: usize,
    pub recovered: usize,
}

pub struct StallMonitor {
    store: Arc<dyn Store>,
    contexts: Arc<ContextManager>,
    engine: Arc<ExecutionEngine>,
    config: MonitorConfig,
    attempts: Mutex<HashMap<Uuid, u32>>,
    stats: Mutex<MonitorStats>,
    /// Serializes recoveries: two overlapping forced reloads of the same
    /// instance must not both rebuild and re-dispatch.
    recovery_gate: tokio::sync::Mutex<()>,
}

impl StallMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        contexts: Arc<ContextManager>,
        engine: Arc<ExecutionEngine>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            contexts,
            engine,
            config,
            attempts: Mutex::new(HashMap::new()),
            stats: Mutex::new(MonitorStats::default()),
            recovery_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats.lock().clone()
    }

    /// Background loops: the stall scan and the callback poll run on their
    /// own cadences until the shutdown signal flips.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let scan_monitor = self.clone();
        let mut scan_shutdown = shutdown.clone();
        let scan = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan_monitor.config.scan_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scan_monitor.scan_once().await {
                            warn!(error = %e, "stall scan failed");
                        }
                        scan_monitor.contexts.evict_idle();
                    }
                    _ = scan_shutdown.changed() => break,
                }
            }
            debug!("stall monitor stopped");
        });

        let poll_monitor = self.clone();
        let mut poll_shutdown = shutdown;
        let poll = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_monitor.config.callback_poll_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = poll_monitor.poll_callbacks().await {
                            warn!(error = %e, "callback poll failed");
                        }
                    }
                    _ = poll_shutdown.changed() => break,
                }
            }
            debug!("callback poller stopped");
        });

        vec![scan, poll]
    }

    /// One scan pass over running/pending instances.
    pub async fn scan_once(&self) -> Result<ScanReport> {
        self.stats.lock().scans += 1;

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_threshold())
                .unwrap_or_else(|_| chrono::Duration::hours(2));

        let instances = self
            .store
            .list_instances_by_status(&[
                WorkflowInstanceStatus::Running,
                WorkflowInstanceStatus::Pending,
            ])
            .await?;

        let mut report = ScanReport {
            scanned: instances.len(),
            ..Default::default()
        };

        for instance in instances {
            if instance.updated_at > cutoff {
                continue;
            }
            if !self.is_truly_stalled(instance.instance_id).await? {
                continue;
            }
            report.stalled += 1;
            self.stats.lock().stalls_detected += 1;
            info!(instance_id = %instance.instance_id, "stalled workflow detected");

            let attempts = {
                let mut map = self.attempts.lock();
                let entry = map.entry(instance.instance_id).or_insert(0);
                *entry += 1;
                *entry
            };
            if attempts > self.config.max_recovery_attempts {
                warn!(
                    instance_id = %instance.instance_id,
                    attempts,
                    "recovery attempts exhausted; leaving workflow alone"
                );
                self.stats.lock().recovery_attempts_exhausted += 1;
                continue;
            }

            match self.recover_workflow_context(instance.instance_id, true).await {
                Ok(_) => {
                    report.recovered += 1;
                    self.stats.lock().recoveries += 1;
                }
                Err(e) => {
                    warn!(instance_id = %instance.instance_id, error = %e, "recovery failed");
                    self.stats.lock().failed_recoveries += 1;
                }
            }
        }

        if report.stalled > 0 {
            info!(
                scanned = report.scanned,
                stalled = report.stalled,
                recovered = report.recovered,
                "stall scan complete"
            );
        }
        Ok(report)
    }

    /// No task in flight, but at least one pending node has its entire
    /// upstream completed.
    async fn is_truly_stalled(&self, instance_id: Uuid) -> Result<bool> {
        let tasks = self.store.list_instance_tasks(instance_id).await?;
        if tasks
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
        {
            return Ok(false);
        }

        let instance = self.store.get_instance(instance_id).await?;
        let graph = self.store.get_template(instance.workflow_id).await?;
        let node_instances = self.store.list_node_instances(instance_id).await?;

        let completed_bases: HashSet<Uuid> = node_instances
            .iter()
            .filter(|n| n.status == NodeInstanceStatus::Completed)
            .map(|n| n.node_base_id)
            .collect();
        let upstream = graph.upstream_map();

        Ok(node_instances
            .iter()
            .filter(|n| n.status == NodeInstanceStatus::Pending)
            .any(|n| {
                upstream
                    .get(&n.node_base_id)
                    .is_some_and(|ups| ups.iter().all(|up| completed_bases.contains(up)))
            }))
    }

    /// Force-reload the context and re-drain ready nodes. With
    /// `force = false` the stall predicate is verified first (manual path).
    pub async fn recover_workflow_context(&self, instance_id: Uuid, force: bool) -> Result<bool> {
        let _gate = self.recovery_gate.lock().await;

        if !force && !self.is_truly_stalled(instance_id).await? {
            debug!(%instance_id, "recovery requested but workflow is not stalled");
            return Ok(false);
        }

        info!(%instance_id, "recovering workflow context");
        self.contexts.force_reload(instance_id).await?;
        self.engine.advance(instance_id).await?;
        Ok(true)
    }

    /// Fire completion callbacks for any registered workflow that reached a
    /// terminal state without the engine noticing (recovery paths).
    pub async fn poll_callbacks(&self) -> Result<usize> {
        let mut fired = 0;
        for instance_id in self.engine.callback_registry().registered_ids() {
            if self.engine.fire_callbacks_if_terminal(instance_id).await? {
                fired += 1;
            }
        }
        if fired > 0 {
            self.stats.lock().callbacks_fired += fired as u64;
        }
        Ok(fired)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
