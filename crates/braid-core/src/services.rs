//! Explicit dependency injection of the core subsystems.
//!
//! One `CoreServices` lives for the life of the process; nothing in the
//! crate reaches for a global. `start()` brings up the agent worker pool
//! and the monitor loops, `shutdown()` stops them.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::BraidConfig;
use crate::context::ContextManager;
use crate::dispatch::{AgentClient, AgentWorkerPool, TaskInbox};
use crate::engine::{CallbackRegistry, ExecutionEngine};
use crate::merge::MergeEngine;
use crate::monitor::StallMonitor;
use crate::store::Store;
use crate::subdivision::SubdivisionService;

pub struct CoreServices {
    pub config: BraidConfig,
    pub store: Arc<dyn Store>,
    pub contexts: Arc<ContextManager>,
    pub engine: Arc<ExecutionEngine>,
    pub inbox: TaskInbox,
    pub subdivisions: SubdivisionService,
    pub merges: MergeEngine,
    pub monitor: Arc<StallMonitor>,
    agent_pool: AgentWorkerPool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl CoreServices {
    pub fn new(
        config: BraidConfig,
        store: Arc<dyn Store>,
        agent_client: Arc<dyn AgentClient>,
    ) -> Self {
        let contexts = Arc::new(ContextManager::new(store.clone(), config.context.clone()));
        let callbacks = Arc::new(CallbackRegistry::new());
        let (agent_tx, agent_rx) = async_channel::bounded(config.engine.agent_queue_capacity);

        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            contexts.clone(),
            config.engine.clone(),
            agent_tx,
            callbacks,
        ));
        let agent_pool = AgentWorkerPool::new(
            engine.clone(),
            agent_client,
            agent_rx,
            config.engine.clone(),
        );
        let inbox = TaskInbox::new(store.clone());
        let subdivisions =
            SubdivisionService::new(store.clone(), engine.clone(), contexts.clone());
        let merges = MergeEngine::new(store.clone());
        let monitor = Arc::new(StallMonitor::new(
            store.clone(),
            contexts.clone(),
            engine.clone(),
            config.monitor.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            store,
            contexts,
            engine,
            inbox,
            subdivisions,
            merges,
            monitor,
            agent_pool,
            shutdown_tx,
            shutdown_rx,
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Bring up background work: agent workers and the monitor loops.
    pub fn start(&self) {
        self.agent_pool.start();
        let handles = self.monitor.spawn(self.shutdown_rx.clone());
        self.handles.lock().extend(handles);
        info!("core services started");
    }

    /// Stop background work. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.agent_pool.stop();
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        info!("core services stopped");
    }

    pub fn agent_queue_depth(&self) -> usize {
        self.agent_pool.queue_depth()
    }
}

impl Drop for CoreServices {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
