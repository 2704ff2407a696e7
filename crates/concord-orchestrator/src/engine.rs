use crate::collaboration::CollaborationExecutor;
use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::events::{CallbackId, EventHandler, EventKind, TaskEvent};
use crate::monitor::{CleanupReport, MonitorReport, TaskMonitor};
use crate::registry::CapabilityRegistry;
use crate::state::SharedState;
use crate::stats::Statistics;
use crate::store::{MemoryTaskStore, TaskStore};
use crate::strategy::CollaborationTable;
use crate::types::{
    AgentStatus, CapabilityUpdate, CollaborationResult, TaskSnapshot, TaskStatus, TaskSubmission,
};
use crate::worker::WorkerAdapter;
use concord_core::{AgentId, ConcordError, ConcordResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Public entry point: accepts tasks, runs them on agents and reports on
/// their progress.
///
/// Cheap to clone; every clone drives the same state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    config: OrchestratorConfig,
    state: Arc<SharedState>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<TaskMonitor>,
}

impl Orchestrator {
    /// Build an orchestrator that mirrors tasks into memory only.
    pub fn new(config: OrchestratorConfig, worker: Arc<dyn WorkerAdapter>) -> ConcordResult<Self> {
        Self::with_store(config, worker, Arc::new(MemoryTaskStore::new()))
    }

    /// Build an orchestrator that mirrors tasks into `store`.
    pub fn with_store(
        config: OrchestratorConfig,
        worker: Arc<dyn WorkerAdapter>,
        store: Arc<dyn TaskStore>,
    ) -> ConcordResult<Self> {
        config.validate()?;

        let registry = Arc::new(CapabilityRegistry::from_capabilities(
            config.agents.iter().cloned(),
        ));
        let state = Arc::new(SharedState::new(
            registry,
            store,
            config.event_buffer,
            config.max_task_history,
            config.max_collaboration_history,
        ));
        let executor = CollaborationExecutor::new(worker, config.collaboration_policy());
        let dispatcher = Arc::new(Dispatcher::new(
            state.clone(),
            config.assignment_strategy,
            CollaborationTable::new(config.collaboration_patterns.iter().cloned()),
            executor,
        ));
        let monitor = Arc::new(TaskMonitor::new(state.clone(), config.retention()));

        info!(
            agents = config.agents.len(),
            strategy = %config.assignment_strategy,
            "Orchestrator initialized"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state,
                dispatcher,
                monitor,
            }),
        })
    }

    /// Configuration the orchestrator was built from.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Queue a task and return its id.
    pub async fn submit_task(&self, submission: TaskSubmission) -> ConcordResult<Uuid> {
        let task = submission.into_task();
        let id = task.id;
        let state = &self.inner.state;

        state.stats.record_submitted(task.task_type);
        state.persist(&task).await;
        if let Err(e) = state.store.push_queue(id).await {
            warn!(task_id = %id, error = %e, "Failed to update queue mirror");
        }

        let snapshot = TaskSnapshot::of(&task, None);
        info!(
            task_id = %id,
            task_type = %task.task_type,
            priority = %task.priority,
            mode = %task.mode,
            "Task submitted"
        );
        state.queue.lock().await.push(task);
        state.wakeup.notify_one();
        state
            .events
            .publish(TaskEvent::new(EventKind::TaskSubmitted, snapshot))
            .await;
        Ok(id)
    }

    /// Current view of a queued, active or finished task.
    pub async fn get_task_status(&self, id: Uuid) -> Option<TaskSnapshot> {
        self.inner.state.snapshot(id).await
    }

    /// Cancel a queued or active task. Returns true only for the call that
    /// actually cancelled it.
    pub async fn cancel_task(&self, id: Uuid) -> bool {
        let state = &self.inner.state;

        let cancelled = {
            let mut queue = state.queue.lock().await;
            match queue.remove(id) {
                Some(task) => Some(state.archive_unassigned(task, TaskStatus::Cancelled).await),
                None => None,
            }
        };
        if let Some(task) = cancelled {
            info!(task_id = %id, "Queued task cancelled");
            state.settle_unassigned(&task, EventKind::TaskCancelled).await;
            return true;
        }

        state
            .finish_active(id, TaskStatus::Cancelled, None, EventKind::TaskCancelled)
            .await
            .is_some()
    }

    /// Mark an in-progress task as taken over by a supervising agent.
    pub async fn escalate_task(&self, id: Uuid) -> ConcordResult<()> {
        let state = &self.inner.state;
        let task = {
            let mut active = state.active.write().await;
            let task = active.get_mut(&id).ok_or(ConcordError::UnknownTask(id))?;
            task.transition(TaskStatus::Escalated)?;
            task.clone()
        };
        info!(task_id = %id, "Task escalated");
        state.persist(&task).await;
        Ok(())
    }

    /// Capability and load ratio of every agent.
    pub fn get_agent_status(&self) -> BTreeMap<AgentId, AgentStatus> {
        self.inner
            .state
            .registry
            .snapshot()
            .into_iter()
            .map(|cap| (cap.agent_id.clone(), AgentStatus::from(cap)))
            .collect()
    }

    /// Counters plus current queue and active sizes.
    pub async fn get_statistics(&self) -> Statistics {
        let state = &self.inner.state;
        let queued = state.queue_len().await;
        let active = state.active_len().await;
        state
            .stats
            .snapshot(active, queued, state.collaboration_history_len())
    }

    /// Call `handler` for every event of `kind`.
    pub fn add_event_callback(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> CallbackId {
        self.inner.state.events.add(kind, handler)
    }

    /// Unregister a callback. False when it was not registered.
    pub fn remove_event_callback(&self, kind: EventKind, id: CallbackId) -> bool {
        self.inner.state.events.remove(kind, id)
    }

    /// Receive every lifecycle event as it is published.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.state.events.subscribe()
    }

    /// Apply a partial capability update to a registered agent.
    pub fn update_agent_capability(&self, agent: &AgentId, update: CapabilityUpdate) -> ConcordResult<()> {
        self.inner.state.registry.update(agent, update).map(|_| ())
    }

    /// Run the next queued task to completion on the calling task.
    pub async fn dispatch_next(&self) -> Option<Uuid> {
        self.inner.dispatcher.dispatch_next().await
    }

    /// Run one deadline and utilization pass now.
    pub async fn run_monitor_pass(&self) -> MonitorReport {
        self.inner.monitor.run_once().await
    }

    /// Run one retention pass now.
    pub async fn run_cleanup_pass(&self) -> CleanupReport {
        self.inner.monitor.cleanup_once().await
    }

    /// Retained multi-agent collaboration results, oldest first.
    pub fn collaboration_history(&self) -> Vec<CollaborationResult> {
        self.inner.state.collaborations.read().iter().cloned().collect()
    }

    /// Number of queued tasks.
    pub async fn queue_len(&self) -> usize {
        self.inner.state.queue_len().await
    }

    /// True when nothing is queued or running.
    pub async fn is_idle(&self) -> bool {
        self.inner.state.queue_len().await == 0 && self.inner.state.active_len().await == 0
    }

    /// Spawn the dispatcher, monitor and cleanup loops.
    pub fn start(&self) -> OrchestratorHandle {
        let (tx, rx) = watch::channel(false);
        let config = &self.inner.config;

        let handles = vec![
            tokio::spawn(
                self.inner
                    .dispatcher
                    .clone()
                    .run(config.idle_poll(), rx.clone()),
            ),
            tokio::spawn(
                self.inner
                    .monitor
                    .clone()
                    .run(config.monitor_interval(), rx.clone()),
            ),
            tokio::spawn(
                self.inner
                    .monitor
                    .clone()
                    .run_cleanup(config.cleanup_interval(), rx),
            ),
        ];
        info!("Orchestrator loops started");

        OrchestratorHandle {
            shutdown: tx,
            handles,
            state: self.inner.state.clone(),
        }
    }
}

/// Running background loops. Dropping the handle also stops them, but
/// without waiting; prefer [`OrchestratorHandle::shutdown`].
pub struct OrchestratorHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    state: Arc<SharedState>,
}

impl OrchestratorHandle {
    /// Signal every loop to stop and wait for them. A task already being
    /// dispatched runs to completion first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.state.wakeup.notify_one();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Orchestrator loop ended abnormally");
            }
        }
        info!("Orchestrator loops stopped");
    }
}
