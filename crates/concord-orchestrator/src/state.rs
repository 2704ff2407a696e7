//! State shared by the facade, the dispatcher and the monitor.
//!
//! Lock order is queue, then active, then history. Event publication and
//! store calls always happen after every lock has been released, so a
//! callback may call back into the orchestrator.

use crate::events::{EventBus, EventKind, TaskEvent};
use crate::registry::CapabilityRegistry;
use crate::stats::StatsCollector;
use crate::store::TaskStore;
use crate::task_queue::TaskQueue;
use crate::types::{CollaborationResult, Task, TaskSnapshot, TaskStatus};
use chrono::{DateTime, Utc};
use concord_core::Payload;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Failure reason for a task whose deadline passed.
pub const DEADLINE_EXCEEDED: &str = "deadline exceeded";
/// Failure reason for a task no agent could take.
pub const NO_AGENTS_AVAILABLE: &str = "no agents available";

/// State shared by the facade, the dispatcher and the monitor.
pub struct SharedState {
    /// Agent capabilities and load.
    pub registry: Arc<CapabilityRegistry>,
    /// Tasks waiting for dispatch. Locked first.
    pub queue: Mutex<TaskQueue>,
    /// Assigned and running tasks. Locked after the queue.
    pub active: RwLock<HashMap<Uuid, Task>>,
    /// Terminal tasks, oldest first. Locked last.
    pub history: RwLock<VecDeque<Task>>,
    /// Multi-agent results, oldest first.
    pub collaborations: parking_lot::RwLock<VecDeque<CollaborationResult>>,
    /// Lifetime counters.
    pub stats: StatsCollector,
    /// Callback and broadcast fan-out.
    pub events: EventBus,
    /// Persistence mirror.
    pub store: Arc<dyn TaskStore>,
    /// Signalled on submit so an idle dispatcher wakes early.
    pub wakeup: Notify,
    max_task_history: usize,
    max_collaboration_history: usize,
}

impl SharedState {
    /// Empty state with bounded histories.
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn TaskStore>,
        event_buffer: usize,
        max_task_history: usize,
        max_collaboration_history: usize,
    ) -> Self {
        Self {
            registry,
            queue: Mutex::new(TaskQueue::new()),
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            collaborations: parking_lot::RwLock::new(VecDeque::new()),
            stats: StatsCollector::new(),
            events: EventBus::new(event_buffer),
            store,
            wakeup: Notify::new(),
            max_task_history: max_task_history.max(1),
            max_collaboration_history: max_collaboration_history.max(1),
        }
    }

    /// Move an active task to a terminal status.
    ///
    /// Removal from the active table is the only place assigned load is
    /// released, so whichever path removes the task first wins and every
    /// other path gets `None`. The task enters the history before the
    /// active lock is dropped, so lookups never miss it.
    pub async fn finish_active(
        &self,
        id: Uuid,
        status: TaskStatus,
        results: Option<Payload>,
        kind: EventKind,
    ) -> Option<Task> {
        let task = {
            let mut active = self.active.write().await;
            let mut task = active.remove(&id)?;
            if let Err(e) = task.transition(status) {
                warn!(task_id = %id, error = %e, "Rejected terminal transition");
                active.insert(id, task);
                return None;
            }
            let now = Utc::now();
            task.completed_at = Some(now);
            task.actual_duration_ms = task.started_at.map(|started| millis_between(started, now));
            if let Some(results) = results {
                task.results = results;
            }
            self.push_history(task.clone()).await;
            task
        };

        self.registry.release(&task.assigned_agents);

        info!(
            task_id = %id,
            status = %task.status,
            duration_ms = task.actual_duration_ms.unwrap_or_default(),
            "Task finished"
        );
        self.settle(&task, kind).await;
        Some(task)
    }

    /// Terminate a task that left the queue without ever holding load.
    ///
    /// Call while still holding the queue lock, then hand the returned task
    /// to [`SharedState::settle_unassigned`] once the lock is released.
    pub async fn archive_unassigned(&self, mut task: Task, status: TaskStatus) -> Task {
        if let Err(e) = task.transition(status) {
            warn!(task_id = %task.id, error = %e, "Rejected terminal transition");
        }
        task.completed_at = Some(Utc::now());
        if let Some(reason) = task.failure_reason() {
            let reason = reason.to_string();
            task.results.insert("error".into(), reason.into());
        }
        self.push_history(task.clone()).await;
        task
    }

    /// Bookkeeping for a task finished by [`SharedState::archive_unassigned`].
    pub async fn settle_unassigned(&self, task: &Task, kind: EventKind) {
        info!(task_id = %task.id, status = %task.status, "Task finished without running");
        self.remove_from_queue_mirror(task.id).await;
        self.settle(task, kind).await;
    }

    async fn push_history(&self, task: Task) {
        let mut history = self.history.write().await;
        history.push_back(task);
        while history.len() > self.max_task_history {
            history.pop_front();
        }
    }

    /// Stats, persistence and notification for a terminal task.
    async fn settle(&self, task: &Task, kind: EventKind) {
        self.stats.record_terminal(
            &task.status,
            task.actual_duration_ms,
            kind == EventKind::TaskTimeout,
        );
        self.persist(task).await;
        self.events
            .publish(TaskEvent::new(kind, TaskSnapshot::of(task, None)))
            .await;
    }

    /// Mirror `task` into the store, logging failures.
    pub async fn persist(&self, task: &Task) {
        if let Err(e) = self.store.save_record(task.id, &task.to_record()).await {
            warn!(task_id = %task.id, error = %e, "Failed to persist task record");
        }
    }

    /// Drop `id` from the store's queue mirror, logging failures.
    pub async fn remove_from_queue_mirror(&self, id: Uuid) {
        if let Err(e) = self.store.remove_queue(id).await {
            warn!(task_id = %id, error = %e, "Failed to update queue mirror");
        }
    }

    /// Keep a collaboration result when more than one agent took part.
    pub fn record_collaboration(&self, result: &CollaborationResult) {
        if result.participants.len() < 2 {
            return;
        }
        self.stats.record_collaboration(result.success);
        let mut collaborations = self.collaborations.write();
        collaborations.push_back(result.clone());
        while collaborations.len() > self.max_collaboration_history {
            collaborations.pop_front();
        }
    }

    /// Look a task up in the queue, the active table and the history, in
    /// that order.
    pub async fn snapshot(&self, id: Uuid) -> Option<TaskSnapshot> {
        if let Some(task) = self.queue.lock().await.get(id) {
            return Some(TaskSnapshot::of(task, None));
        }
        if let Some(task) = self.active.read().await.get(&id) {
            return Some(TaskSnapshot::of(task, self.estimate_completion(task)));
        }
        self.history
            .read()
            .await
            .iter()
            .rev()
            .find(|t| t.id == id)
            .map(|t| TaskSnapshot::of(t, None))
    }

    /// `started_at` plus twice the slowest assigned agent's response time.
    /// `None` when the task has not started or the sum leaves chrono's range.
    pub fn estimate_completion(&self, task: &Task) -> Option<DateTime<Utc>> {
        let started = task.started_at?;
        let slowest = task
            .assigned_agents
            .iter()
            .filter_map(|agent| self.registry.get(agent))
            .map(|cap| cap.response_time_secs)
            .fold(0.0_f64, f64::max);
        let millis = (slowest * 2_000.0).round() as i64;
        started.checked_add_signed(chrono::Duration::try_milliseconds(millis)?)
    }

    /// Drop history entries that finished before `cutoff`. Returns how many
    /// task and collaboration entries were removed.
    pub async fn prune_history(&self, cutoff: DateTime<Utc>) -> (usize, usize) {
        let tasks_removed = {
            let mut history = self.history.write().await;
            let before = history.len();
            history.retain(|t| t.completed_at.map_or(true, |at| at > cutoff));
            before - history.len()
        };
        let collaborations_removed = {
            let mut collaborations = self.collaborations.write();
            let before = collaborations.len();
            collaborations.retain(|c| c.completed_at > cutoff);
            before - collaborations.len()
        };
        if tasks_removed + collaborations_removed > 0 {
            debug!(tasks_removed, collaborations_removed, "Pruned history");
        }
        (tasks_removed, collaborations_removed)
    }

    /// Number of queued tasks.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Number of assigned or running tasks.
    pub async fn active_len(&self) -> usize {
        self.active.read().await.len()
    }

    /// Number of retained collaboration results.
    pub fn collaboration_history_len(&self) -> usize {
        self.collaborations.read().len()
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use crate::types::{AgentCapability, TaskType};
    use concord_core::AgentId;

    fn state() -> SharedState {
        let registry = Arc::new(CapabilityRegistry::from_capabilities([AgentCapability::new(
            "assistant",
            [TaskType::Education],
            0.7,
            2,
            2.0,
            0.85,
        )]));
        SharedState::new(registry, Arc::new(MemoryTaskStore::new()), 16, 3, 3)
    }

    fn running_task(state: &SharedState) -> Task {
        let agent = AgentId::from("assistant");
        assert!(state.registry.reserve(std::slice::from_ref(&agent)));
        let mut task = Task::new(TaskType::Education, "t", "", "user", Payload::new());
        task.transition(TaskStatus::Assigned).unwrap();
        task.transition(TaskStatus::InProgress).unwrap();
        task.assigned_agents = vec![agent];
        task.started_at = Some(Utc::now());
        task
    }

    #[tokio::test]
    async fn test_finish_active_releases_once() {
        let state = state();
        let task = running_task(&state);
        let id = task.id;
        state.active.write().await.insert(id, task);

        let done = state
            .finish_active(id, TaskStatus::Cancelled, None, EventKind::TaskCancelled)
            .await;
        assert!(done.is_some());
        let again = state
            .finish_active(id, TaskStatus::Completed, None, EventKind::TaskCompleted)
            .await;
        assert!(again.is_none());

        let cap = state.registry.get(&AgentId::from("assistant")).unwrap();
        assert_eq!(cap.current_load, 0);
        assert_eq!(state.snapshot(id).await.unwrap().status, TaskStatus::Cancelled);
    }

    async fn finish_unassigned(state: &SharedState, task: Task, status: TaskStatus, kind: EventKind) {
        let task = state.archive_unassigned(task, status).await;
        state.settle_unassigned(&task, kind).await;
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let state = state();
        for _ in 0..5 {
            let task = Task::new(TaskType::Education, "t", "", "user", Payload::new());
            finish_unassigned(
                &state,
                task,
                TaskStatus::failed(NO_AGENTS_AVAILABLE),
                EventKind::TaskCompleted,
            )
            .await;
        }
        assert_eq!(state.history.read().await.len(), 3);
        assert_eq!(state.stats.snapshot(0, 0, 0).failed_tasks, 5);
    }

    #[tokio::test]
    async fn test_estimate_completion_doubles_slowest_response() {
        let state = state();
        let task = running_task(&state);
        let estimate = state.estimate_completion(&task).unwrap();
        let started = task.started_at.unwrap();
        assert_eq!((estimate - started).num_milliseconds(), 4_000);
    }

    #[tokio::test]
    async fn test_estimate_completion_out_of_range_is_none() {
        let state = state();
        let task = running_task(&state);
        for secs in [1e13, f64::MAX] {
            state.registry.register(
                AgentCapability::new("assistant", [TaskType::Education], 0.7, 2, secs, 0.85)
                    .with_load(1),
            );
            assert!(state.estimate_completion(&task).is_none());
        }

        let id = task.id;
        state.active.write().await.insert(id, task);
        let snapshot = state.snapshot(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::InProgress);
        assert!(snapshot.estimated_completion.is_none());
    }

    #[tokio::test]
    async fn test_prune_history_by_age() {
        let state = state();
        let task = Task::new(TaskType::Education, "t", "", "user", Payload::new());
        finish_unassigned(&state, task, TaskStatus::Cancelled, EventKind::TaskCancelled).await;
        assert_eq!(state.prune_history(Utc::now() - chrono::Duration::days(1)).await, (0, 0));
        assert_eq!(state.prune_history(Utc::now() + chrono::Duration::seconds(1)).await, (1, 0));
    }
}
