use crate::collaboration::CollaborationExecutor;
use crate::events::{EventKind, TaskEvent};
use crate::state::{SharedState, DEADLINE_EXCEEDED, NO_AGENTS_AVAILABLE};
use crate::strategy::{AssignmentStrategy, CollaborationTable};
use crate::types::{AgentCapability, Task, TaskSnapshot, TaskStatus};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happened to the task taken off the queue.
enum Popped {
    Expired(Task),
    Unassignable(Task),
    Assigned(Task),
}

/// Pops tasks in priority order and drives each one to a terminal state.
///
/// One dispatcher serializes pop, selection and reservation; the
/// collaboration it then runs may fan out to several agents.
pub struct Dispatcher {
    state: Arc<SharedState>,
    strategy: AssignmentStrategy,
    table: CollaborationTable,
    executor: CollaborationExecutor,
}

impl Dispatcher {
    /// Dispatcher over `state` with the given selection rules.
    pub fn new(
        state: Arc<SharedState>,
        strategy: AssignmentStrategy,
        table: CollaborationTable,
        executor: CollaborationExecutor,
    ) -> Self {
        Self {
            state,
            strategy,
            table,
            executor,
        }
    }

    /// Process the next queued task to completion.
    ///
    /// Returns the id of the task handled, or `None` when the queue was empty.
    pub async fn dispatch_next(&self) -> Option<Uuid> {
        let popped = self.pop_and_assign().await?;

        match popped {
            Popped::Expired(task) => {
                warn!(task_id = %task.id, "Task deadline passed while queued");
                self.state.settle_unassigned(&task, EventKind::TaskTimeout).await;
                Some(task.id)
            }
            Popped::Unassignable(task) => {
                warn!(task_id = %task.id, task_type = %task.task_type, "No agents available");
                self.state.settle_unassigned(&task, EventKind::TaskCompleted).await;
                Some(task.id)
            }
            Popped::Assigned(task) => {
                let id = task.id;
                self.run_assigned(task).await;
                Some(id)
            }
        }
    }

    /// Everything from pop to insertion into the active table (or the
    /// history) happens under the queue lock, so a concurrent cancel or
    /// status lookup always finds the task somewhere.
    async fn pop_and_assign(&self) -> Option<Popped> {
        let mut queue = self.state.queue.lock().await;
        let mut task = queue.pop_highest()?;

        if task.is_expired(Utc::now()) {
            let task = self
                .state
                .archive_unassigned(task, TaskStatus::failed(DEADLINE_EXCEEDED))
                .await;
            return Some(Popped::Expired(task));
        }

        let snapshot = self.state.registry.snapshot();
        let agents = self.strategy.select(&task, &snapshot, &self.table);
        if agents.is_empty() || !self.state.registry.reserve(&agents) {
            let task = self
                .state
                .archive_unassigned(task, TaskStatus::failed(NO_AGENTS_AVAILABLE))
                .await;
            return Some(Popped::Unassignable(task));
        }

        if let Err(e) = task.transition(TaskStatus::Assigned) {
            warn!(task_id = %task.id, error = %e, "Cannot assign task");
            self.state.registry.release(&agents);
            let task = self
                .state
                .archive_unassigned(task, TaskStatus::failed(NO_AGENTS_AVAILABLE))
                .await;
            return Some(Popped::Unassignable(task));
        }
        let slowest = snapshot
            .iter()
            .filter(|c| agents.contains(&c.agent_id))
            .map(|c| c.response_time_secs)
            .fold(0.0_f64, f64::max);
        task.estimated_duration_ms = Some((slowest * 1000.0).round() as u64);
        task.assigned_agents = agents;
        task.started_at = Some(Utc::now());

        self.state.active.write().await.insert(task.id, task.clone());
        Some(Popped::Assigned(task))
    }

    async fn run_assigned(&self, task: Task) {
        let id = task.id;
        info!(
            task_id = %id,
            priority = %task.priority,
            agents = ?task.assigned_agents.iter().map(|a| a.as_str()).collect::<Vec<_>>(),
            "Task assigned"
        );
        self.state.remove_from_queue_mirror(id).await;
        self.state.persist(&task).await;
        self.state
            .events
            .publish(TaskEvent::new(EventKind::TaskAssigned, TaskSnapshot::of(&task, None)))
            .await;

        // A cancel or timeout may already have removed it.
        let running = {
            let mut active = self.state.active.write().await;
            match active.get_mut(&id) {
                Some(task) => match task.transition(TaskStatus::InProgress) {
                    Ok(()) => Some(task.clone()),
                    Err(e) => {
                        warn!(task_id = %id, error = %e, "Cannot start task");
                        None
                    }
                },
                None => None,
            }
        };
        let Some(running) = running else {
            debug!(task_id = %id, "Task left the active table before it started");
            return;
        };

        let participants: Vec<AgentCapability> = running
            .assigned_agents
            .iter()
            .filter_map(|agent| self.state.registry.get(agent))
            .collect();
        let result = self.executor.execute(&running, &participants).await;

        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::failed(
                result
                    .error
                    .clone()
                    .unwrap_or_else(|| "collaboration failed".to_string()),
            )
        };
        let finished = self
            .state
            .finish_active(id, status, Some(result.to_task_results()), EventKind::TaskCompleted)
            .await;
        match finished {
            Some(_) => self.state.record_collaboration(&result),
            None => info!(task_id = %id, "Result discarded, task already terminal"),
        }
    }

    /// Dispatch until `shutdown` flips to true. Sleeps on the wakeup signal,
    /// at most `idle_poll`, whenever the queue is empty.
    pub async fn run(self: Arc<Self>, idle_poll: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(strategy = %self.strategy, "Dispatcher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.dispatch_next().await.is_some() {
                continue;
            }
            tokio::select! {
                _ = self.state.wakeup.notified() => {}
                _ = tokio::time::sleep(idle_poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Dispatcher stopped");
    }
}
