use crate::events::EventKind;
use crate::state::{SharedState, DEADLINE_EXCEEDED};
use crate::types::TaskStatus;
use chrono::Utc;
use concord_core::{AgentId, Payload};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of one deadline pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorReport {
    /// Active tasks failed because their deadline passed.
    pub timed_out_active: Vec<Uuid>,
    /// Queued tasks removed because their deadline passed.
    pub timed_out_queued: Vec<Uuid>,
    /// Load ratio per agent after availability was recomputed.
    pub utilization: Vec<(AgentId, f64)>,
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Terminal tasks dropped from the history.
    pub tasks_removed: usize,
    /// Collaboration results dropped.
    pub collaborations_removed: usize,
}

/// Periodic deadline enforcement and history retention.
pub struct TaskMonitor {
    state: Arc<SharedState>,
    retention: chrono::Duration,
}

impl TaskMonitor {
    /// Monitor over `state` keeping history for `retention`.
    pub fn new(state: Arc<SharedState>, retention: chrono::Duration) -> Self {
        Self { state, retention }
    }

    /// Fail every active or queued task whose deadline has passed, then
    /// recompute agent availability and record utilization.
    pub async fn run_once(&self) -> MonitorReport {
        let now = Utc::now();
        let mut report = MonitorReport::default();

        let overdue: Vec<Uuid> = self
            .state
            .active
            .read()
            .await
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| t.id)
            .collect();

        for id in overdue {
            let mut results = Payload::new();
            results.insert("error".into(), DEADLINE_EXCEEDED.into());
            let finished = self
                .state
                .finish_active(
                    id,
                    TaskStatus::failed(DEADLINE_EXCEEDED),
                    Some(results),
                    EventKind::TaskTimeout,
                )
                .await;
            if finished.is_some() {
                warn!(task_id = %id, "Active task timed out");
                report.timed_out_active.push(id);
            }
        }

        let expired_queued = {
            let mut queue = self.state.queue.lock().await;
            let mut archived = Vec::new();
            for task in queue.drain_expired(now) {
                archived.push(
                    self.state
                        .archive_unassigned(task, TaskStatus::failed(DEADLINE_EXCEEDED))
                        .await,
                );
            }
            archived
        };
        for task in expired_queued {
            warn!(task_id = %task.id, "Queued task timed out");
            report.timed_out_queued.push(task.id);
            self.state.settle_unassigned(&task, EventKind::TaskTimeout).await;
        }

        report.utilization = self.state.registry.recompute_availability();
        self.state
            .stats
            .record_utilization(report.utilization.iter().cloned());
        report
    }

    /// Drop history entries older than the retention window.
    pub async fn cleanup_once(&self) -> CleanupReport {
        let cutoff = Utc::now() - self.retention;
        let (tasks_removed, collaborations_removed) = self.state.prune_history(cutoff).await;
        CleanupReport {
            tasks_removed,
            collaborations_removed,
        }
    }

    /// Run [`TaskMonitor::run_once`] every `period` until shutdown.
    pub async fn run(self: Arc<Self>, period: Duration, shutdown: watch::Receiver<bool>) {
        info!(period_secs = period.as_secs_f64(), "Monitor started");
        let monitor = self;
        every(period, shutdown, move || {
            let monitor = monitor.clone();
            async move {
                let report = monitor.run_once().await;
                let expired = report.timed_out_active.len() + report.timed_out_queued.len();
                if expired > 0 {
                    info!(expired, "Monitor pass failed overdue tasks");
                }
            }
        })
        .await;
        info!("Monitor stopped");
    }

    /// Run [`TaskMonitor::cleanup_once`] every `period` until shutdown.
    pub async fn run_cleanup(self: Arc<Self>, period: Duration, shutdown: watch::Receiver<bool>) {
        let monitor = self;
        every(period, shutdown, move || {
            let monitor = monitor.clone();
            async move {
                let report = monitor.cleanup_once().await;
                if report != CleanupReport::default() {
                    info!(
                        tasks_removed = report.tasks_removed,
                        collaborations_removed = report.collaborations_removed,
                        "Cleanup pass pruned history"
                    );
                }
            }
        })
        .await;
        info!("Cleanup loop stopped");
    }
}

/// Tick `pass` at a fixed period; the first tick fires after one period.
async fn every<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut pass: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = ticker.tick() => pass().await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
