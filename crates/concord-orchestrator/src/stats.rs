use crate::types::{TaskStatus, TaskType};
use concord_core::AgentId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregated counters returned by `get_statistics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// Tasks ever submitted.
    pub total_tasks: u64,
    /// Tasks that completed.
    pub completed_tasks: u64,
    /// Includes timed-out tasks.
    pub failed_tasks: u64,
    /// Tasks cancelled before finishing.
    pub cancelled_tasks: u64,
    /// Failures caused by a missed deadline.
    pub timed_out_tasks: u64,
    /// Tasks assigned or running.
    pub active_tasks: usize,
    /// Tasks waiting in the queue.
    pub queued_tasks: usize,
    /// Mean wall time of completed tasks, in seconds.
    pub average_completion_secs: f64,
    /// Load ratio per agent as of the last monitor pass.
    pub agent_utilization: BTreeMap<AgentId, f64>,
    /// Submissions per task type.
    pub task_distribution: BTreeMap<TaskType, u64>,
    /// Share of recorded collaborations that succeeded.
    pub collaboration_success_rate: f64,
    /// Collaboration results currently retained.
    pub collaboration_history_size: usize,
}

#[derive(Default)]
struct Counters {
    total: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed_out: u64,
    completed_duration_ms: u64,
    completed_with_duration: u64,
    collaborations: u64,
    successful_collaborations: u64,
    utilization: BTreeMap<AgentId, f64>,
    distribution: BTreeMap<TaskType, u64>,
}

/// Thread-safe running totals. Gauges (active, queued, history size) are
/// supplied by the caller when a snapshot is taken.
#[derive(Default)]
pub struct StatsCollector {
    inner: Mutex<Counters>,
}

impl StatsCollector {
    /// Collector with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a submission of `task_type`.
    pub fn record_submitted(&self, task_type: TaskType) {
        let mut c = self.inner.lock();
        c.total += 1;
        *c.distribution.entry(task_type).or_default() += 1;
    }

    /// Count a terminal transition. Non-terminal statuses are ignored.
    pub fn record_terminal(&self, status: &TaskStatus, duration_ms: Option<u64>, timed_out: bool) {
        let mut c = self.inner.lock();
        match status {
            TaskStatus::Completed => {
                c.completed += 1;
                if let Some(ms) = duration_ms {
                    c.completed_duration_ms = c.completed_duration_ms.saturating_add(ms);
                    c.completed_with_duration += 1;
                }
            }
            TaskStatus::Failed { .. } => {
                c.failed += 1;
                if timed_out {
                    c.timed_out += 1;
                }
            }
            TaskStatus::Cancelled => c.cancelled += 1,
            _ => {}
        }
    }

    /// Count a recorded multi-agent collaboration.
    pub fn record_collaboration(&self, success: bool) {
        let mut c = self.inner.lock();
        c.collaborations += 1;
        if success {
            c.successful_collaborations += 1;
        }
    }

    /// Store the latest load ratio per agent.
    pub fn record_utilization(&self, ratios: impl IntoIterator<Item = (AgentId, f64)>) {
        let mut c = self.inner.lock();
        c.utilization.extend(ratios);
    }

    /// Copy the counters out, adding the live sizes.
    pub fn snapshot(&self, active: usize, queued: usize, collaboration_history_size: usize) -> Statistics {
        let c = self.inner.lock();
        let average_completion_secs = if c.completed_with_duration == 0 {
            0.0
        } else {
            c.completed_duration_ms as f64 / c.completed_with_duration as f64 / 1000.0
        };
        let collaboration_success_rate = if c.collaborations == 0 {
            0.0
        } else {
            c.successful_collaborations as f64 / c.collaborations as f64
        };

        Statistics {
            total_tasks: c.total,
            completed_tasks: c.completed,
            failed_tasks: c.failed,
            cancelled_tasks: c.cancelled,
            timed_out_tasks: c.timed_out,
            active_tasks: active,
            queued_tasks: queued,
            average_completion_secs,
            agent_utilization: c.utilization.clone(),
            task_distribution: c.distribution.clone(),
            collaboration_success_rate,
            collaboration_history_size,
        }
    }
}
