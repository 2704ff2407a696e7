use crate::types::{Task, TaskPriority};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

/// One FIFO bucket per priority level.
///
/// `pop_highest` always drains the highest non-empty bucket first, so a steady
/// stream of Emergency tasks starves the lower levels.
pub struct TaskQueue {
    buckets: BTreeMap<TaskPriority, VecDeque<Task>>,
}

impl TaskQueue {
    /// Empty queue with one bucket per priority.
    pub fn new() -> Self {
        Self {
            buckets: TaskPriority::ALL
                .iter()
                .map(|p| (*p, VecDeque::new()))
                .collect(),
        }
    }

    /// Append a task to the back of its priority bucket.
    pub fn push(&mut self, task: Task) -> Uuid {
        let id = task.id;
        self.buckets.entry(task.priority).or_default().push_back(task);
        id
    }

    /// Remove and return the oldest task of the highest non-empty bucket.
    pub fn pop_highest(&mut self) -> Option<Task> {
        self.buckets
            .values_mut()
            .rev()
            .find(|bucket| !bucket.is_empty())
            .and_then(VecDeque::pop_front)
    }

    /// Peek at what `pop_highest` would return.
    pub fn peek_highest(&self) -> Option<&Task> {
        self.buckets.values().rev().find_map(VecDeque::front)
    }

    /// Remove a queued task wherever it sits.
    pub fn remove(&mut self, id: Uuid) -> Option<Task> {
        for bucket in self.buckets.values_mut() {
            if let Some(pos) = bucket.iter().position(|t| t.id == id) {
                return bucket.remove(pos);
            }
        }
        None
    }

    /// Find a queued task by id.
    pub fn get(&self, id: Uuid) -> Option<&Task> {
        self.buckets
            .values()
            .flat_map(VecDeque::iter)
            .find(|t| t.id == id)
    }

    /// Whether `id` is queued.
    pub fn contains(&self, id: Uuid) -> bool {
        self.get(id).is_some()
    }

    /// Remove every task whose deadline lies before `now`.
    pub fn drain_expired(&mut self, now: DateTime<Utc>) -> Vec<Task> {
        let mut expired = Vec::new();
        for bucket in self.buckets.values_mut() {
            let (gone, kept): (VecDeque<Task>, VecDeque<Task>) =
                bucket.drain(..).partition(|t| t.is_expired(now));
            *bucket = kept;
            expired.extend(gone);
        }
        expired
    }

    /// Total queued tasks.
    pub fn len(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    /// True when every bucket is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(VecDeque::is_empty)
    }

    /// Tasks queued at `priority`.
    pub fn len_for(&self, priority: TaskPriority) -> usize {
        self.buckets.get(&priority).map_or(0, VecDeque::len)
    }

    /// Tasks in dispatch order (highest priority first, FIFO inside a level).
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.buckets.values().rev().flat_map(VecDeque::iter)
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
