use crate::types::TaskSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_core::{ConcordError, ConcordResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Lifecycle events published by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A task entered the queue.
    TaskSubmitted,
    /// Agents were reserved for a task.
    TaskAssigned,
    /// A task reached a terminal state through dispatch.
    TaskCompleted,
    /// A task missed its deadline.
    TaskTimeout,
    /// A task was cancelled.
    TaskCancelled,
}

impl EventKind {
    /// Every kind, in lifecycle order.
    pub const ALL: [EventKind; 5] = [
        EventKind::TaskSubmitted,
        EventKind::TaskAssigned,
        EventKind::TaskCompleted,
        EventKind::TaskTimeout,
        EventKind::TaskCancelled,
    ];

    /// Snake-case name used in logs and serialized events.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TaskSubmitted => "task_submitted",
            EventKind::TaskAssigned => "task_assigned",
            EventKind::TaskCompleted => "task_completed",
            EventKind::TaskTimeout => "task_timeout",
            EventKind::TaskCancelled => "task_cancelled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ConcordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConcordError::Config(format!("unknown event kind: {s}")))
    }
}

/// A lifecycle event together with the task state at the time it happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// What happened.
    pub kind: EventKind,
    /// Task state when it happened.
    pub task: TaskSnapshot,
    /// When it was published.
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    /// Event stamped with the current time.
    pub fn new(kind: EventKind, task: TaskSnapshot) -> Self {
        Self {
            kind,
            task,
            timestamp: Utc::now(),
        }
    }
}

/// Receives events of the kinds it was registered for.
///
/// An error is logged and otherwise ignored; it never affects the task.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors are logged and do not stop delivery.
    async fn on_event(&self, event: &TaskEvent) -> ConcordResult<()>;
}

/// Adapts a plain closure into an [`EventHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&TaskEvent) -> ConcordResult<()> + Send + Sync,
{
    async fn on_event(&self, event: &TaskEvent) -> ConcordResult<()> {
        (self.f)(event)
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&TaskEvent) -> ConcordResult<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

/// Token returned by registration, used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackId(u64);

type HandlerList = Vec<(CallbackId, Arc<dyn EventHandler>)>;

/// Per-kind callback registry plus a broadcast channel carrying every event.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, HandlerList>>,
    next_id: AtomicU64,
    tx: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Bus whose broadcast channel holds `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tx,
        }
    }

    /// Register `handler` for `kind`.
    pub fn add(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        debug!(event = %kind, callback = id.0, "Registered event callback");
        id
    }

    /// Returns false when no such registration exists.
    pub fn remove(&self, kind: EventKind, id: CallbackId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        before != list.len()
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Stream of every event, independent of registered callbacks.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Deliver to every callback registered for the event's kind, in
    /// registration order, then to broadcast subscribers.
    pub async fn publish(&self, event: TaskEvent) {
        let handlers: HandlerList = self
            .handlers
            .read()
            .get(&event.kind)
            .cloned()
            .unwrap_or_default();

        for (id, handler) in handlers {
            if let Err(e) = handler.on_event(&event).await {
                error!(
                    event = %event.kind,
                    task_id = %event.task.id,
                    callback = id.0,
                    error = %e,
                    "Event callback failed"
                );
            }
        }

        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
