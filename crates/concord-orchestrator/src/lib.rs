//! Multi-agent task orchestration: priority scheduling, agent assignment
//! and collaboration protocols.
//!
//! Tasks are queued by priority, matched to specialist agents by a
//! configurable assignment strategy under per-agent load limits, executed
//! through one of four collaboration protocols, and tracked through their
//! lifecycle to a terminal state.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Public facade over submission, inspection and the background loops.
//! - [`CapabilityRegistry`]: Agent capabilities and load counters.
//! - [`TaskQueue`]: Per-priority FIFO buckets.
//! - [`AssignmentStrategy`]: Heuristics that pick agents for a task.
//! - [`CollaborationExecutor`]: Sequential, parallel, hierarchical and consensus protocols.
//! - [`WorkerAdapter`]: Boundary to whatever actually runs an agent.
//! - [`TaskStore`]: Write-through persistence mirror.
//! - [`EventBus`]: Lifecycle callbacks and broadcast subscription.

/// Collaboration protocols and consensus counting.
pub mod collaboration;
/// Orchestrator settings loaded from TOML.
pub mod config;
/// Priority dispatch loop.
pub mod dispatcher;
/// Orchestrator facade and background loop handle.
pub mod engine;
/// Lifecycle event callbacks and broadcast.
pub mod events;
/// Deadline enforcement and history retention.
pub mod monitor;
/// Default agents and collaboration teams.
pub mod profiles;
/// Agent capability registry and load accounting.
pub mod registry;
/// State shared by the facade and the loops.
pub mod state;
/// Running statistics.
pub mod stats;
/// Persistence adapters.
pub mod store;
/// Agent assignment strategies.
pub mod strategy;
/// Priority task queue.
pub mod task_queue;
/// Shared orchestration types (Task, AgentCapability, CollaborationResult, etc.).
pub mod types;
/// Worker adapter boundary.
pub mod worker;

pub use collaboration::{
    build_consensus, merge_parallel, CollaborationExecutor, CollaborationPolicy,
    HierarchyAuthority,
};
pub use config::{OrchestratorConfig, MAX_AGENT_TIMEOUT_SECS};
pub use engine::{Orchestrator, OrchestratorHandle};
pub use events::{handler_fn, CallbackId, EventBus, EventHandler, EventKind, TaskEvent};
pub use monitor::{CleanupReport, MonitorReport, TaskMonitor};
pub use profiles::{default_capabilities, default_collaboration_patterns};
pub use registry::CapabilityRegistry;
pub use state::{DEADLINE_EXCEEDED, NO_AGENTS_AVAILABLE};
pub use stats::Statistics;
pub use store::{FileTaskStore, MemoryTaskStore, TaskStore};
pub use strategy::{AssignmentStrategy, CollaborationPattern, CollaborationTable};
pub use task_queue::TaskQueue;
pub use types::{
    AgentCapability, AgentOutcome, AgentStatus, CapabilityUpdate, CollaborationMode,
    CollaborationResult, Conclusion, ConsensusSummary, Task, TaskPriority, TaskRecord,
    TaskSnapshot, TaskStatus, TaskSubmission, TaskType,
};
pub use worker::{WorkerAdapter, WorkerOutput};
