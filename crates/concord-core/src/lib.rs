//! Core types and error definitions for the Concord orchestration engine.
//!
//! This crate holds the pieces shared by every Concord crate: the unified
//! error enum, the agent identity newtype and the opaque payload type that
//! flows between the orchestrator and the worker adapters.
//!
//! # Main types
//!
//! - [`ConcordError`]: Unified error enum for all Concord subsystems.
//! - [`ConcordResult`]: Convenience alias for `Result<T, ConcordError>`.
//! - [`AgentId`]: Identity of a specialist agent.
//! - [`Payload`]: Opaque structured map exchanged with agents.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Concord engine.
///
/// Agent-level failures are usually recovered into per-agent results; the
/// variants below are what reaches callers or ends up as a task's failure
/// reason.
#[derive(Debug, thiserror::Error)]
pub enum ConcordError {
    /// The assignment strategy found no eligible agent for the task.
    #[error("no agents available")]
    NoAgentsAvailable,

    /// A single agent invocation through the worker adapter failed.
    #[error("agent {agent} failed: {reason}")]
    WorkerExecution {
        /// The agent whose invocation failed.
        agent: AgentId,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The task's deadline passed before it reached a terminal state.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// No task with the given id is known.
    #[error("unknown task: {0}")]
    UnknownTask(Uuid),

    /// No agent with the given id is registered.
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// A status change that the task lifecycle does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from the persistence adapter.
    #[error("Store error: {0}")]
    Store(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConcordError {
    /// Shorthand for a [`ConcordError::WorkerExecution`].
    pub fn worker(agent: impl Into<AgentId>, reason: impl Into<String>) -> Self {
        ConcordError::WorkerExecution {
            agent: agent.into(),
            reason: reason.into(),
        }
    }
}

/// A convenience `Result` alias using [`ConcordError`].
pub type ConcordResult<T> = Result<T, ConcordError>;

// --- Shared types ---

/// Opaque structured map passed to and returned from agents.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Builds a [`Payload`] from a JSON value, keeping only object members.
///
/// Non-object values are wrapped under a `"value"` key so nothing is lost.
pub fn payload_from(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => Payload::new(),
        other => {
            let mut map = Payload::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Identity of a specialist agent (e.g. `"senior-specialist"`).
///
/// Ordering is lexicographic, which is also the tie-break order used when
/// several agents score equally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Creates an agent id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_id_ordering_is_lexicographic() {
        let mut ids = vec![
            AgentId::from("wellness-coach"),
            AgentId::from("assistant"),
            AgentId::from("specialist"),
        ];
        ids.sort();
        assert_eq!(ids[0].as_str(), "assistant");
        assert_eq!(ids[2].as_str(), "wellness-coach");
    }

    #[test]
    fn test_agent_id_serializes_as_plain_string() {
        let id = AgentId::new("specialist");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"specialist\"");
    }

    #[test]
    fn test_payload_from_object_and_scalar() {
        let obj = payload_from(json!({"a": 1}));
        assert_eq!(obj.get("a"), Some(&json!(1)));

        let scalar = payload_from(json!("text"));
        assert_eq!(scalar.get("value"), Some(&json!("text")));

        assert!(payload_from(serde_json::Value::Null).is_empty());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ConcordError::NoAgentsAvailable.to_string(),
            "no agents available"
        );
        assert_eq!(
            ConcordError::DeadlineExceeded.to_string(),
            "deadline exceeded"
        );
        let err = ConcordError::worker("specialist", "boom");
        assert_eq!(err.to_string(), "agent specialist failed: boom");
    }
}
