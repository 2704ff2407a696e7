use crate::types::Task;
use async_trait::async_trait;
use concord_core::{AgentId, ConcordResult, Payload};
use serde::{Deserialize, Serialize};

/// What an agent hands back for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Output payload; in sequential chains this becomes the next agent's input.
    pub payload: Payload,
    /// Self-reported confidence in `[0, 1]`.
    pub confidence: f64,
    /// Recommendation items used by the parallel merge and consensus counting.
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl WorkerOutput {
    /// Output with no recommendations.
    pub fn new(payload: Payload, confidence: f64) -> Self {
        Self {
            payload,
            confidence,
            recommendations: Vec::new(),
        }
    }

    /// Attach recommendation items.
    pub fn with_recommendations<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recommendations = items.into_iter().map(Into::into).collect();
        self
    }
}

/// Boundary to whatever actually runs an agent against a task.
///
/// The orchestrator never looks inside the payloads; it only chains, merges
/// and counts them. Implementations must be cheap to call concurrently, as the
/// parallel, hierarchical and consensus protocols fan out to several agents at
/// once.
#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    /// Run `agent` on `task` with the given input payload.
    async fn execute(&self, agent: &AgentId, task: &Task, input: Payload) -> ConcordResult<WorkerOutput>;
}
