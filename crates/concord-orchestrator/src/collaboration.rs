//! Collaboration protocols.
//!
//! Every protocol is built from the same primitive, [`CollaborationExecutor::run_agent`],
//! which turns one worker call into an [`AgentOutcome`]. Worker errors never escape
//! this module: they are captured on the outcome, and the protocol decides whether
//! the collaboration as a whole failed.

use crate::types::{
    AgentCapability, AgentOutcome, CollaborationMode, CollaborationResult, Conclusion,
    ConsensusSummary, Task,
};
use crate::worker::WorkerAdapter;
use chrono::Utc;
use concord_core::{AgentId, ConcordError, Payload};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Conclusion text when no recommendation reaches the threshold.
pub const NO_CONSENSUS: &str = "no consensus";

/// Which participant gets the final word in a hierarchical collaboration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyAuthority {
    /// The participant with the highest expertise.
    #[default]
    HighestExpertise,
    /// The participant with the highest historical success rate.
    HighestSuccessRate,
}

impl HierarchyAuthority {
    fn key(self, cap: &AgentCapability) -> f64 {
        match self {
            HierarchyAuthority::HighestExpertise => cap.expertise,
            HierarchyAuthority::HighestSuccessRate => cap.success_rate,
        }
    }
}

/// Tunables shared by all protocols.
#[derive(Debug, Clone)]
pub struct CollaborationPolicy {
    /// Fraction of round-two responders that must name an item for it to be agreed.
    pub consensus_threshold: f64,
    /// Who decides in a hierarchical collaboration.
    pub authority: HierarchyAuthority,
    /// Upper bound on a single worker call. `None` waits forever.
    pub agent_timeout: Option<Duration>,
}

impl Default for CollaborationPolicy {
    fn default() -> Self {
        Self {
            consensus_threshold: 0.6,
            authority: HierarchyAuthority::default(),
            agent_timeout: None,
        }
    }
}

/// Runs one task across its assigned agents.
pub struct CollaborationExecutor {
    worker: Arc<dyn WorkerAdapter>,
    policy: CollaborationPolicy,
}

/// What a protocol produced before the common bookkeeping is added.
struct ProtocolOutput {
    individual: Vec<AgentOutcome>,
    first_round: Vec<AgentOutcome>,
    merged: Payload,
    consensus: Option<ConsensusSummary>,
    confidence: f64,
    error: Option<String>,
}

impl ProtocolOutput {
    fn failed(individual: Vec<AgentOutcome>, error: impl Into<String>) -> Self {
        Self {
            individual,
            first_round: Vec::new(),
            merged: Payload::new(),
            consensus: None,
            confidence: 0.0,
            error: Some(error.into()),
        }
    }
}

impl CollaborationExecutor {
    /// Executor calling `worker` under `policy`.
    pub fn new(worker: Arc<dyn WorkerAdapter>, policy: CollaborationPolicy) -> Self {
        Self { worker, policy }
    }

    /// Tunables in effect.
    pub fn policy(&self) -> &CollaborationPolicy {
        &self.policy
    }

    /// Run `task` across `agents` using the task's collaboration mode.
    ///
    /// `agents` is the participant list in assignment order. A single
    /// participant always runs once regardless of mode.
    pub async fn execute(&self, task: &Task, agents: &[AgentCapability]) -> CollaborationResult {
        let started = Instant::now();
        let participants: Vec<AgentId> = agents.iter().map(|c| c.agent_id.clone()).collect();

        info!(
            task_id = %task.id,
            mode = %task.mode,
            agents = participants.len(),
            "Starting collaboration"
        );

        let output = match (agents, task.mode) {
            ([], _) => ProtocolOutput::failed(Vec::new(), ConcordError::NoAgentsAvailable.to_string()),
            ([only], _) => self.single(task, &only.agent_id).await,
            (_, CollaborationMode::Sequential) => self.sequential(task, &participants).await,
            (_, CollaborationMode::Parallel) => self.parallel(task, &participants).await,
            (_, CollaborationMode::Hierarchical) => self.hierarchical(task, agents).await,
            (_, CollaborationMode::Consensus) => self.consensus(task, &participants).await,
        };

        let success = output.error.is_none();
        if success {
            info!(task_id = %task.id, confidence = output.confidence, "Collaboration succeeded");
        } else {
            warn!(
                task_id = %task.id,
                error = output.error.as_deref().unwrap_or_default(),
                "Collaboration failed"
            );
        }

        CollaborationResult {
            task_id: task.id,
            participants,
            mode: task.mode,
            individual_results: output.individual,
            first_round: output.first_round,
            merged_result: output.merged,
            consensus: output.consensus,
            confidence: output.confidence,
            duration_ms: elapsed_ms(started),
            success,
            error: output.error,
            completed_at: Utc::now(),
        }
    }

    /// Invoke the worker once and capture the result, bounded by the
    /// configured timeout.
    pub async fn run_agent(&self, agent: &AgentId, task: &Task, input: Payload) -> AgentOutcome {
        let started = Instant::now();
        let call = self.worker.execute(agent, task, input);
        let result = match self.policy.agent_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ConcordError::worker(
                    agent.clone(),
                    format!("timed out after {}ms", limit.as_millis()),
                )),
            },
            None => call.await,
        };

        let elapsed = elapsed_ms(started);
        match result {
            Ok(output) => {
                debug!(task_id = %task.id, agent = %agent, elapsed_ms = elapsed, "Agent finished");
                AgentOutcome {
                    agent: agent.clone(),
                    output: Some(output.payload),
                    confidence: Some(clamp_unit(output.confidence)),
                    recommendations: output.recommendations,
                    error: None,
                    elapsed_ms: elapsed,
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, agent = %agent, error = %e, "Agent failed");
                let reason = match e {
                    ConcordError::WorkerExecution { reason, .. } => reason,
                    other => other.to_string(),
                };
                AgentOutcome {
                    agent: agent.clone(),
                    output: None,
                    confidence: None,
                    recommendations: Vec::new(),
                    error: Some(reason),
                    elapsed_ms: elapsed,
                }
            }
        }
    }

    async fn fan_out(&self, task: &Task, agents: &[AgentId], input: &Payload) -> Vec<AgentOutcome> {
        join_all(
            agents
                .iter()
                .map(|agent| self.run_agent(agent, task, input.clone())),
        )
        .await
    }

    async fn single(&self, task: &Task, agent: &AgentId) -> ProtocolOutput {
        let outcome = self.run_agent(agent, task, task.input.clone()).await;
        match (&outcome.output, &outcome.error) {
            (Some(payload), None) => ProtocolOutput {
                merged: payload.clone(),
                confidence: outcome.confidence.unwrap_or_default(),
                individual: vec![outcome],
                first_round: Vec::new(),
                consensus: None,
                error: None,
            },
            _ => {
                let reason = agent_failure(&outcome);
                ProtocolOutput::failed(vec![outcome], reason)
            }
        }
    }

    /// Each agent receives the previous agent's output. The first failure
    /// aborts the chain.
    async fn sequential(&self, task: &Task, agents: &[AgentId]) -> ProtocolOutput {
        let mut individual = Vec::with_capacity(agents.len());
        let mut input = task.input.clone();

        for agent in agents {
            let outcome = self.run_agent(agent, task, input.clone()).await;
            match &outcome.output {
                Some(payload) => {
                    input = payload.clone();
                    individual.push(outcome);
                }
                None => {
                    let reason = agent_failure(&outcome);
                    individual.push(outcome);
                    return ProtocolOutput::failed(individual, reason);
                }
            }
        }

        ProtocolOutput {
            confidence: mean_confidence(&individual),
            merged: input,
            individual,
            first_round: Vec::new(),
            consensus: None,
            error: None,
        }
    }

    async fn parallel(&self, task: &Task, agents: &[AgentId]) -> ProtocolOutput {
        let individual = self.fan_out(task, agents, &task.input).await;
        let merged = merge_parallel(&individual);
        let error = if individual.iter().any(AgentOutcome::is_success) {
            None
        } else {
            Some("all agents failed".to_string())
        };
        ProtocolOutput {
            confidence: mean_confidence(&individual),
            merged,
            individual,
            first_round: Vec::new(),
            consensus: None,
            error,
        }
    }

    /// Subordinates run in parallel; the authority then decides with their
    /// results in hand. Any failure fails the whole collaboration.
    async fn hierarchical(&self, task: &Task, agents: &[AgentCapability]) -> ProtocolOutput {
        let authority_rule = self.policy.authority;
        let mut ranked: Vec<&AgentCapability> = agents.iter().collect();
        // Ascending by authority key; on equal keys the smallest id sorts last
        // so it becomes the authority.
        ranked.sort_by(|a, b| {
            authority_rule
                .key(a)
                .partial_cmp(&authority_rule.key(b))
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.agent_id.cmp(&a.agent_id))
        });

        let Some((authority, subordinates)) = ranked.split_last() else {
            return ProtocolOutput::failed(Vec::new(), ConcordError::NoAgentsAvailable.to_string());
        };
        let subordinate_ids: Vec<AgentId> =
            subordinates.iter().map(|c| c.agent_id.clone()).collect();

        let mut individual = self.fan_out(task, &subordinate_ids, &task.input).await;
        if let Some(failed) = individual.iter().find(|o| !o.is_success()) {
            let reason = agent_failure(failed);
            return ProtocolOutput::failed(individual, reason);
        }

        let preliminary: serde_json::Map<String, Value> = individual
            .iter()
            .map(|o| (o.agent.to_string(), outcome_summary(o)))
            .collect();
        let mut input = Payload::new();
        input.insert("original_task".into(), Value::Object(task.input.clone()));
        input.insert("preliminary_results".into(), Value::Object(preliminary));

        info!(task_id = %task.id, authority = %authority.agent_id, "Authority deciding");
        let decision = self.run_agent(&authority.agent_id, task, input).await;
        let merged = decision.output.clone();
        let confidence = decision.confidence.unwrap_or_default();
        let reason = agent_failure(&decision);
        individual.push(decision);

        match merged {
            Some(merged) => ProtocolOutput {
                individual,
                first_round: Vec::new(),
                merged,
                consensus: None,
                confidence,
                error: None,
            },
            None => ProtocolOutput::failed(individual, reason),
        }
    }

    /// Two rounds: independent answers, then answers revised after seeing
    /// the peers. Agreement is counted over the second round.
    async fn consensus(&self, task: &Task, agents: &[AgentId]) -> ProtocolOutput {
        let first_round = self.fan_out(task, agents, &task.input).await;
        if !first_round.iter().any(AgentOutcome::is_success) {
            let mut output = ProtocolOutput::failed(Vec::new(), "no agent answered the first round");
            output.first_round = first_round;
            return output;
        }

        let peers: serde_json::Map<String, Value> = first_round
            .iter()
            .filter(|o| o.is_success())
            .map(|o| (o.agent.to_string(), outcome_summary(o)))
            .collect();
        let mut input = Payload::new();
        input.insert("original_task".into(), Value::Object(task.input.clone()));
        input.insert("peer_results".into(), Value::Object(peers));

        let second_round = self.fan_out(task, agents, &input).await;
        let summary = build_consensus(&second_round, self.policy.consensus_threshold);

        let error = (summary.responders == 0).then(|| "no agent answered the second round".to_string());
        let conclusion = match &summary.conclusion {
            Conclusion::Agreed(items) => json!(items),
            Conclusion::NoConsensus(text) => json!(text),
        };
        let mut merged = Payload::new();
        merged.insert("agreed_points".into(), json!(summary.agreed));
        merged.insert("disputed_points".into(), json!(summary.disputed));
        merged.insert("conclusion".into(), conclusion);
        merged.insert("responders".into(), json!(summary.responders));

        ProtocolOutput {
            confidence: mean_confidence(&second_round),
            individual: second_round,
            first_round,
            merged,
            consensus: Some(summary),
            error,
        }
    }
}

/// Combine parallel outcomes into one payload.
///
/// Keys: `recommendations` (deduplicated, first-seen order),
/// `confidence_scores` and `contributions` (per successful agent),
/// `average_confidence`, and `errors` (per failed agent).
pub fn merge_parallel(outcomes: &[AgentOutcome]) -> Payload {
    let mut recommendations: Vec<&str> = Vec::new();
    let mut scores = serde_json::Map::new();
    let mut contributions = serde_json::Map::new();
    let mut errors = serde_json::Map::new();

    for outcome in outcomes {
        if let Some(error) = &outcome.error {
            errors.insert(outcome.agent.to_string(), json!(error));
            continue;
        }
        for item in &outcome.recommendations {
            if !recommendations.contains(&item.as_str()) {
                recommendations.push(item);
            }
        }
        if let Some(confidence) = outcome.confidence {
            scores.insert(outcome.agent.to_string(), json!(confidence));
        }
        if let Some(output) = &outcome.output {
            contributions.insert(outcome.agent.to_string(), Value::Object(output.clone()));
        }
    }

    let mut merged = Payload::new();
    merged.insert("recommendations".into(), json!(recommendations));
    merged.insert("average_confidence".into(), json!(mean_confidence(outcomes)));
    merged.insert("confidence_scores".into(), Value::Object(scores));
    merged.insert("contributions".into(), Value::Object(contributions));
    merged.insert("errors".into(), Value::Object(errors));
    merged
}

/// Count recommendation items over the successful outcomes.
///
/// An item counts at most once per agent. It is agreed when
/// `count / responders >= threshold`; agreed and disputed lists keep the
/// order in which items were first seen.
pub fn build_consensus(outcomes: &[AgentOutcome], threshold: f64) -> ConsensusSummary {
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut responders = 0usize;

    for outcome in outcomes.iter().filter(|o| o.is_success()) {
        responders += 1;
        let mut seen: Vec<&str> = Vec::new();
        for item in &outcome.recommendations {
            let item = item.as_str();
            if seen.contains(&item) {
                continue;
            }
            seen.push(item);
            let count = counts.entry(item).or_insert(0);
            if *count == 0 {
                order.push(item);
            }
            *count += 1;
        }
    }

    let (agreed, disputed): (Vec<&str>, Vec<&str>) = order.into_iter().partition(|item| {
        let count = counts.get(item).copied().unwrap_or_default();
        responders > 0 && count as f64 / responders as f64 >= threshold
    });
    let agreed: Vec<String> = agreed.into_iter().map(str::to_owned).collect();
    let disputed: Vec<String> = disputed.into_iter().map(str::to_owned).collect();

    let conclusion = if agreed.is_empty() {
        Conclusion::NoConsensus(NO_CONSENSUS.to_string())
    } else {
        Conclusion::Agreed(agreed.clone())
    };

    ConsensusSummary {
        agreed,
        disputed,
        conclusion,
        responders,
    }
}

fn outcome_summary(outcome: &AgentOutcome) -> Value {
    json!({
        "output": outcome.output,
        "confidence": outcome.confidence,
        "recommendations": outcome.recommendations,
    })
}

fn agent_failure(outcome: &AgentOutcome) -> String {
    format!(
        "agent {} failed: {}",
        outcome.agent,
        outcome.error.as_deref().unwrap_or("no output")
    )
}

/// Mean confidence of the successful outcomes, 0 when there are none.
fn mean_confidence(outcomes: &[AgentOutcome]) -> f64 {
    let scores: Vec<f64> = outcomes.iter().filter_map(|o| o.confidence).collect();
    if scores.is_empty() {
        0.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
