//! Simulated agents for the demo command.
//!
//! Each call sleeps for the agent's mean response time (scaled down) and
//! answers with canned, task-type specific recommendations. Whether a call
//! fails is derived from a hash of task and agent, so a run is repeatable.

use async_trait::async_trait;
use concord_core::{AgentId, ConcordError, ConcordResult, Payload};
use concord_orchestrator::{AgentCapability, Task, TaskType, WorkerAdapter, WorkerOutput};
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::debug;

pub struct SimulatedWorker {
    profiles: BTreeMap<AgentId, AgentCapability>,
    /// Multiplier applied to each agent's response time.
    time_scale: f64,
    /// Fail according to each agent's success rate.
    inject_failures: bool,
}

impl SimulatedWorker {
    pub fn new(agents: impl IntoIterator<Item = AgentCapability>, time_scale: f64) -> Self {
        Self {
            profiles: agents
                .into_iter()
                .map(|cap| (cap.agent_id.clone(), cap))
                .collect(),
            time_scale: time_scale.max(0.0),
            inject_failures: true,
        }
    }

    pub fn without_failures(mut self) -> Self {
        self.inject_failures = false;
        self
    }

    fn latency(&self, profile: &AgentCapability) -> Duration {
        let secs = profile.response_time_secs * self.time_scale;
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }

    /// Deterministic stand-in for a coin weighted by the success rate.
    fn should_fail(&self, profile: &AgentCapability, task: &Task, revising: bool) -> bool {
        if !self.inject_failures {
            return false;
        }
        let mut hasher = DefaultHasher::new();
        task.id.hash(&mut hasher);
        profile.agent_id.hash(&mut hasher);
        revising.hash(&mut hasher);
        let roll = (hasher.finish() % 1000) as f64 / 1000.0;
        roll >= profile.success_rate
    }
}

#[async_trait]
impl WorkerAdapter for SimulatedWorker {
    async fn execute(&self, agent: &AgentId, task: &Task, input: Payload) -> ConcordResult<WorkerOutput> {
        let profile = self
            .profiles
            .get(agent)
            .ok_or_else(|| ConcordError::UnknownAgent(agent.clone()))?;

        tokio::time::sleep(self.latency(profile)).await;

        let revising = input.contains_key("peer_results");
        let deciding = input.contains_key("preliminary_results");
        if self.should_fail(profile, task, revising) {
            return Err(ConcordError::worker(agent.clone(), "simulated agent error"));
        }

        let recommendations = canned_recommendations(task.task_type);
        let focus = profile.specialties.first().map_or("general", String::as_str);
        let summary = if deciding {
            format!("{agent} reviewed the team's findings on \"{}\"", task.title)
        } else if revising {
            format!("{agent} revised its view on \"{}\" after peer review", task.title)
        } else {
            format!("{agent} assessed \"{}\" with a focus on {focus}", task.title)
        };

        // Reviewing peers nudges confidence up a little.
        let confidence = if revising || deciding {
            (profile.expertise + 0.05).min(1.0)
        } else {
            profile.expertise
        };

        debug!(agent = %agent, task_id = %task.id, confidence, "Simulated answer");

        let mut payload = Payload::new();
        payload.insert("agent".into(), json!(agent.as_str()));
        payload.insert("task_type".into(), json!(task.task_type.as_str()));
        payload.insert("summary".into(), json!(summary));
        payload.insert("specialties".into(), json!(profile.specialties));
        Ok(WorkerOutput::new(payload, confidence).with_recommendations(recommendations.iter().copied()))
    }
}

fn canned_recommendations(task_type: TaskType) -> &'static [&'static str] {
    match task_type {
        TaskType::HealthConsultation => &["schedule a routine check-up", "keep a symptom diary"],
        TaskType::SymptomAnalysis => &[
            "monitor symptoms for 48 hours",
            "keep a symptom diary",
            "seek care if fever exceeds 39C",
        ],
        TaskType::DiagnosisSupport => &[
            "order a complete blood count",
            "refer to a specialist",
            "rule out infection",
        ],
        TaskType::TreatmentPlanning => &[
            "start with conservative treatment",
            "review medication interactions",
            "follow up in two weeks",
        ],
        TaskType::PreventionGuidance => &["keep vaccinations current", "annual screening"],
        TaskType::LifestyleAdvice => &[
            "150 minutes of moderate exercise weekly",
            "reduce sodium intake",
            "seven to nine hours of sleep",
        ],
        TaskType::EmergencyResponse => &["call emergency services", "do not drive yourself"],
        TaskType::KnowledgeQuery => &["consult the patient leaflet"],
        TaskType::DataAnalysis => &["trend is within normal range", "repeat measurement in a month"],
        TaskType::Education => &["read the condition overview", "join a support group"],
    }
}
