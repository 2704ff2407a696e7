use chrono::{DateTime, Utc};
use concord_core::{AgentId, ConcordError, ConcordResult, Payload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Domain category of a task. Agents declare which categories they serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// General health questions.
    HealthConsultation,
    /// Interpreting reported symptoms.
    SymptomAnalysis,
    /// Supporting a clinician's diagnosis.
    DiagnosisSupport,
    /// Drafting a treatment plan.
    TreatmentPlanning,
    /// Preventive care guidance.
    PreventionGuidance,
    /// Diet, exercise and habit advice.
    LifestyleAdvice,
    /// Time-critical triage.
    EmergencyResponse,
    /// Medical knowledge lookup.
    KnowledgeQuery,
    /// Analysis of clinical or lab data.
    DataAnalysis,
    /// Patient education material.
    Education,
}

impl TaskType {
    /// Every task type, in declaration order.
    pub const ALL: [TaskType; 10] = [
        TaskType::HealthConsultation,
        TaskType::SymptomAnalysis,
        TaskType::DiagnosisSupport,
        TaskType::TreatmentPlanning,
        TaskType::PreventionGuidance,
        TaskType::LifestyleAdvice,
        TaskType::EmergencyResponse,
        TaskType::KnowledgeQuery,
        TaskType::DataAnalysis,
        TaskType::Education,
    ];

    /// Snake-case name used on the wire and in config.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::HealthConsultation => "health_consultation",
            TaskType::SymptomAnalysis => "symptom_analysis",
            TaskType::DiagnosisSupport => "diagnosis_support",
            TaskType::TreatmentPlanning => "treatment_planning",
            TaskType::PreventionGuidance => "prevention_guidance",
            TaskType::LifestyleAdvice => "lifestyle_advice",
            TaskType::EmergencyResponse => "emergency_response",
            TaskType::KnowledgeQuery => "knowledge_query",
            TaskType::DataAnalysis => "data_analysis",
            TaskType::Education => "education",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level. Declaration order is the scheduling order (Low drains last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// The default.
    Medium,
    /// Ahead of routine work.
    High,
    /// Needs attention soon.
    Urgent,
    /// Always dispatched first.
    Emergency,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

impl TaskPriority {
    /// All levels from lowest to highest.
    pub const ALL: [TaskPriority; 5] = [
        TaskPriority::Low,
        TaskPriority::Medium,
        TaskPriority::High,
        TaskPriority::Urgent,
        TaskPriority::Emergency,
    ];

    /// Numeric level, 1 (Low) through 5 (Emergency).
    pub fn level(self) -> u8 {
        match self {
            TaskPriority::Low => 1,
            TaskPriority::Medium => 2,
            TaskPriority::High => 3,
            TaskPriority::Urgent => 4,
            TaskPriority::Emergency => 5,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
            TaskPriority::Emergency => "emergency",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a task.
///
/// ```text
/// Pending -> Assigned -> InProgress -> Completed | Failed | Cancelled
///                        InProgress -> Escalated -> Completed | Failed | Cancelled
/// Pending  -> Cancelled | Failed
/// Assigned -> Cancelled | Failed
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, not yet picked up.
    Pending,
    /// Agents reserved, not yet running.
    Assigned,
    /// A collaboration is running.
    InProgress,
    /// A supervising agent took the task over; counts as in progress for load.
    Escalated,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully, with the reason.
    Failed { reason: String },
    /// Cancelled by a caller.
    Cancelled,
}

impl TaskStatus {
    /// Failed status with `reason`.
    pub fn failed(reason: impl Into<String>) -> Self {
        TaskStatus::Failed {
            reason: reason.into(),
        }
    }

    /// Completed, failed or cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled
        )
    }

    /// Whether the lifecycle graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned | Cancelled | Failed { .. }) => true,
            (Assigned, InProgress | Cancelled | Failed { .. }) => true,
            (InProgress, Escalated | Completed | Failed { .. } | Cancelled) => true,
            (Escalated, Completed | Failed { .. } | Cancelled) => true,
            _ => false,
        }
    }

    /// Snake-case name, without the failure reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Escalated => "escalated",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed { .. } => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Protocol governing how several agents jointly process one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaborationMode {
    /// Agents run one after another, each seeing the previous output.
    #[default]
    Sequential,
    /// Agents run concurrently and their outputs are merged.
    Parallel,
    /// Agents run concurrently and one authority decides.
    Hierarchical,
    /// Two rounds, then items above the threshold are agreed.
    Consensus,
}

impl fmt::Display for CollaborationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollaborationMode::Sequential => "sequential",
            CollaborationMode::Parallel => "parallel",
            CollaborationMode::Hierarchical => "hierarchical",
            CollaborationMode::Consensus => "consensus",
        };
        f.write_str(name)
    }
}

/// Flat key-value form of a task, as mirrored into the persistence adapter.
pub type TaskRecord = BTreeMap<String, String>;

/// A unit of work submitted for agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Assigned on submission.
    pub id: Uuid,
    /// Kind of work, used for agent selection.
    pub task_type: TaskType,
    /// Dispatch priority.
    pub priority: TaskPriority,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Short human-readable title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Who submitted the task.
    pub submitter_id: String,
    /// Input handed to every worker call.
    pub input: Payload,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Agents reserved for the task, in execution order.
    #[serde(default)]
    pub assigned_agents: Vec<AgentId>,
    /// Collaboration protocol to run.
    #[serde(default)]
    pub mode: CollaborationMode,
    /// Queued or running past this instant fails the task.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Slowest assigned agent's response time.
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
    /// Wall time from start to terminal state.
    #[serde(default)]
    pub actual_duration_ms: Option<u64>,
    /// When the task was assigned.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Collaboration output or error details.
    #[serde(default)]
    pub results: Payload,
    /// Caller-supplied extras, stored untouched.
    #[serde(default)]
    pub metadata: Payload,
}

impl Task {
    /// Pending task with a fresh id and default priority and mode.
    pub fn new(
        task_type: TaskType,
        title: impl Into<String>,
        description: impl Into<String>,
        submitter_id: impl Into<String>,
        input: Payload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type,
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            title: title.into(),
            description: description.into(),
            submitter_id: submitter_id.into(),
            input,
            created_at: Utc::now(),
            assigned_agents: Vec::new(),
            mode: CollaborationMode::default(),
            deadline: None,
            estimated_duration_ms: None,
            actual_duration_ms: None,
            started_at: None,
            completed_at: None,
            results: Payload::new(),
            metadata: Payload::new(),
        }
    }

    /// Move to `next`, rejecting any edge the lifecycle graph does not have.
    ///
    /// Terminal tasks are immutable, so every transition out of them fails.
    pub fn transition(&mut self, next: TaskStatus) -> ConcordResult<()> {
        if !self.status.can_transition_to(&next) {
            return Err(ConcordError::InvalidTransition(format!(
                "task {}: {} -> {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            )));
        }
        self.status = next;
        Ok(())
    }

    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when a deadline is set and lies strictly before `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|deadline| deadline < now)
    }

    /// Reason when the task failed.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            TaskStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Flatten into the string map stored by a [`crate::store::TaskStore`].
    pub fn to_record(&self) -> TaskRecord {
        fn json<T: Serialize>(value: &T) -> String {
            serde_json::to_string(value).unwrap_or_default()
        }
        fn time(value: Option<DateTime<Utc>>) -> String {
            value.map(|t| t.to_rfc3339()).unwrap_or_default()
        }

        let mut record = TaskRecord::new();
        record.insert("id".into(), self.id.to_string());
        record.insert("type".into(), self.task_type.as_str().into());
        record.insert("priority".into(), self.priority.level().to_string());
        record.insert("status".into(), self.status.as_str().into());
        if let Some(reason) = self.failure_reason() {
            record.insert("failure_reason".into(), reason.to_string());
        }
        record.insert("title".into(), self.title.clone());
        record.insert("description".into(), self.description.clone());
        record.insert("submitter_id".into(), self.submitter_id.clone());
        record.insert("input_data".into(), json(&self.input));
        record.insert("created_at".into(), self.created_at.to_rfc3339());
        record.insert("assigned_agents".into(), json(&self.assigned_agents));
        record.insert("collaboration_mode".into(), self.mode.to_string());
        record.insert("deadline".into(), time(self.deadline));
        record.insert("started_at".into(), time(self.started_at));
        record.insert("completed_at".into(), time(self.completed_at));
        if let Some(ms) = self.actual_duration_ms {
            record.insert("actual_duration_ms".into(), ms.to_string());
        }
        record.insert("results".into(), json(&self.results));
        record.insert("metadata".into(), json(&self.metadata));
        record
    }
}

/// Everything a caller provides when submitting a task.
///
/// Defaults: priority Medium, no deadline, Sequential mode, empty metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Kind of work.
    pub task_type: TaskType,
    /// Short human-readable title.
    pub title: String,
    /// Free-form description.
    pub description: String,
    /// Who is submitting.
    pub submitter_id: String,
    /// Input handed to every worker call.
    pub input: Payload,
    /// Dispatch priority.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Optional deadline.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    /// Collaboration protocol to run.
    #[serde(default)]
    pub mode: CollaborationMode,
    /// Caller-supplied extras.
    #[serde(default)]
    pub metadata: Payload,
}

impl TaskSubmission {
    /// Submission with default priority, mode and metadata.
    pub fn new(
        task_type: TaskType,
        title: impl Into<String>,
        description: impl Into<String>,
        submitter_id: impl Into<String>,
        input: Payload,
    ) -> Self {
        Self {
            task_type,
            title: title.into(),
            description: description.into(),
            submitter_id: submitter_id.into(),
            input,
            priority: TaskPriority::default(),
            deadline: None,
            mode: CollaborationMode::default(),
            metadata: Payload::new(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the deadline.
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the collaboration mode.
    pub fn with_mode(mut self, mode: CollaborationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the metadata.
    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build the pending task.
    pub fn into_task(self) -> Task {
        let mut task = Task::new(
            self.task_type,
            self.title,
            self.description,
            self.submitter_id,
            self.input,
        );
        task.priority = self.priority;
        task.deadline = self.deadline;
        task.mode = self.mode;
        task.metadata = self.metadata;
        task
    }
}

/// Point-in-time view of a task returned by `get_task_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task id.
    pub id: Uuid,
    /// Kind of work.
    pub task_type: TaskType,
    /// Dispatch priority.
    pub priority: TaskPriority,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Short human-readable title.
    pub title: String,
    /// Collaboration protocol.
    pub mode: CollaborationMode,
    /// Agents reserved for the task.
    pub assigned_agents: Vec<AgentId>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Optional deadline.
    pub deadline: Option<DateTime<Utc>>,
    /// When the task was assigned.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall time from start to terminal state.
    pub actual_duration_ms: Option<u64>,
    /// Only set while the task is active.
    pub estimated_completion: Option<DateTime<Utc>>,
    /// Collaboration output or error details.
    pub results: Payload,
}

impl TaskSnapshot {
    /// Snapshot of `task` with an optional completion estimate.
    pub fn of(task: &Task, estimated_completion: Option<DateTime<Utc>>) -> Self {
        Self {
            id: task.id,
            task_type: task.task_type,
            priority: task.priority,
            status: task.status.clone(),
            title: task.title.clone(),
            mode: task.mode,
            assigned_agents: task.assigned_agents.clone(),
            created_at: task.created_at,
            deadline: task.deadline,
            started_at: task.started_at,
            completed_at: task.completed_at,
            actual_duration_ms: task.actual_duration_ms,
            estimated_completion,
            results: task.results.clone(),
        }
    }
}

/// What the registry knows about one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapability {
    /// Unique agent id.
    pub agent_id: AgentId,
    /// Task types the agent serves.
    pub task_types: BTreeSet<TaskType>,
    /// Expertise score in `[0, 1]`.
    pub expertise: f64,
    /// Tasks currently reserved on the agent.
    #[serde(default)]
    pub current_load: u32,
    /// Concurrent task limit.
    pub max_load: u32,
    /// Derived from load; see [`AgentCapability::recompute_availability`].
    #[serde(default = "default_available")]
    pub available: bool,
    /// Mean response time in seconds.
    pub response_time_secs: f64,
    /// Historical success rate in `[0, 1]`.
    pub success_rate: f64,
    /// Free-form specialty tags.
    #[serde(default)]
    pub specialties: Vec<String>,
}

fn default_available() -> bool {
    true
}

impl AgentCapability {
    /// Upper bound on `response_time_secs`: one day.
    pub const MAX_RESPONSE_TIME_SECS: f64 = 86_400.0;

    /// Reject a response time that is negative, not finite or over a day.
    pub fn check_response_time(secs: f64) -> ConcordResult<()> {
        if secs.is_finite() && (0.0..=Self::MAX_RESPONSE_TIME_SECS).contains(&secs) {
            Ok(())
        } else {
            Err(ConcordError::Config(format!(
                "response_time_secs must be within [0, {}], got {secs}",
                Self::MAX_RESPONSE_TIME_SECS
            )))
        }
    }

    /// Idle agent serving `task_types`, with no specialties.
    pub fn new(
        agent_id: impl Into<AgentId>,
        task_types: impl IntoIterator<Item = TaskType>,
        expertise: f64,
        max_load: u32,
        response_time_secs: f64,
        success_rate: f64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_types: task_types.into_iter().collect(),
            expertise,
            current_load: 0,
            max_load,
            available: max_load > 0,
            response_time_secs,
            success_rate,
            specialties: Vec::new(),
        }
    }

    /// Replace the specialty tags.
    pub fn with_specialties(mut self, specialties: &[&str]) -> Self {
        self.specialties = specialties.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the current load, capped at `max_load`.
    pub fn with_load(mut self, current_load: u32) -> Self {
        self.current_load = current_load.min(self.max_load);
        self.recompute_availability();
        self
    }

    /// `current_load / max_load`, or 1 when `max_load` is zero.
    pub fn load_ratio(&self) -> f64 {
        if self.max_load == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.max_load)
    }

    /// Available with a free slot.
    pub fn has_capacity(&self) -> bool {
        self.available && self.current_load < self.max_load
    }

    /// Whether `task_type` is among the served types.
    pub fn serves(&self, task_type: TaskType) -> bool {
        self.task_types.contains(&task_type)
    }

    /// Serves the task type, is available and has a free slot.
    pub fn is_eligible(&self, task_type: TaskType) -> bool {
        self.serves(task_type) && self.has_capacity()
    }

    /// Derive `available` from load.
    pub fn recompute_availability(&mut self) {
        self.available = self.current_load < self.max_load;
    }
}

/// Partial update for `update_agent_capability`. `None` fields are untouched.
///
/// Load and availability are deliberately absent: they only move through
/// assignment and release.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityUpdate {
    /// New expertise score.
    #[serde(default)]
    pub expertise: Option<f64>,
    /// New concurrent task limit.
    #[serde(default)]
    pub max_load: Option<u32>,
    /// New mean response time.
    #[serde(default)]
    pub response_time_secs: Option<f64>,
    /// New success rate.
    #[serde(default)]
    pub success_rate: Option<f64>,
    /// New specialty tags.
    #[serde(default)]
    pub specialties: Option<Vec<String>>,
    /// New set of served task types.
    #[serde(default)]
    pub task_types: Option<BTreeSet<TaskType>>,
}

/// Capability plus derived load ratio, as reported by `get_agent_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Registry entry.
    #[serde(flatten)]
    pub capability: AgentCapability,
    /// Current load over capacity.
    pub load_ratio: f64,
}

impl From<AgentCapability> for AgentStatus {
    fn from(capability: AgentCapability) -> Self {
        let load_ratio = capability.load_ratio();
        Self {
            capability,
            load_ratio,
        }
    }
}

/// One agent's contribution to a collaboration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    /// Agent that ran.
    pub agent: AgentId,
    /// Worker payload on success.
    pub output: Option<Payload>,
    /// Self-reported confidence on success.
    pub confidence: Option<f64>,
    /// Recommendation items on success.
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Error text on failure.
    pub error: Option<String>,
    /// Time spent in the worker call.
    pub elapsed_ms: u64,
}

impl AgentOutcome {
    /// No error was recorded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Final verdict of a consensus round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    /// Items that reached the agreement threshold, in first-seen order.
    Agreed(Vec<String>),
    /// No item reached the threshold.
    NoConsensus(String),
}

/// Agreement breakdown of a consensus collaboration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSummary {
    /// Items at or above the threshold.
    pub agreed: Vec<String>,
    /// Items named by some responders but below the threshold.
    pub disputed: Vec<String>,
    /// Final verdict.
    pub conclusion: Conclusion,
    /// Number of agents that answered the final round.
    pub responders: usize,
}

/// Outcome of running one collaboration protocol for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationResult {
    /// Task the collaboration ran for.
    pub task_id: Uuid,
    /// Agents that took part, in execution order.
    pub participants: Vec<AgentId>,
    /// Protocol that ran.
    pub mode: CollaborationMode,
    /// One entry per agent that ran, in execution order. For consensus this
    /// is the second round.
    pub individual_results: Vec<AgentOutcome>,
    /// Consensus round one; empty for the other protocols.
    #[serde(default)]
    pub first_round: Vec<AgentOutcome>,
    /// Protocol-specific merged output.
    pub merged_result: Payload,
    /// Set for consensus collaborations.
    #[serde(default)]
    pub consensus: Option<ConsensusSummary>,
    /// Confidence of the merged result.
    pub confidence: f64,
    /// Wall time of the whole protocol.
    pub duration_ms: u64,
    /// Whether the protocol produced a usable result.
    pub success: bool,
    /// Failure reason when unsuccessful.
    pub error: Option<String>,
    /// When the protocol finished.
    pub completed_at: DateTime<Utc>,
}

impl CollaborationResult {
    /// Result payload stored on the task when it reaches a terminal state.
    pub fn to_task_results(&self) -> Payload {
        let mut results = Payload::new();
        results.insert("success".into(), self.success.into());
        results.insert("collaboration_mode".into(), self.mode.to_string().into());
        results.insert(
            "agents".into(),
            serde_json::to_value(&self.participants).unwrap_or_default(),
        );
        results.insert(
            "final_result".into(),
            serde_json::Value::Object(self.merged_result.clone()),
        );
        results.insert("confidence_score".into(), self.confidence.into());
        results.insert(
            "individual_results".into(),
            serde_json::to_value(&self.individual_results).unwrap_or_default(),
        );
        if let Some(error) = &self.error {
            results.insert("error".into(), error.clone().into());
        }
        results
    }
}
