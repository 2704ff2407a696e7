//! End-to-end orchestration tests.
//!
//! Drives the public `Orchestrator` facade with a scripted worker adapter:
//! assignment under load limits, the four collaboration protocols,
//! deadlines, cancellation, events, persistence and concurrent load safety.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::Utc;
use concord_core::{payload_from, AgentId, ConcordError, ConcordResult, Payload};
use concord_orchestrator::*;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Scripted worker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedWorker {
    failing: HashSet<String>,
    confidence: HashMap<String, f64>,
    /// Confidence used for consensus second-round answers.
    revised_confidence: HashMap<String, f64>,
    recommendations: Vec<String>,
    delay: Duration,
    /// When set, each call waits for one permit before returning.
    gate: Option<Arc<Semaphore>>,
    entered: Arc<Notify>,
    calls: Mutex<Vec<(String, Uuid)>>,
}

impl ScriptedWorker {
    fn new() -> Self {
        Self::default()
    }

    fn failing(mut self, agent: &str) -> Self {
        self.failing.insert(agent.to_string());
        self
    }

    fn confidence(mut self, agent: &str, value: f64) -> Self {
        self.confidence.insert(agent.to_string(), value);
        self
    }

    fn revised(mut self, agent: &str, value: f64) -> Self {
        self.revised_confidence.insert(agent.to_string(), value);
        self
    }

    fn recommending(mut self, items: &[&str]) -> Self {
        self.recommendations = items.iter().map(|s| s.to_string()).collect();
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn call_order(&self) -> Vec<Uuid> {
        self.calls.lock().iter().map(|(_, task)| *task).collect()
    }
}

#[async_trait]
impl WorkerAdapter for ScriptedWorker {
    async fn execute(&self, agent: &AgentId, task: &Task, input: Payload) -> ConcordResult<WorkerOutput> {
        self.calls.lock().push((agent.to_string(), task.id));
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(agent.as_str()) {
            return Err(ConcordError::worker(agent.clone(), "scripted failure"));
        }

        let second_round = input.contains_key("peer_results");
        let confidence = if second_round {
            self.revised_confidence.get(agent.as_str()).copied()
        } else {
            None
        }
        .or_else(|| self.confidence.get(agent.as_str()).copied())
        .unwrap_or(0.9);

        let mut payload = Payload::new();
        payload.insert("agent".into(), json!(agent.as_str()));
        payload.insert("second_round".into(), json!(second_round));
        Ok(WorkerOutput::new(payload, confidence).with_recommendations(self.recommendations.clone()))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn agent(id: &str, task_types: &[TaskType], max_load: u32) -> AgentCapability {
    AgentCapability::new(id, task_types.iter().copied(), 0.8, max_load, 1.0, 0.9)
}

fn config(agents: Vec<AgentCapability>, strategy: AssignmentStrategy) -> OrchestratorConfig {
    OrchestratorConfig {
        assignment_strategy: strategy,
        agents,
        collaboration_patterns: Vec::new(),
        event_buffer: 4096,
        ..Default::default()
    }
}

fn submission(task_type: TaskType) -> TaskSubmission {
    TaskSubmission::new(
        task_type,
        "Review lab results",
        "Blood panel from last week",
        "user-1",
        payload_from(json!({"panel": "cbc"})),
    )
}

fn load_of(orch: &Orchestrator, id: &str) -> u32 {
    orch.get_agent_status()[&AgentId::from(id)].capability.current_load
}

/// Wait until the worker has been entered `n` times.
async fn wait_for_calls(worker: &ScriptedWorker, n: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while worker.calls.lock().len() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("worker never reached");
}

async fn next_kind(rx: &mut tokio::sync::broadcast::Receiver<TaskEvent>) -> EventKind {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event timed out")
        .expect("event channel closed")
        .kind
}

// ---------------------------------------------------------------------------
// Scenario A: one agent with max_load 1
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_single_agent_assigned_then_completed() {
    let gate = Arc::new(Semaphore::new(0));
    let worker = Arc::new(ScriptedWorker::new().gated(gate.clone()));
    let orch = Orchestrator::new(
        config(
            vec![agent("solo", &[TaskType::DiagnosisSupport], 1)],
            AssignmentStrategy::CapabilityBased,
        ),
        worker.clone(),
    )
    .unwrap();
    let mut rx = orch.subscribe();

    let id = orch
        .submit_task(submission(TaskType::DiagnosisSupport).with_priority(TaskPriority::High))
        .await
        .unwrap();
    assert_eq!(next_kind(&mut rx).await, EventKind::TaskSubmitted);
    assert_eq!(orch.get_task_status(id).await.unwrap().status, TaskStatus::Pending);

    let runner = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.dispatch_next().await })
    };
    worker.entered.notified().await;

    assert_eq!(next_kind(&mut rx).await, EventKind::TaskAssigned);
    let running = orch.get_task_status(id).await.unwrap();
    assert_eq!(running.status, TaskStatus::InProgress);
    assert_eq!(running.assigned_agents, vec![AgentId::from("solo")]);
    assert!(running.estimated_completion.is_some());
    assert_eq!(load_of(&orch, "solo"), 1);
    assert!(!orch.get_agent_status()[&AgentId::from("solo")].capability.available);

    gate.add_permits(1);
    assert_eq!(runner.await.unwrap(), Some(id));

    assert_eq!(next_kind(&mut rx).await, EventKind::TaskCompleted);
    let done = orch.get_task_status(id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.results["success"], true);
    assert_eq!(done.results["final_result"]["agent"], "solo");
    assert!(done.actual_duration_ms.is_some());
    assert_eq!(load_of(&orch, "solo"), 0);
    assert!(orch.is_idle().await);
}

// ---------------------------------------------------------------------------
// Scenario B: every eligible agent saturated
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_saturated_agents_fail_task_immediately() {
    let gate = Arc::new(Semaphore::new(0));
    let worker = Arc::new(ScriptedWorker::new().gated(gate.clone()));
    let orch = Orchestrator::new(
        config(
            vec![agent("busy", &[TaskType::SymptomAnalysis], 2)],
            AssignmentStrategy::LoadBalanced,
        ),
        worker.clone(),
    )
    .unwrap();

    // Fill both slots with gated tasks.
    let mut runners = Vec::new();
    for _ in 0..2 {
        orch.submit_task(submission(TaskType::SymptomAnalysis)).await.unwrap();
        let orch = orch.clone();
        runners.push(tokio::spawn(async move { orch.dispatch_next().await }));
    }
    wait_for_calls(&worker, 2).await;
    assert_eq!(load_of(&orch, "busy"), 2);

    let id = orch.submit_task(submission(TaskType::SymptomAnalysis)).await.unwrap();
    assert_eq!(orch.queue_len().await, 1);
    assert_eq!(orch.dispatch_next().await, Some(id));

    let status = orch.get_task_status(id).await.unwrap();
    assert_eq!(status.status, TaskStatus::failed(NO_AGENTS_AVAILABLE));
    assert_eq!(status.results["error"], NO_AGENTS_AVAILABLE);
    assert!(status.assigned_agents.is_empty());
    assert_eq!(orch.queue_len().await, 0);
    assert_eq!(load_of(&orch, "busy"), 2);
    assert_eq!(worker.calls.lock().len(), 2);

    let stats = orch.get_statistics().await;
    assert_eq!(stats.failed_tasks, 1);
    assert_eq!(stats.timed_out_tasks, 0);

    gate.add_permits(2);
    for runner in runners {
        runner.await.unwrap();
    }
    assert_eq!(load_of(&orch, "busy"), 0);
    assert_eq!(orch.get_statistics().await.completed_tasks, 2);
}

#[tokio::test]
async fn test_configured_agents_cannot_preset_load() {
    let result = Orchestrator::new(
        config(
            vec![agent("busy", &[TaskType::SymptomAnalysis], 2).with_load(2)],
            AssignmentStrategy::LoadBalanced,
        ),
        Arc::new(ScriptedWorker::new()),
    );
    assert!(matches!(result, Err(ConcordError::Config(_))));
}

#[tokio::test]
async fn test_task_type_without_agents_fails() {
    let orch = Orchestrator::new(
        config(
            vec![agent("coach", &[TaskType::LifestyleAdvice], 3)],
            AssignmentStrategy::CapabilityBased,
        ),
        Arc::new(ScriptedWorker::new()),
    )
    .unwrap();
    let id = orch.submit_task(submission(TaskType::EmergencyResponse)).await.unwrap();
    orch.dispatch_next().await;
    assert_eq!(
        orch.get_task_status(id).await.unwrap().status,
        TaskStatus::failed(NO_AGENTS_AVAILABLE)
    );
}

// ---------------------------------------------------------------------------
// Scenario C: deadline already passed
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_monitor_fails_expired_queued_task() {
    let orch = Orchestrator::new(
        config(
            vec![agent("analyst", &[TaskType::DataAnalysis], 4)],
            AssignmentStrategy::CapabilityBased,
        ),
        Arc::new(ScriptedWorker::new()),
    )
    .unwrap();
    let mut rx = orch.subscribe();
    let before = load_of(&orch, "analyst");

    let id = orch
        .submit_task(
            submission(TaskType::DataAnalysis).with_deadline(Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();
    assert_eq!(next_kind(&mut rx).await, EventKind::TaskSubmitted);

    let report = orch.run_monitor_pass().await;
    assert_eq!(report.timed_out_queued, vec![id]);
    assert_eq!(next_kind(&mut rx).await, EventKind::TaskTimeout);

    let status = orch.get_task_status(id).await.unwrap();
    assert_eq!(status.status, TaskStatus::failed(DEADLINE_EXCEEDED));
    assert_eq!(load_of(&orch, "analyst"), before);
    assert_eq!(orch.dispatch_next().await, None);
    assert_eq!(orch.get_statistics().await.timed_out_tasks, 1);
}

#[tokio::test]
async fn test_dispatcher_fails_expired_task_at_pop() {
    let worker = Arc::new(ScriptedWorker::new());
    let orch = Orchestrator::new(
        config(
            vec![agent("analyst", &[TaskType::DataAnalysis], 4)],
            AssignmentStrategy::CapabilityBased,
        ),
        worker.clone(),
    )
    .unwrap();
    let id = orch
        .submit_task(
            submission(TaskType::DataAnalysis).with_deadline(Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();

    assert_eq!(orch.dispatch_next().await, Some(id));
    assert_eq!(
        orch.get_task_status(id).await.unwrap().status,
        TaskStatus::failed(DEADLINE_EXCEEDED)
    );
    assert!(worker.calls.lock().is_empty());
    assert_eq!(load_of(&orch, "analyst"), 0);
}

#[tokio::test]
async fn test_monitor_times_out_running_task_and_discards_result() {
    let gate = Arc::new(Semaphore::new(0));
    let worker = Arc::new(ScriptedWorker::new().gated(gate.clone()));
    let mut cfg = config(
        vec![
            agent("analyst", &[TaskType::DataAnalysis], 4),
            agent("reviewer", &[TaskType::DataAnalysis], 4),
        ],
        AssignmentStrategy::Collaborative,
    );
    cfg.collaboration_patterns = vec![CollaborationPattern {
        task_type: TaskType::DataAnalysis,
        agents: vec!["analyst".into(), "reviewer".into()],
    }];
    let orch = Orchestrator::new(cfg, worker.clone()).unwrap();
    let id = orch
        .submit_task(
            submission(TaskType::DataAnalysis)
                .with_mode(CollaborationMode::Parallel)
                .with_deadline(Utc::now() + chrono::Duration::milliseconds(50)),
        )
        .await
        .unwrap();

    let runner = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.dispatch_next().await })
    };
    wait_for_calls(&worker, 2).await;
    assert_eq!(load_of(&orch, "analyst"), 1);
    assert_eq!(load_of(&orch, "reviewer"), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let report = orch.run_monitor_pass().await;
    assert_eq!(report.timed_out_active, vec![id]);
    assert_eq!(load_of(&orch, "analyst"), 0);
    assert_eq!(load_of(&orch, "reviewer"), 0);

    gate.add_permits(2);
    runner.await.unwrap();

    let status = orch.get_task_status(id).await.unwrap();
    assert_eq!(status.status, TaskStatus::failed(DEADLINE_EXCEEDED));
    assert!(status.results.get("final_result").is_none());
    assert_eq!(load_of(&orch, "analyst"), 0);
    assert_eq!(load_of(&orch, "reviewer"), 0);

    assert!(orch.collaboration_history().is_empty());
    let stats = orch.get_statistics().await;
    assert_eq!(stats.completed_tasks, 0);
    assert_eq!(stats.failed_tasks, 1);
    assert_eq!(stats.collaboration_history_size, 0);
    assert_eq!(stats.collaboration_success_rate, 0.0);
}

// ---------------------------------------------------------------------------
// Scenario D: parallel collaboration with one failing agent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_parallel_captures_single_agent_failure() {
    let worker = Arc::new(
        ScriptedWorker::new()
            .failing("a3")
            .confidence("a1", 0.6)
            .confidence("a2", 0.8)
            .recommending(&["rest", "fluids"]),
    );
    let mut cfg = config(
        vec![
            agent("a1", &[TaskType::DataAnalysis], 2),
            agent("a2", &[TaskType::DataAnalysis], 2),
            agent("a3", &[TaskType::DataAnalysis], 2),
        ],
        AssignmentStrategy::Collaborative,
    );
    cfg.collaboration_patterns = vec![CollaborationPattern {
        task_type: TaskType::DataAnalysis,
        agents: vec!["a1".into(), "a2".into(), "a3".into()],
    }];
    let orch = Orchestrator::new(cfg, worker).unwrap();

    let id = orch
        .submit_task(submission(TaskType::DataAnalysis).with_mode(CollaborationMode::Parallel))
        .await
        .unwrap();
    orch.dispatch_next().await;

    let history = orch.collaboration_history();
    assert_eq!(history.len(), 1);
    let result = &history[0];
    assert_eq!(result.task_id, id);
    assert!(result.success);
    assert_eq!(result.individual_results.len(), 3);
    assert!(result.individual_results[0].error.is_none());
    assert!(result.individual_results[1].error.is_none());
    assert!(result.individual_results[2].error.is_some());
    assert!((result.confidence - 0.7).abs() < 1e-9);
    assert_eq!(result.merged_result["recommendations"], json!(["rest", "fluids"]));
    assert!(result.merged_result["errors"]["a3"].is_string());

    let status = orch.get_task_status(id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Completed);
    for id in ["a1", "a2", "a3"] {
        assert_eq!(load_of(&orch, id), 0);
    }
    assert!((orch.get_statistics().await.collaboration_success_rate - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_sequential_failure_fails_task() {
    let worker = Arc::new(ScriptedWorker::new().failing("first"));
    let mut cfg = config(
        vec![
            agent("first", &[TaskType::TreatmentPlanning], 2),
            agent("second", &[TaskType::TreatmentPlanning], 2),
        ],
        AssignmentStrategy::Collaborative,
    );
    cfg.collaboration_patterns = vec![CollaborationPattern {
        task_type: TaskType::TreatmentPlanning,
        agents: vec!["first".into(), "second".into()],
    }];
    let orch = Orchestrator::new(cfg, worker.clone()).unwrap();

    let id = orch.submit_task(submission(TaskType::TreatmentPlanning)).await.unwrap();
    orch.dispatch_next().await;

    let status = orch.get_task_status(id).await.unwrap();
    assert!(matches!(status.status, TaskStatus::Failed { .. }));
    assert!(status.results["error"].as_str().unwrap().contains("first"));
    assert_eq!(worker.calls.lock().len(), 1);
    assert_eq!(load_of(&orch, "first"), 0);
    assert_eq!(load_of(&orch, "second"), 0);
    assert_eq!(orch.get_statistics().await.collaboration_success_rate, 0.0);
}

// ---------------------------------------------------------------------------
// Scenario E: priority order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_emergency_tasks_run_before_low() {
    let worker = Arc::new(ScriptedWorker::new());
    let orch = Orchestrator::new(
        config(
            vec![agent("assistant", &[TaskType::KnowledgeQuery], 10)],
            AssignmentStrategy::CapabilityBased,
        ),
        worker.clone(),
    )
    .unwrap();

    let mut low = Vec::new();
    for _ in 0..10 {
        low.push(
            orch.submit_task(submission(TaskType::KnowledgeQuery).with_priority(TaskPriority::Low))
                .await
                .unwrap(),
        );
    }
    let mut emergency = Vec::new();
    for _ in 0..2 {
        emergency.push(
            orch.submit_task(
                submission(TaskType::KnowledgeQuery).with_priority(TaskPriority::Emergency),
            )
            .await
            .unwrap(),
        );
    }

    while orch.dispatch_next().await.is_some() {}

    let order = worker.call_order();
    assert_eq!(order.len(), 12);
    assert_eq!(&order[..2], emergency.as_slice());
    assert_eq!(&order[2..], low.as_slice());
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cancel_queued_task_is_idempotent() {
    let orch = Orchestrator::new(
        config(
            vec![agent("assistant", &[TaskType::Education], 2)],
            AssignmentStrategy::CapabilityBased,
        ),
        Arc::new(ScriptedWorker::new()),
    )
    .unwrap();
    let id = orch.submit_task(submission(TaskType::Education)).await.unwrap();

    assert!(orch.cancel_task(id).await);
    assert!(!orch.cancel_task(id).await);
    assert!(!orch.cancel_task(Uuid::new_v4()).await);
    assert_eq!(orch.get_task_status(id).await.unwrap().status, TaskStatus::Cancelled);
    assert_eq!(orch.dispatch_next().await, None);
    assert_eq!(orch.get_statistics().await.cancelled_tasks, 1);
}

#[tokio::test]
async fn test_cancel_running_task_releases_load_and_discards_result() {
    let gate = Arc::new(Semaphore::new(0));
    let worker = Arc::new(ScriptedWorker::new().gated(gate.clone()));
    let mut cfg = config(
        vec![
            agent("assistant", &[TaskType::Education], 2),
            agent("tutor", &[TaskType::Education], 2),
        ],
        AssignmentStrategy::Collaborative,
    );
    cfg.collaboration_patterns = vec![CollaborationPattern {
        task_type: TaskType::Education,
        agents: vec!["assistant".into(), "tutor".into()],
    }];
    let orch = Orchestrator::new(cfg, worker.clone()).unwrap();
    let id = orch
        .submit_task(submission(TaskType::Education).with_mode(CollaborationMode::Parallel))
        .await
        .unwrap();

    let runner = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.dispatch_next().await })
    };
    wait_for_calls(&worker, 2).await;
    assert_eq!(load_of(&orch, "assistant"), 1);
    assert_eq!(load_of(&orch, "tutor"), 1);

    assert!(orch.cancel_task(id).await);
    assert!(!orch.cancel_task(id).await);
    assert_eq!(load_of(&orch, "assistant"), 0);
    assert_eq!(load_of(&orch, "tutor"), 0);

    // Both agents finish successfully after the cancel.
    gate.add_permits(2);
    assert_eq!(runner.await.unwrap(), Some(id));

    let status = orch.get_task_status(id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Cancelled);
    assert_eq!(
        status.assigned_agents,
        vec![AgentId::from("assistant"), AgentId::from("tutor")]
    );
    assert!(status.results.get("final_result").is_none());
    assert_eq!(load_of(&orch, "assistant"), 0);
    assert_eq!(load_of(&orch, "tutor"), 0);

    assert!(orch.collaboration_history().is_empty());
    let stats = orch.get_statistics().await;
    assert_eq!(stats.cancelled_tasks, 1);
    assert_eq!(stats.completed_tasks, 0);
    assert_eq!(stats.collaboration_history_size, 0);
    assert_eq!(stats.collaboration_success_rate, 0.0);
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_escalate_running_task() {
    let gate = Arc::new(Semaphore::new(0));
    let worker = Arc::new(ScriptedWorker::new().gated(gate.clone()));
    let orch = Orchestrator::new(
        config(
            vec![agent("specialist", &[TaskType::SymptomAnalysis], 2)],
            AssignmentStrategy::CapabilityBased,
        ),
        worker.clone(),
    )
    .unwrap();
    let id = orch.submit_task(submission(TaskType::SymptomAnalysis)).await.unwrap();

    assert!(matches!(
        orch.escalate_task(id).await,
        Err(ConcordError::UnknownTask(_))
    ));

    let runner = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.dispatch_next().await })
    };
    worker.entered.notified().await;

    orch.escalate_task(id).await.unwrap();
    assert_eq!(orch.get_task_status(id).await.unwrap().status, TaskStatus::Escalated);
    assert!(matches!(
        orch.escalate_task(id).await,
        Err(ConcordError::InvalidTransition(_))
    ));
    assert_eq!(load_of(&orch, "specialist"), 1);

    gate.add_permits(1);
    runner.await.unwrap();
    assert_eq!(orch.get_task_status(id).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(load_of(&orch, "specialist"), 0);
}

// ---------------------------------------------------------------------------
// Consensus and hierarchy through the facade
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_consensus_identical_recommendations() {
    let worker = Arc::new(
        ScriptedWorker::new()
            .recommending(&["A"])
            .confidence("c1", 0.1)
            .confidence("c2", 0.1)
            .confidence("c3", 0.1)
            .revised("c1", 0.9)
            .revised("c2", 0.7)
            .revised("c3", 0.8),
    );
    let mut cfg = config(
        vec![
            agent("c1", &[TaskType::DiagnosisSupport], 1),
            agent("c2", &[TaskType::DiagnosisSupport], 1),
            agent("c3", &[TaskType::DiagnosisSupport], 1),
        ],
        AssignmentStrategy::Collaborative,
    );
    cfg.collaboration_patterns = vec![CollaborationPattern {
        task_type: TaskType::DiagnosisSupport,
        agents: vec!["c1".into(), "c2".into(), "c3".into()],
    }];
    let orch = Orchestrator::new(cfg, worker.clone()).unwrap();

    let id = orch
        .submit_task(submission(TaskType::DiagnosisSupport).with_mode(CollaborationMode::Consensus))
        .await
        .unwrap();
    orch.dispatch_next().await;

    let result = orch.collaboration_history().pop().unwrap();
    let summary = result.consensus.clone().unwrap();
    assert_eq!(summary.conclusion, Conclusion::Agreed(vec!["A".into()]));
    assert_eq!(summary.responders, 3);
    assert!((result.confidence - 0.8).abs() < 1e-9);
    assert_eq!(result.merged_result["conclusion"], json!(["A"]));
    assert_eq!(worker.calls.lock().len(), 6);

    let status = orch.get_task_status(id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Completed);
    assert!((status.results["confidence_score"].as_f64().unwrap() - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn test_hierarchical_authority_output_is_final() {
    let worker = Arc::new(ScriptedWorker::new().confidence("chief", 0.95));
    let mut cfg = config(
        vec![
            AgentCapability::new("resident", [TaskType::TreatmentPlanning], 0.6, 2, 1.0, 0.8),
            AgentCapability::new("chief", [TaskType::TreatmentPlanning], 0.95, 2, 1.0, 0.9),
        ],
        AssignmentStrategy::Collaborative,
    );
    cfg.collaboration_patterns = vec![CollaborationPattern {
        task_type: TaskType::TreatmentPlanning,
        agents: vec!["chief".into(), "resident".into()],
    }];
    let orch = Orchestrator::new(cfg, worker.clone()).unwrap();

    let id = orch
        .submit_task(
            submission(TaskType::TreatmentPlanning).with_mode(CollaborationMode::Hierarchical),
        )
        .await
        .unwrap();
    orch.dispatch_next().await;

    let calls = worker.calls.lock().clone();
    assert_eq!(calls.last().unwrap().0, "chief");
    let status = orch.get_task_status(id).await.unwrap();
    assert_eq!(status.results["final_result"]["agent"], "chief");
    assert!((status.results["confidence_score"].as_f64().unwrap() - 0.95).abs() < 1e-9);
}

// ---------------------------------------------------------------------------
// Events, capabilities, persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_event_callbacks_fire_and_can_be_removed() {
    let orch = Orchestrator::new(
        config(
            vec![agent("assistant", &[TaskType::Education], 4)],
            AssignmentStrategy::CapabilityBased,
        ),
        Arc::new(ScriptedWorker::new()),
    )
    .unwrap();

    let completed = Arc::new(AtomicUsize::new(0));
    let counter = completed.clone();
    let callback = orch.add_event_callback(
        EventKind::TaskCompleted,
        handler_fn(move |event| {
            assert_eq!(event.task.status, TaskStatus::Completed);
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );
    orch.add_event_callback(
        EventKind::TaskCompleted,
        handler_fn(|_| Err(ConcordError::Store("callback broke".into()))),
    );

    orch.submit_task(submission(TaskType::Education)).await.unwrap();
    orch.dispatch_next().await;
    assert_eq!(completed.load(Ordering::SeqCst), 1);

    assert!(orch.remove_event_callback(EventKind::TaskCompleted, callback));
    assert!(!orch.remove_event_callback(EventKind::TaskCompleted, callback));
    orch.submit_task(submission(TaskType::Education)).await.unwrap();
    orch.dispatch_next().await;
    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert_eq!(orch.get_statistics().await.completed_tasks, 2);
}

#[tokio::test]
async fn test_update_agent_capability_changes_selection() {
    let orch = Orchestrator::new(
        OrchestratorConfig::default(),
        Arc::new(ScriptedWorker::new()),
    )
    .unwrap();
    let specialist = AgentId::from("specialist");
    let update = CapabilityUpdate {
        expertise: Some(0.99),
        ..Default::default()
    };
    orch.update_agent_capability(&specialist, update).unwrap();
    assert_eq!(orch.get_agent_status()[&specialist].capability.expertise, 0.99);

    let id = orch.submit_task(submission(TaskType::DiagnosisSupport)).await.unwrap();
    orch.dispatch_next().await;
    assert_eq!(
        orch.get_task_status(id).await.unwrap().assigned_agents,
        vec![specialist.clone()]
    );

    let bad = CapabilityUpdate {
        success_rate: Some(-0.1),
        ..Default::default()
    };
    assert!(orch.update_agent_capability(&specialist, bad).is_err());
    assert!(matches!(
        orch.update_agent_capability(&AgentId::from("ghost"), CapabilityUpdate::default()),
        Err(ConcordError::UnknownAgent(_))
    ));
}

#[tokio::test]
async fn test_file_store_mirrors_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileTaskStore::new(dir.path().to_path_buf()).await.unwrap());
    let orch = Orchestrator::with_store(
        config(
            vec![agent("assistant", &[TaskType::Education], 4)],
            AssignmentStrategy::CapabilityBased,
        ),
        Arc::new(ScriptedWorker::new()),
        store.clone(),
    )
    .unwrap();

    let first = orch
        .submit_task(submission(TaskType::Education).with_priority(TaskPriority::Urgent))
        .await
        .unwrap();
    let second = orch.submit_task(submission(TaskType::Education)).await.unwrap();
    assert_eq!(store.queued_ids().await.unwrap(), vec![second, first]);
    let record = store.load_record(first).await.unwrap().unwrap();
    assert_eq!(record["status"], "pending");
    assert_eq!(record["priority"], "4");

    orch.dispatch_next().await;
    assert_eq!(store.queued_ids().await.unwrap(), vec![second]);
    let record = store.load_record(first).await.unwrap().unwrap();
    assert_eq!(record["status"], "completed");
    assert_eq!(record["assigned_agents"], "[\"assistant\"]");
    assert!(!record["completed_at"].is_empty());

    assert!(orch.cancel_task(second).await);
    assert!(store.queued_ids().await.unwrap().is_empty());
    assert_eq!(store.load_record(second).await.unwrap().unwrap()["status"], "cancelled");
}

#[tokio::test]
async fn test_cleanup_pass_keeps_recent_history() {
    let orch = Orchestrator::new(
        config(
            vec![agent("assistant", &[TaskType::Education], 4)],
            AssignmentStrategy::CapabilityBased,
        ),
        Arc::new(ScriptedWorker::new()),
    )
    .unwrap();
    let id = orch.submit_task(submission(TaskType::Education)).await.unwrap();
    orch.dispatch_next().await;
    assert_eq!(orch.run_cleanup_pass().await, CleanupReport::default());
    assert!(orch.get_task_status(id).await.is_some());
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_started_loops_drain_queue() {
    let mut cfg = config(
        vec![agent("assistant", &[TaskType::Education], 4)],
        AssignmentStrategy::CapabilityBased,
    );
    cfg.idle_poll_ms = 10;
    let orch = Orchestrator::new(cfg, Arc::new(ScriptedWorker::new())).unwrap();
    let handle = orch.start();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(orch.submit_task(submission(TaskType::Education)).await.unwrap());
    }

    tokio::time::timeout(Duration::from_secs(5), async {
        while !orch.is_idle().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue never drained");
    handle.shutdown().await;

    for id in ids {
        assert_eq!(orch.get_task_status(id).await.unwrap().status, TaskStatus::Completed);
    }
    assert_eq!(orch.get_statistics().await.completed_tasks, 5);
}

// ---------------------------------------------------------------------------
// Concurrency: load bounds, conservation, monotonic status
// ---------------------------------------------------------------------------

fn rank(status: &TaskStatus) -> u8 {
    match status {
        TaskStatus::Pending => 0,
        TaskStatus::Assigned => 1,
        TaskStatus::InProgress | TaskStatus::Escalated => 2,
        _ => 3,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_load_stays_bounded_and_conserved() {
    run_concurrent_mix(AssignmentStrategy::LoadBalanced).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_collaborative_teams_stay_bounded_and_conserved() {
    let orch = run_concurrent_mix(AssignmentStrategy::Collaborative).await;

    // Only results of tasks the dispatcher itself settled are recorded.
    let history = orch.collaboration_history();
    assert!(!history.is_empty());
    for result in history {
        assert!(result.participants.len() >= 2);
        let status = orch.get_task_status(result.task_id).await.unwrap().status;
        match status {
            TaskStatus::Completed => assert!(result.success),
            TaskStatus::Failed { reason } => {
                assert!(!result.success);
                assert_ne!(reason, DEADLINE_EXCEEDED);
            }
            other => panic!("collaboration recorded for {other} task {}", result.task_id),
        }
    }
}

/// Submit a mixed workload while dispatchers, a canceller and the monitor
/// run concurrently, sampling load bounds and status order throughout.
async fn run_concurrent_mix(strategy: AssignmentStrategy) -> Orchestrator {
    const TASKS: usize = 60;

    let worker = Arc::new(
        ScriptedWorker::new()
            .failing("gamma")
            .delayed(Duration::from_millis(2)),
    );
    let mut cfg = config(
        vec![
            agent("alpha", &[TaskType::DataAnalysis, TaskType::Education], 2),
            agent("beta", &[TaskType::DataAnalysis], 3),
            agent("gamma", &[TaskType::DataAnalysis, TaskType::Education], 1),
        ],
        strategy,
    );
    cfg.collaboration_patterns = vec![
        CollaborationPattern {
            task_type: TaskType::DataAnalysis,
            agents: vec!["alpha".into(), "beta".into(), "gamma".into()],
        },
        CollaborationPattern {
            task_type: TaskType::Education,
            agents: vec!["alpha".into(), "gamma".into()],
        },
    ];
    let orch = Orchestrator::new(cfg, worker).unwrap();

    let ids = Arc::new(Mutex::new(Vec::<Uuid>::new()));
    let submitted_all = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let submitter = {
        let orch = orch.clone();
        let ids = ids.clone();
        let submitted_all = submitted_all.clone();
        tokio::spawn(async move {
            for i in 0..TASKS {
                let task_type = if i % 2 == 0 { TaskType::DataAnalysis } else { TaskType::Education };
                let mut sub = submission(task_type)
                    .with_priority(TaskPriority::ALL[i % TaskPriority::ALL.len()])
                    .with_mode(if i % 3 == 0 { CollaborationMode::Parallel } else { CollaborationMode::Sequential });
                if i % 7 == 0 {
                    sub = sub.with_deadline(Utc::now() - chrono::Duration::seconds(1));
                } else if i % 11 == 0 {
                    sub = sub.with_deadline(Utc::now() + chrono::Duration::milliseconds(3));
                }
                let id = orch.submit_task(sub).await.unwrap();
                ids.lock().push(id);
                tokio::task::yield_now().await;
            }
            submitted_all.store(true, Ordering::SeqCst);
        })
    };

    let dispatchers: Vec<_> = (0..4)
        .map(|_| {
            let orch = orch.clone();
            let submitted_all = submitted_all.clone();
            tokio::spawn(async move {
                loop {
                    let done = submitted_all.load(Ordering::SeqCst);
                    match orch.dispatch_next().await {
                        Some(_) => {}
                        None if done => break,
                        None => tokio::time::sleep(Duration::from_millis(1)).await,
                    }
                }
            })
        })
        .collect();

    let canceller = {
        let orch = orch.clone();
        let ids = ids.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut next = 0;
            while !stop.load(Ordering::SeqCst) {
                let target = ids.lock().get(next).copied();
                if let Some(id) = target {
                    if next % 4 == 0 {
                        orch.cancel_task(id).await;
                    }
                    next += 1;
                }
                tokio::task::yield_now().await;
            }
        })
    };

    let monitor = {
        let orch = orch.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                orch.run_monitor_pass().await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let sampler = {
        let orch = orch.clone();
        let ids = ids.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut seen: HashMap<Uuid, u8> = HashMap::new();
            while !stop.load(Ordering::SeqCst) {
                for (id, status) in orch.get_agent_status() {
                    let cap = status.capability;
                    assert!(
                        cap.current_load <= cap.max_load,
                        "agent {id} load {} over {}",
                        cap.current_load,
                        cap.max_load
                    );
                }
                let snapshot: Vec<Uuid> = ids.lock().clone();
                for id in snapshot {
                    let status = orch.get_task_status(id).await.expect("task vanished");
                    let now = rank(&status.status);
                    let before = seen.insert(id, now).unwrap_or(0);
                    assert!(now >= before, "task {id} went backwards to {}", status.status);
                }
                tokio::task::yield_now().await;
            }
        })
    };

    submitter.await.unwrap();
    for handle in dispatchers {
        handle.await.unwrap();
    }
    stop.store(true, Ordering::SeqCst);
    canceller.await.unwrap();
    monitor.await.unwrap();
    sampler.await.unwrap();

    // Every task is terminal and no load leaked.
    for id in ids.lock().clone() {
        let status = orch.get_task_status(id).await.unwrap();
        assert!(status.status.is_terminal(), "task {id} left in {}", status.status);
    }
    for (id, status) in orch.get_agent_status() {
        assert_eq!(status.capability.current_load, 0, "agent {id} leaked load");
    }

    let stats = orch.get_statistics().await;
    assert_eq!(stats.total_tasks, TASKS as u64);
    assert_eq!(
        stats.completed_tasks + stats.failed_tasks + stats.cancelled_tasks,
        TASKS as u64
    );
    assert!(stats.timed_out_tasks <= stats.failed_tasks);
    assert_eq!(stats.active_tasks, 0);
    assert_eq!(stats.queued_tasks, 0);
    assert!(stats.collaboration_history_size as u64 <= stats.completed_tasks + stats.failed_tasks);
    orch
}
