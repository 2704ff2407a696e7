use crate::strategy::CollaborationPattern;
use crate::types::{AgentCapability, TaskType};
use concord_core::AgentId;

/// The four standard agents, used when configuration names none.
pub fn default_capabilities() -> Vec<AgentCapability> {
    vec![
        assistant_profile(),
        specialist_profile(),
        senior_specialist_profile(),
        wellness_coach_profile(),
    ]
}

/// Front-line agent: fast, broad, shallow.
fn assistant_profile() -> AgentCapability {
    AgentCapability::new(
        "assistant",
        [
            TaskType::HealthConsultation,
            TaskType::KnowledgeQuery,
            TaskType::Education,
        ],
        0.7,
        10,
        2.0,
        0.85,
    )
    .with_specialties(&["user interaction", "basic consultation", "health education"])
}

fn specialist_profile() -> AgentCapability {
    AgentCapability::new(
        "specialist",
        [
            TaskType::SymptomAnalysis,
            TaskType::DiagnosisSupport,
            TaskType::DataAnalysis,
        ],
        0.8,
        8,
        5.0,
        0.88,
    )
    .with_specialties(&["symptom analysis", "preliminary diagnosis", "data analysis"])
}

/// Slow, scarce and most trusted; the default hierarchical authority.
fn senior_specialist_profile() -> AgentCapability {
    AgentCapability::new(
        "senior-specialist",
        [
            TaskType::DiagnosisSupport,
            TaskType::TreatmentPlanning,
            TaskType::EmergencyResponse,
        ],
        0.95,
        5,
        10.0,
        0.95,
    )
    .with_specialties(&["complex diagnosis", "treatment plans", "difficult cases"])
}

fn wellness_coach_profile() -> AgentCapability {
    AgentCapability::new(
        "wellness-coach",
        [
            TaskType::PreventionGuidance,
            TaskType::LifestyleAdvice,
            TaskType::DataAnalysis,
        ],
        0.75,
        12,
        3.0,
        0.82,
    )
    .with_specialties(&["preventive care", "lifestyle guidance", "health management"])
}

/// Default teams for the collaborative strategy.
pub fn default_collaboration_patterns() -> Vec<CollaborationPattern> {
    fn row(task_type: TaskType, agents: &[&str]) -> CollaborationPattern {
        CollaborationPattern {
            task_type,
            agents: agents.iter().map(|a| AgentId::from(*a)).collect(),
        }
    }

    vec![
        row(TaskType::DiagnosisSupport, &["specialist", "senior-specialist"]),
        row(
            TaskType::TreatmentPlanning,
            &["specialist", "senior-specialist", "wellness-coach"],
        ),
        row(TaskType::EmergencyResponse, &["assistant", "senior-specialist"]),
        row(TaskType::HealthConsultation, &["assistant", "wellness-coach"]),
        row(TaskType::PreventionGuidance, &["wellness-coach", "specialist"]),
    ]
}
