use crate::types::{AgentCapability, Task, TaskType};
use concord_core::{AgentId, ConcordError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Heuristic mapping a task to the agent(s) that will run it.
///
/// Chosen once from configuration and applied to every task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Highest expertise.
    #[default]
    CapabilityBased,
    /// Lowest `current_load / max_load`.
    LoadBalanced,
    /// Highest `0.7 * expertise + 0.3 * success_rate`.
    ExpertiseWeighted,
    /// Lowest mean response time.
    ResponseTimeOptimized,
    /// Fixed team per task type from the collaboration table.
    Collaborative,
}

impl AssignmentStrategy {
    /// Pick agents for `task` from a registry snapshot.
    ///
    /// Single-agent strategies consider only agents eligible for the task type
    /// and break ties on the lexicographically smallest id. An empty result
    /// means nobody can take the task.
    pub fn select(
        self,
        task: &Task,
        agents: &[AgentCapability],
        table: &CollaborationTable,
    ) -> Vec<AgentId> {
        if self == AssignmentStrategy::Collaborative {
            return table.available_team(task.task_type, agents);
        }

        let eligible = agents.iter().filter(|c| c.is_eligible(task.task_type));
        let best = match self {
            AssignmentStrategy::CapabilityBased => pick_best(eligible, |a, b| {
                total(b.expertise, a.expertise)
            }),
            AssignmentStrategy::LoadBalanced => pick_best(eligible, |a, b| {
                total(a.load_ratio(), b.load_ratio())
            }),
            AssignmentStrategy::ExpertiseWeighted => pick_best(eligible, |a, b| {
                total(weighted_score(b), weighted_score(a))
            }),
            AssignmentStrategy::ResponseTimeOptimized => pick_best(eligible, |a, b| {
                total(a.response_time_secs, b.response_time_secs)
            }),
            AssignmentStrategy::Collaborative => None,
        };
        best.map(|c| vec![c.agent_id.clone()]).unwrap_or_default()
    }

    /// Snake-case name as used in config files.
    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStrategy::CapabilityBased => "capability_based",
            AssignmentStrategy::LoadBalanced => "load_balanced",
            AssignmentStrategy::ExpertiseWeighted => "expertise_weighted",
            AssignmentStrategy::ResponseTimeOptimized => "response_time_optimized",
            AssignmentStrategy::Collaborative => "collaborative",
        }
    }
}

impl fmt::Display for AssignmentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStrategy {
    type Err = ConcordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capability_based" => Ok(AssignmentStrategy::CapabilityBased),
            "load_balanced" => Ok(AssignmentStrategy::LoadBalanced),
            "expertise_weighted" => Ok(AssignmentStrategy::ExpertiseWeighted),
            "response_time_optimized" => Ok(AssignmentStrategy::ResponseTimeOptimized),
            "collaborative" => Ok(AssignmentStrategy::Collaborative),
            other => Err(ConcordError::Config(format!(
                "unknown assignment strategy: {other}"
            ))),
        }
    }
}

fn weighted_score(cap: &AgentCapability) -> f64 {
    0.7 * cap.expertise + 0.3 * cap.success_rate
}

fn total(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Smallest element under `better_first`, falling back to agent id on ties.
fn pick_best<'a>(
    agents: impl Iterator<Item = &'a AgentCapability>,
    better_first: impl Fn(&AgentCapability, &AgentCapability) -> Ordering,
) -> Option<&'a AgentCapability> {
    agents.min_by(|a, b| better_first(a, b).then_with(|| a.agent_id.cmp(&b.agent_id)))
}

/// One row of the collaboration table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationPattern {
    /// Task type the team serves.
    pub task_type: TaskType,
    /// Team members in execution order.
    pub agents: Vec<AgentId>,
}

/// Task type to ordered team, used by [`AssignmentStrategy::Collaborative`].
#[derive(Debug, Clone, Default)]
pub struct CollaborationTable {
    teams: HashMap<TaskType, Vec<AgentId>>,
}

impl CollaborationTable {
    /// Later rows for the same task type replace earlier ones.
    pub fn new(patterns: impl IntoIterator<Item = CollaborationPattern>) -> Self {
        Self {
            teams: patterns
                .into_iter()
                .map(|p| (p.task_type, p.agents))
                .collect(),
        }
    }

    /// Configured team for `task_type`, empty when none.
    pub fn team(&self, task_type: TaskType) -> &[AgentId] {
        self.teams.get(&task_type).map_or(&[], Vec::as_slice)
    }

    /// Members of the team that exist, are available and have a free slot,
    /// in table order and without duplicates. Task-type membership is not
    /// checked: the table is authoritative.
    pub fn available_team(&self, task_type: TaskType, agents: &[AgentCapability]) -> Vec<AgentId> {
        let mut team: Vec<AgentId> = Vec::new();
        for member in self.team(task_type) {
            if team.contains(member) {
                continue;
            }
            let free = agents
                .iter()
                .any(|c| &c.agent_id == member && c.has_capacity());
            if free {
                team.push(member.clone());
            }
        }
        team
    }

    /// Number of task types with a team.
    pub fn len(&self) -> usize {
        self.teams.len()
    }

    /// True when no teams are configured.
    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{default_capabilities, default_collaboration_patterns};
    use concord_core::Payload;

    fn task(task_type: TaskType) -> Task {
        Task::new(task_type, "t", "", "user", Payload::new())
    }

    fn ids(list: &[&str]) -> Vec<AgentId> {
        list.iter().map(|s| AgentId::from(*s)).collect()
    }

    fn table() -> CollaborationTable {
        CollaborationTable::new(default_collaboration_patterns())
    }

    #[test]
    fn test_capability_based_picks_highest_expertise() {
        let agents = default_capabilities();
        let picked = AssignmentStrategy::CapabilityBased.select(
            &task(TaskType::DiagnosisSupport),
            &agents,
            &table(),
        );
        assert_eq!(picked, ids(&["senior-specialist"]));
    }

    #[test]
    fn test_load_balanced_prefers_idle_agent() {
        let agents = vec![
            AgentCapability::new("a", [TaskType::DataAnalysis], 0.9, 4, 1.0, 0.9).with_load(2),
            AgentCapability::new("b", [TaskType::DataAnalysis], 0.5, 4, 1.0, 0.9).with_load(1),
        ];
        let picked =
            AssignmentStrategy::LoadBalanced.select(&task(TaskType::DataAnalysis), &agents, &table());
        assert_eq!(picked, ids(&["b"]));
    }

    #[test]
    fn test_expertise_weighted_blends_success_rate() {
        // a: 0.7*0.80 + 0.3*0.50 = 0.71, b: 0.7*0.75 + 0.3*0.70 = 0.735
        let agents = vec![
            AgentCapability::new("a", [TaskType::Education], 0.80, 4, 1.0, 0.50),
            AgentCapability::new("b", [TaskType::Education], 0.75, 4, 1.0, 0.70),
        ];
        let picked = AssignmentStrategy::ExpertiseWeighted.select(
            &task(TaskType::Education),
            &agents,
            &table(),
        );
        assert_eq!(picked, ids(&["b"]));
    }

    #[test]
    fn test_response_time_optimized_picks_fastest() {
        let agents = default_capabilities();
        let picked = AssignmentStrategy::ResponseTimeOptimized.select(
            &task(TaskType::DataAnalysis),
            &agents,
            &table(),
        );
        // wellness-coach (3s) beats specialist (5s)
        assert_eq!(picked, ids(&["wellness-coach"]));
    }

    #[test]
    fn test_ties_go_to_smallest_id() {
        let agents = vec![
            AgentCapability::new("zeta", [TaskType::Education], 0.8, 4, 1.0, 0.9),
            AgentCapability::new("alpha", [TaskType::Education], 0.8, 4, 1.0, 0.9),
            AgentCapability::new("mid", [TaskType::Education], 0.8, 4, 1.0, 0.9),
        ];
        for strategy in [
            AssignmentStrategy::CapabilityBased,
            AssignmentStrategy::LoadBalanced,
            AssignmentStrategy::ExpertiseWeighted,
            AssignmentStrategy::ResponseTimeOptimized,
        ] {
            let picked = strategy.select(&task(TaskType::Education), &agents, &table());
            assert_eq!(picked, ids(&["alpha"]), "strategy {strategy}");
        }
    }

    #[test]
    fn test_saturated_agents_are_never_selected() {
        let agents = vec![
            AgentCapability::new("only", [TaskType::Education], 0.9, 1, 1.0, 0.9).with_load(1),
        ];
        let picked =
            AssignmentStrategy::CapabilityBased.select(&task(TaskType::Education), &agents, &table());
        assert!(picked.is_empty());
    }

    #[test]
    fn test_collaborative_keeps_table_order_and_skips_busy() {
        let mut agents = default_capabilities();
        let picked = AssignmentStrategy::Collaborative.select(
            &task(TaskType::TreatmentPlanning),
            &agents,
            &table(),
        );
        assert_eq!(picked, ids(&["specialist", "senior-specialist", "wellness-coach"]));

        for cap in agents.iter_mut() {
            if cap.agent_id.as_str() == "senior-specialist" {
                *cap = cap.clone().with_load(cap.max_load);
            }
        }
        let picked = AssignmentStrategy::Collaborative.select(
            &task(TaskType::TreatmentPlanning),
            &agents,
            &table(),
        );
        assert_eq!(picked, ids(&["specialist", "wellness-coach"]));
    }

    #[test]
    fn test_collaborative_without_row_is_empty() {
        let picked = AssignmentStrategy::Collaborative.select(
            &task(TaskType::Education),
            &default_capabilities(),
            &table(),
        );
        assert!(picked.is_empty());
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in [
            AssignmentStrategy::CapabilityBased,
            AssignmentStrategy::LoadBalanced,
            AssignmentStrategy::ExpertiseWeighted,
            AssignmentStrategy::ResponseTimeOptimized,
            AssignmentStrategy::Collaborative,
        ] {
            assert_eq!(strategy.as_str().parse::<AssignmentStrategy>().ok(), Some(strategy));
        }
        assert!("round_robin".parse::<AssignmentStrategy>().is_err());
    }
}
