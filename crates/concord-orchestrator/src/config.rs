use crate::collaboration::{CollaborationPolicy, HierarchyAuthority};
use crate::profiles::{default_capabilities, default_collaboration_patterns};
use crate::strategy::{AssignmentStrategy, CollaborationPattern};
use crate::types::AgentCapability;
use concord_core::{ConcordError, ConcordResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

/// Orchestrator settings, usually read from `concord.toml`.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How the dispatcher picks agents.
    #[serde(default)]
    pub assignment_strategy: AssignmentStrategy,
    /// Agreement fraction for consensus, in `(0, 1]`.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// Final word in hierarchical collaborations.
    #[serde(default)]
    pub hierarchy_authority: HierarchyAuthority,
    /// Longest the dispatcher sleeps on an empty queue before re-checking.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Seconds between monitor passes.
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    /// Seconds between cleanup passes.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Age after which terminal tasks leave the history.
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u64,
    /// Cap on retained terminal tasks.
    #[serde(default = "default_max_history")]
    pub max_task_history: usize,
    /// Cap on retained collaboration results.
    #[serde(default = "default_max_history")]
    pub max_collaboration_history: usize,
    /// Per-call worker timeout. Unset waits forever.
    #[serde(default)]
    pub agent_timeout_secs: Option<f64>,
    /// Capacity of the broadcast event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Agents registered at startup.
    #[serde(default = "default_capabilities")]
    pub agents: Vec<AgentCapability>,
    /// Teams used by the collaborative strategy.
    #[serde(default = "default_collaboration_patterns")]
    pub collaboration_patterns: Vec<CollaborationPattern>,
}

/// Upper bound on `agent_timeout_secs`: one day.
pub const MAX_AGENT_TIMEOUT_SECS: f64 = 86_400.0;

fn default_consensus_threshold() -> f64 {
    0.6
}
fn default_idle_poll_ms() -> u64 {
    1000
}
fn default_monitor_interval_secs() -> u64 {
    30
}
fn default_cleanup_interval_secs() -> u64 {
    3600
}
fn default_history_retention_days() -> u64 {
    30
}
fn default_max_history() -> usize {
    1000
}
fn default_event_buffer() -> usize {
    256
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            assignment_strategy: AssignmentStrategy::default(),
            consensus_threshold: default_consensus_threshold(),
            hierarchy_authority: HierarchyAuthority::default(),
            idle_poll_ms: default_idle_poll_ms(),
            monitor_interval_secs: default_monitor_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            history_retention_days: default_history_retention_days(),
            max_task_history: default_max_history(),
            max_collaboration_history: default_max_history(),
            agent_timeout_secs: None,
            event_buffer: default_event_buffer(),
            agents: default_capabilities(),
            collaboration_patterns: default_collaboration_patterns(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> ConcordResult<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| ConcordError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> ConcordResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Check ranges and cross references between agents and patterns.
    pub fn validate(&self) -> ConcordResult<()> {
        if !(self.consensus_threshold > 0.0 && self.consensus_threshold <= 1.0) {
            return Err(ConcordError::Config(format!(
                "consensus_threshold must be in (0, 1], got {}",
                self.consensus_threshold
            )));
        }
        if self.idle_poll_ms == 0 || self.monitor_interval_secs == 0 || self.cleanup_interval_secs == 0 {
            return Err(ConcordError::Config("loop intervals must be positive".into()));
        }
        if self.max_task_history == 0 || self.max_collaboration_history == 0 {
            return Err(ConcordError::Config("history limits must be positive".into()));
        }
        if let Some(secs) = self.agent_timeout_secs {
            if !(secs.is_finite() && secs > 0.0 && secs <= MAX_AGENT_TIMEOUT_SECS) {
                return Err(ConcordError::Config(format!(
                    "agent_timeout_secs must be within (0, {MAX_AGENT_TIMEOUT_SECS}], got {secs}"
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for agent in &self.agents {
            if !seen.insert(&agent.agent_id) {
                return Err(ConcordError::Config(format!("duplicate agent {}", agent.agent_id)));
            }
            if agent.max_load == 0 {
                return Err(ConcordError::Config(format!(
                    "agent {} has max_load 0",
                    agent.agent_id
                )));
            }
            // Load is only taken by assigned tasks.
            if agent.current_load != 0 {
                return Err(ConcordError::Config(format!(
                    "agent {} must not preset current_load",
                    agent.agent_id
                )));
            }
            if AgentCapability::check_response_time(agent.response_time_secs).is_err() {
                return Err(ConcordError::Config(format!(
                    "agent {}: response_time_secs must be within [0, {}], got {}",
                    agent.agent_id,
                    AgentCapability::MAX_RESPONSE_TIME_SECS,
                    agent.response_time_secs
                )));
            }
            for (field, value) in [("expertise", agent.expertise), ("success_rate", agent.success_rate)] {
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConcordError::Config(format!(
                        "agent {}: {field} must be within [0, 1], got {value}",
                        agent.agent_id
                    )));
                }
            }
        }
        for pattern in &self.collaboration_patterns {
            if let Some(unknown) = pattern.agents.iter().find(|a| !seen.contains(a)) {
                return Err(ConcordError::Config(format!(
                    "collaboration pattern for {} names unknown agent {unknown}",
                    pattern.task_type
                )));
            }
        }
        Ok(())
    }

    /// Collaboration tunables derived from this config.
    pub fn collaboration_policy(&self) -> CollaborationPolicy {
        CollaborationPolicy {
            consensus_threshold: self.consensus_threshold,
            authority: self.hierarchy_authority,
            agent_timeout: self
                .agent_timeout_secs
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
        }
    }

    /// Idle poll interval as a `Duration`.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Monitor interval as a `Duration`.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// Cleanup interval as a `Duration`.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// History retention as a chrono duration.
    pub fn retention(&self) -> chrono::Duration {
        // Capped at a century to stay inside chrono's range.
        chrono::Duration::days(self.history_retention_days.min(36_500) as i64)
    }
}
