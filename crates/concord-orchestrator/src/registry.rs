use crate::types::{AgentCapability, CapabilityUpdate, TaskType};
use concord_core::{AgentId, ConcordError, ConcordResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Process-wide table of agent capabilities and load counters.
///
/// Every mutation takes the single write lock, so a load change is applied
/// atomically and is visible to the next reader immediately. Iteration order
/// is lexicographic by agent id.
pub struct CapabilityRegistry {
    agents: RwLock<BTreeMap<AgentId, AgentCapability>>,
}

impl CapabilityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry seeded with `capabilities`, each passed through [`CapabilityRegistry::register`].
    pub fn from_capabilities(capabilities: impl IntoIterator<Item = AgentCapability>) -> Self {
        let registry = Self::new();
        for capability in capabilities {
            registry.register(capability);
        }
        registry
    }

    /// Add or replace an agent. Load is clamped and availability recomputed.
    pub fn register(&self, mut capability: AgentCapability) {
        capability.current_load = capability.current_load.min(capability.max_load);
        capability.recompute_availability();
        info!(agent = %capability.agent_id, max_load = capability.max_load, "Registered agent");
        self.agents
            .write()
            .insert(capability.agent_id.clone(), capability);
    }

    /// Copy of one agent's capability.
    pub fn get(&self, agent: &AgentId) -> Option<AgentCapability> {
        self.agents.read().get(agent).cloned()
    }

    /// Whether `agent` is registered.
    pub fn contains(&self, agent: &AgentId) -> bool {
        self.agents.read().contains_key(agent)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    /// True when no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// Consistent copy of every capability, ordered by agent id.
    pub fn snapshot(&self) -> Vec<AgentCapability> {
        self.agents.read().values().cloned().collect()
    }

    /// Agents that serve `task_type`, are available and below `max_load`.
    pub fn list_eligible(&self, task_type: TaskType) -> Vec<AgentCapability> {
        self.agents
            .read()
            .values()
            .filter(|c| c.is_eligible(task_type))
            .cloned()
            .collect()
    }

    /// Take one slot on `agent`. Returns false (and changes nothing) when the
    /// agent is unknown or already at `max_load`.
    pub fn increment_load(&self, agent: &AgentId) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(agent) {
            Some(cap) if cap.current_load < cap.max_load => {
                cap.current_load += 1;
                cap.recompute_availability();
                true
            }
            Some(_) => false,
            None => {
                debug!(agent = %agent, "increment_load on unknown agent ignored");
                false
            }
        }
    }

    /// Release one slot on `agent`. Clamped at zero; unknown agents are ignored.
    pub fn decrement_load(&self, agent: &AgentId) -> bool {
        let mut agents = self.agents.write();
        match agents.get_mut(agent) {
            Some(cap) if cap.current_load > 0 => {
                cap.current_load -= 1;
                cap.recompute_availability();
                true
            }
            Some(cap) => {
                warn!(agent = %cap.agent_id, "decrement_load below zero clamped");
                false
            }
            None => false,
        }
    }

    /// Take one slot on every listed agent, or none at all.
    ///
    /// Duplicated ids take one slot per occurrence.
    pub fn reserve(&self, agents: &[AgentId]) -> bool {
        let mut table = self.agents.write();

        let mut wanted: BTreeMap<&AgentId, u32> = BTreeMap::new();
        for agent in agents {
            *wanted.entry(agent).or_default() += 1;
        }

        let fits = wanted.iter().all(|(agent, n)| {
            table
                .get(*agent)
                .is_some_and(|c| c.available && c.current_load + n <= c.max_load)
        });
        if !fits {
            return false;
        }

        for (agent, n) in wanted {
            if let Some(cap) = table.get_mut(agent) {
                cap.current_load += n;
                cap.recompute_availability();
            }
        }
        true
    }

    /// Undo a [`CapabilityRegistry::reserve`].
    pub fn release(&self, agents: &[AgentId]) {
        for agent in agents {
            self.decrement_load(agent);
        }
    }

    /// Recompute every agent's availability from its load and return the
    /// per-agent load ratio.
    pub fn recompute_availability(&self) -> Vec<(AgentId, f64)> {
        let mut agents = self.agents.write();
        agents
            .values_mut()
            .map(|cap| {
                cap.recompute_availability();
                (cap.agent_id.clone(), cap.load_ratio())
            })
            .collect()
    }

    /// Apply a partial update to an agent's static capability fields.
    pub fn update(&self, agent: &AgentId, update: CapabilityUpdate) -> ConcordResult<AgentCapability> {
        let mut agents = self.agents.write();
        let cap = agents
            .get_mut(agent)
            .ok_or_else(|| ConcordError::UnknownAgent(agent.clone()))?;

        if let Some(expertise) = update.expertise {
            check_unit("expertise", expertise)?;
        }
        if let Some(rate) = update.success_rate {
            check_unit("success_rate", rate)?;
        }
        if let Some(secs) = update.response_time_secs {
            AgentCapability::check_response_time(secs)?;
        }
        if let Some(max_load) = update.max_load {
            if max_load == 0 {
                return Err(ConcordError::Config("max_load must be positive".into()));
            }
            if max_load < cap.current_load {
                return Err(ConcordError::Config(format!(
                    "max_load {max_load} is below current load {} of agent {agent}",
                    cap.current_load
                )));
            }
        }

        if let Some(expertise) = update.expertise {
            cap.expertise = expertise;
        }
        if let Some(rate) = update.success_rate {
            cap.success_rate = rate;
        }
        if let Some(secs) = update.response_time_secs {
            cap.response_time_secs = secs;
        }
        if let Some(max_load) = update.max_load {
            cap.max_load = max_load;
        }
        if let Some(specialties) = update.specialties {
            cap.specialties = specialties;
        }
        if let Some(task_types) = update.task_types {
            cap.task_types = task_types;
        }
        cap.recompute_availability();

        info!(agent = %agent, "Updated agent capability");
        Ok(cap.clone())
    }
}

fn check_unit(field: &str, value: f64) -> ConcordResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConcordError::Config(format!(
            "{field} must be within [0, 1], got {value}"
        )))
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
