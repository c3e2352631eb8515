//! Phase definitions and execution plans.

use crate::error::{OrchestraError, Result};
use crate::graph::{CriticalRules, DependencyGraph};
use crate::modules::{ModuleKey, Variant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Default per-phase timeout.
pub const DEFAULT_PHASE_TIMEOUT_MS: u64 = 120_000;

/// What a phase produces. Drives compression, eviction priority, and the
/// output section its result lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    Requirements,
    Schema,
    Api,
    Backend,
    Frontend,
    Security,
    Testing,
    Documentation,
    Other,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::Schema => "schema",
            Self::Api => "api",
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Security => "security",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::Other => "other",
        }
    }

    /// Output section a result of this kind is grouped under.
    pub fn domain(&self) -> &'static str {
        match self {
            Self::Requirements => "requirements",
            Self::Schema => "database",
            Self::Api | Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Security => "security",
            Self::Testing => "testing",
            Self::Documentation => "documentation",
            Self::Other => "other",
        }
    }

    /// Results every later phase may consult, not just direct dependents.
    pub fn is_cross_cutting(&self) -> bool {
        matches!(self, Self::Requirements | Self::Security)
    }

    /// Whether results are structural schema definitions.
    pub fn is_schema(&self) -> bool {
        matches!(self, Self::Schema)
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent a phase runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub module: String,
    #[serde(default)]
    pub variant: Variant,
    /// Optional agents may be dropped when they fail to load or run.
    #[serde(default)]
    pub optional: bool,
}

impl AgentSpec {
    pub fn required(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            variant: Variant::Core,
            optional: false,
        }
    }

    pub fn optional(module: impl Into<String>) -> Self {
        Self {
            optional: true,
            ..Self::required(module)
        }
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(self.module.clone(), self.variant)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    pub name: String,
    pub kind: PhaseKind,
    pub agents: Vec<AgentSpec>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub deps: BTreeSet<String>,
    /// Estimated units this phase needs resident.
    pub budget_allocation: u64,
    pub timeout_ms: u64,
}

impl PhaseDefinition {
    pub fn new(id: impl Into<String>, kind: PhaseKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            agents: Vec::new(),
            parallel: false,
            deps: BTreeSet::new(),
            budget_allocation: 0,
            timeout_ms: DEFAULT_PHASE_TIMEOUT_MS,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_agent(mut self, agent: AgentSpec) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.deps.insert(dep.into());
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_budget(mut self, units: u64) -> Self {
        self.budget_allocation = units;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// The minimal core-only form: required agents, detail demoted to core.
    pub fn narrowed(&self) -> Self {
        let agents = self
            .agents
            .iter()
            .filter(|a| !a.optional)
            .map(|a| {
                let variant = match a.variant {
                    Variant::Detail => Variant::Core,
                    other => other,
                };
                a.clone().with_variant(variant)
            })
            .collect();
        Self {
            agents,
            ..self.clone()
        }
    }
}

/// Phases in dependency order plus the summed budget estimate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub phases: Vec<PhaseDefinition>,
    pub total_budget: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// Order `phases` topologically and total their allocations.
    pub fn from_phases(phases: Vec<PhaseDefinition>) -> Result<Self> {
        let graph = build_graph(&phases, CriticalRules::none())?;
        let order = graph.topological_order()?;
        let mut remaining = phases;
        let mut ordered = Vec::with_capacity(remaining.len());
        for id in order {
            if let Some(pos) = remaining.iter().position(|p| p.id == id) {
                ordered.push(remaining.swap_remove(pos));
            }
        }
        let total_budget = ordered
            .iter()
            .try_fold(0u64, |total, p| total.checked_add(p.budget_allocation))
            .ok_or_else(|| OrchestraError::PlanInvalid("summed budget allocations overflow".into()))?;
        Ok(Self {
            phases: ordered,
            total_budget,
            created_at: Utc::now(),
        })
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_ids(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.id.clone()).collect()
    }

    /// Dependency graph of this plan under `rules`.
    pub fn graph(&self, rules: CriticalRules) -> Result<DependencyGraph> {
        build_graph(&self.phases, rules)
    }

    /// Replace one phase with its narrowed form. Returns false if absent.
    pub fn narrow_to_core(&mut self, phase_id: &str) -> bool {
        match self.phases.iter_mut().find(|p| p.id == phase_id) {
            Some(phase) => {
                *phase = phase.narrowed();
                true
            }
            None => false,
        }
    }

    /// Fail `PlanInvalid` if the estimated total exceeds `capacity`.
    pub fn check_capacity(&self, capacity: u64) -> Result<()> {
        if self.total_budget > capacity {
            return Err(OrchestraError::PlanInvalid(format!(
                "estimated budget {} exceeds capacity {capacity}",
                self.total_budget
            )));
        }
        Ok(())
    }
}

fn build_graph(phases: &[PhaseDefinition], rules: CriticalRules) -> Result<DependencyGraph> {
    let mut graph = DependencyGraph::new().with_rules(rules);
    for phase in phases {
        graph.add_phase(&phase.id, phase.deps.iter().cloned())?;
    }
    Ok(graph)
}
