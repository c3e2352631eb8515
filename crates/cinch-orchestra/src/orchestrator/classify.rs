//! Keyword classification of requests into phase definitions.
//!
//! A classifier holds phase templates. Templates with no triggers always
//! apply; the rest apply when any trigger prefixes a word of the request.
//! Dependencies on templates that were not selected are dropped, so a
//! request that skips the frontend still yields a valid plan.

use crate::modules::predict::tokenize;
use crate::phase::{AgentSpec, PhaseDefinition, PhaseKind};
use crate::request::OrchestrationRequest;
use std::collections::BTreeSet;
use tracing::debug;

/// A phase the classifier may select.
#[derive(Debug, Clone)]
pub struct PhaseTemplate {
    pub id: String,
    pub name: String,
    pub kind: PhaseKind,
    /// Lowercase keyword prefixes. Empty means always selected.
    pub triggers: Vec<String>,
    pub agents: Vec<AgentSpec>,
    pub parallel: bool,
    pub deps: Vec<String>,
    pub budget_allocation: u64,
}

impl PhaseTemplate {
    pub fn new(id: impl Into<String>, kind: PhaseKind, budget_allocation: u64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            triggers: Vec::new(),
            agents: Vec::new(),
            parallel: false,
            deps: Vec::new(),
            budget_allocation,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_triggers(mut self, triggers: &[&str]) -> Self {
        self.triggers = triggers.iter().map(|t| t.to_lowercase()).collect();
        self
    }

    pub fn with_agent(mut self, agent: AgentSpec) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_dep(mut self, dep: impl Into<String>) -> Self {
        self.deps.push(dep.into());
        self
    }

    pub fn is_always(&self) -> bool {
        self.triggers.is_empty()
    }

    fn matches(&self, words: &[String]) -> bool {
        self.is_always()
            || words
                .iter()
                .any(|w| self.triggers.iter().any(|t| w.starts_with(t.as_str())))
    }
}

/// Maps requests to phases.
#[derive(Debug, Clone, Default)]
pub struct RequestClassifier {
    templates: Vec<PhaseTemplate>,
}

impl RequestClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(mut self, template: PhaseTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn templates(&self) -> &[PhaseTemplate] {
        &self.templates
    }

    /// Phases selected for `request`, in template order.
    pub fn classify(&self, request: &OrchestrationRequest, timeout_ms: u64) -> Vec<PhaseDefinition> {
        let mut words = tokenize(&request.combined_text());
        words.extend(request.platform.iter().flat_map(|p| tokenize(p)));

        let selected: Vec<&PhaseTemplate> = self.templates.iter().filter(|t| t.matches(&words)).collect();
        let ids: BTreeSet<&str> = selected.iter().map(|t| t.id.as_str()).collect();
        debug!("Classified request into {} phase(s): {ids:?}", ids.len());

        selected
            .into_iter()
            .map(|t| {
                let mut phase = PhaseDefinition::new(&t.id, t.kind)
                    .with_name(&t.name)
                    .with_parallel(t.parallel)
                    .with_budget(t.budget_allocation)
                    .with_timeout_ms(timeout_ms);
                for agent in &t.agents {
                    phase = phase.with_agent(agent.clone());
                }
                for dep in t.deps.iter().filter(|d| ids.contains(d.as_str())) {
                    phase = phase.with_dep(dep);
                }
                phase
            })
            .collect()
    }

    /// Templates for the admin-builder agent teams.
    pub fn admin_builder() -> Self {
        Self::new()
            .with_template(
                PhaseTemplate::new("requirements", PhaseKind::Requirements, 8_000)
                    .with_name("Requirements analysis")
                    .with_agent(AgentSpec::required("product/requirements-analyst")),
            )
            .with_template(
                PhaseTemplate::new("schema", PhaseKind::Schema, 14_000)
                    .with_name("Database schema")
                    .with_agent(AgentSpec::required("database/schema-architect"))
                    .with_agent(AgentSpec::optional("database/migration-planner"))
                    .with_dep("requirements"),
            )
            .with_template(
                PhaseTemplate::new("api", PhaseKind::Api, 12_000)
                    .with_name("API design")
                    .with_agent(AgentSpec::required("backend/api-designer"))
                    .with_dep("schema"),
            )
            .with_template(
                PhaseTemplate::new("backend", PhaseKind::Backend, 20_000)
                    .with_name("Backend services")
                    .with_parallel(true)
                    .with_agent(AgentSpec::required("backend/service-builder"))
                    .with_agent(AgentSpec::optional("backend/query-optimizer"))
                    .with_dep("api"),
            )
            .with_template(
                PhaseTemplate::new("frontend", PhaseKind::Frontend, 20_000)
                    .with_name("Admin interface")
                    .with_triggers(&["admin", "ui", "dashboard", "frontend", "page", "panel"])
                    .with_parallel(true)
                    .with_agent(AgentSpec::required("frontend/admin-ui-builder"))
                    .with_agent(AgentSpec::optional("frontend/component-designer"))
                    .with_dep("api"),
            )
            .with_template(
                PhaseTemplate::new("security", PhaseKind::Security, 12_000)
                    .with_name("Security")
                    .with_triggers(&["auth", "security", "rbac", "permission", "role", "audit", "login"])
                    .with_agent(AgentSpec::required("security/auth-specialist"))
                    .with_agent(AgentSpec::optional("security/rbac-designer"))
                    .with_dep("schema"),
            )
            .with_template(
                PhaseTemplate::new("testing", PhaseKind::Testing, 10_000)
                    .with_name("Testing")
                    .with_triggers(&["test", "qa", "coverage"])
                    .with_agent(AgentSpec::required("quality/test-engineer"))
                    .with_dep("backend"),
            )
            .with_template(
                PhaseTemplate::new("documentation", PhaseKind::Documentation, 6_000)
                    .with_name("Documentation")
                    .with_triggers(&["doc", "readme", "guide"])
                    .with_agent(AgentSpec::required("documentation/technical-writer"))
                    .with_dep("api"),
            )
    }
}
