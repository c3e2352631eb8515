//! Phase dependency graph.
//!
//! Phases live in an arena (`Vec<Node>` plus an id index); edges are arena
//! indices, so dependents back-links never form ownership cycles.
//!
//! A phase may name a dependency before that dependency is declared. The
//! reference creates a placeholder node that a later `add_phase` fills in.
//! Ordering refuses to proceed while any placeholder remains.
//!
//! Besides direct dependencies, a phase's required context includes
//! transitive dependencies flagged critical by [`CriticalRules`]: results
//! that must stay resolvable because nothing downstream can rebuild them.

use crate::error::{OrchestraError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

// ── Critical rules ─────────────────────────────────────────────────

/// Static table of `(consumer, provider)` phase pairs where the consumer
/// needs the provider's result even when it only depends on it transitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalRules {
    pairs: BTreeSet<(String, String)>,
}

impl CriticalRules {
    /// An empty table: only direct dependencies are required.
    pub fn none() -> Self {
        Self {
            pairs: BTreeSet::new(),
        }
    }

    /// Add a rule (builder pattern).
    pub fn with_rule(mut self, consumer: impl Into<String>, provider: impl Into<String>) -> Self {
        self.pairs.insert((consumer.into(), provider.into()));
        self
    }

    pub fn is_critical(&self, consumer: &str, provider: &str) -> bool {
        self.pairs
            .contains(&(consumer.to_string(), provider.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl Default for CriticalRules {
    /// Rules for the admin-builder workflow.
    fn default() -> Self {
        Self::none()
            .with_rule("frontend", "schema")
            .with_rule("frontend", "api")
            .with_rule("security", "schema")
            .with_rule("testing", "schema")
            .with_rule("testing", "api")
            .with_rule("documentation", "schema")
    }
}

// ── Graph ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Node {
    id: String,
    /// False for placeholders created by forward references.
    declared: bool,
    /// Position in declaration order, used to break ordering ties.
    declared_at: usize,
    direct_deps: BTreeSet<usize>,
    dependents: BTreeSet<usize>,
}

/// Read-only view of one phase's edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub phase_id: String,
    pub direct_deps: BTreeSet<String>,
    pub dependents: BTreeSet<String>,
    /// Transitive dependencies kept alive by the critical rules.
    pub critical_deps: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    declared: usize,
    rules: CriticalRules,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(mut self, rules: CriticalRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &CriticalRules {
        &self.rules
    }

    fn node_for(&mut self, id: &str) -> usize {
        if let Some(&idx) = self.index.get(id) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(Node {
            id: id.to_string(),
            declared: false,
            declared_at: usize::MAX,
            direct_deps: BTreeSet::new(),
            dependents: BTreeSet::new(),
        });
        self.index.insert(id.to_string(), idx);
        idx
    }

    /// Whether `from` reaches `to` by following dependency edges.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(idx) = stack.pop() {
            if idx == to {
                return true;
            }
            if seen.insert(idx) {
                stack.extend(self.nodes[idx].direct_deps.iter().copied());
            }
        }
        false
    }

    /// Declare a phase and its direct dependencies.
    ///
    /// Fails with `CyclicDependency` if an edge would close a cycle and
    /// with `PlanInvalid` if the phase is declared twice. A failed call
    /// leaves the graph unchanged.
    pub fn add_phase<I, S>(&mut self, id: &str, deps: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let deps: Vec<String> = deps.into_iter().map(Into::into).collect();
        let existing = self.index.get(id).copied();

        if let Some(idx) = existing
            && self.nodes[idx].declared
        {
            return Err(OrchestraError::PlanInvalid(format!(
                "phase '{id}' is declared twice"
            )));
        }
        for dep in &deps {
            let closes_cycle = dep == id
                || matches!(
                    (existing, self.index.get(dep.as_str())),
                    (Some(idx), Some(&d)) if self.reaches(d, idx)
                );
            if closes_cycle {
                return Err(OrchestraError::CyclicDependency {
                    phase: id.to_string(),
                    dependency: dep.clone(),
                });
            }
        }

        let idx = self.node_for(id);
        for dep in &deps {
            let d = self.node_for(dep);
            self.nodes[idx].direct_deps.insert(d);
            self.nodes[d].dependents.insert(idx);
        }
        let node = &mut self.nodes[idx];
        node.declared = true;
        node.declared_at = self.declared;
        self.declared += 1;
        trace!("Declared phase {id} with {} dependency(ies)", deps.len());
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn is_declared(&self, id: &str) -> bool {
        self.index
            .get(id)
            .is_some_and(|&idx| self.nodes[idx].declared)
    }

    /// Number of declared phases.
    pub fn len(&self) -> usize {
        self.declared
    }

    pub fn is_empty(&self) -> bool {
        self.declared == 0
    }

    /// Ids referenced as dependencies but never declared.
    pub fn placeholders(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !n.declared)
            .map(|n| n.id.clone())
            .collect()
    }

    fn ids(&self, indices: &BTreeSet<usize>) -> BTreeSet<String> {
        indices.iter().map(|&i| self.nodes[i].id.clone()).collect()
    }

    pub fn direct_deps(&self, id: &str) -> BTreeSet<String> {
        self.index
            .get(id)
            .map(|&idx| self.ids(&self.nodes[idx].direct_deps))
            .unwrap_or_default()
    }

    pub fn dependents(&self, id: &str) -> BTreeSet<String> {
        self.index
            .get(id)
            .map(|&idx| self.ids(&self.nodes[idx].dependents))
            .unwrap_or_default()
    }

    fn transitive_deps(&self, idx: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        let mut stack: Vec<usize> = self.nodes[idx].direct_deps.iter().copied().collect();
        while let Some(d) = stack.pop() {
            if out.insert(d) {
                stack.extend(self.nodes[d].direct_deps.iter().copied());
            }
        }
        out
    }

    /// Transitive dependencies of `id` that the critical rules keep alive.
    pub fn critical_deps(&self, id: &str) -> BTreeSet<String> {
        let Some(&idx) = self.index.get(id) else {
            return BTreeSet::new();
        };
        self.transitive_deps(idx)
            .into_iter()
            .map(|d| &self.nodes[d].id)
            .filter(|dep| self.rules.is_critical(id, dep))
            .cloned()
            .collect()
    }

    /// Direct dependencies plus critical transitive ones.
    pub fn required_context(&self, id: &str) -> BTreeSet<String> {
        let mut required = self.direct_deps(id);
        required.extend(self.critical_deps(id));
        required
    }

    pub fn node(&self, id: &str) -> Option<GraphNode> {
        let &idx = self.index.get(id)?;
        let node = &self.nodes[idx];
        Some(GraphNode {
            phase_id: node.id.clone(),
            direct_deps: self.ids(&node.direct_deps),
            dependents: self.ids(&node.dependents),
            critical_deps: self.critical_deps(id),
        })
    }

    /// Declared phases in dependency order, ties broken by declaration order.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        if let Some(missing) = self.nodes.iter().find(|n| !n.declared) {
            return Err(OrchestraError::PlanInvalid(format!(
                "phase '{}' is referenced as a dependency but never declared",
                missing.id
            )));
        }

        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.direct_deps.len()).collect();
        // (declared_at, index) so the ready set pops in declaration order.
        let mut ready: BTreeSet<(usize, usize)> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] == 0)
            .map(|(i, n)| (n.declared_at, i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some((_, idx)) = ready.pop_first() {
            order.push(self.nodes[idx].id.clone());
            for &dependent in &self.nodes[idx].dependents {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.insert((self.nodes[dependent].declared_at, dependent));
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck = self
                .nodes
                .iter()
                .enumerate()
                .find(|(i, _)| in_degree[*i] > 0)
                .map(|(_, n)| n);
            let (phase, dependency) = stuck
                .and_then(|n| {
                    n.direct_deps
                        .iter()
                        .next()
                        .map(|&d| (n.id.clone(), self.nodes[d].id.clone()))
                })
                .unwrap_or_default();
            return Err(OrchestraError::CyclicDependency { phase, dependency });
        }
        Ok(order)
    }

    /// Phases whose results must survive eviction: the required context of
    /// every declared phase not yet in `executed`.
    pub fn protected_set(&self, executed: &BTreeSet<String>) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter(|n| n.declared && !executed.contains(&n.id))
            .flat_map(|n| self.required_context(&n.id))
            .collect()
    }
}
