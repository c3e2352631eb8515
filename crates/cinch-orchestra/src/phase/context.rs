//! Per-run state shared by every phase of one orchestration run.

use crate::agent::AgentRegistry;
use crate::budget::ResourceTracker;
use crate::graph::DependencyGraph;
use crate::error::Result;
use crate::memory::{CleanupReport, MemoryStore, RawPhaseResult, StoreOutcome};
use crate::modules::ModuleLoader;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Everything a phase needs, constructed at run start and dropped at run end.
///
/// There is no process-wide state: two runs never share a tracker, loader,
/// or memory store.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: String,
    /// Request text handed to every agent.
    pub request: String,
    pub tracker: Arc<ResourceTracker>,
    pub loader: Arc<ModuleLoader>,
    pub registry: Arc<AgentRegistry>,
    pub memory: MemoryStore,
    pub graph: DependencyGraph,
    /// Phases with a committed result, in commit order.
    pub completed: Vec<String>,
    executed: BTreeSet<String>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        request: impl Into<String>,
        loader: Arc<ModuleLoader>,
        registry: Arc<AgentRegistry>,
        memory: MemoryStore,
        graph: DependencyGraph,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            request: request.into(),
            tracker: Arc::clone(loader.tracker()),
            loader,
            registry,
            memory,
            graph,
            completed: Vec::new(),
            executed: BTreeSet::new(),
        }
    }

    pub fn executed(&self) -> &BTreeSet<String> {
        &self.executed
    }

    pub fn is_executed(&self, phase_id: &str) -> bool {
        self.executed.contains(phase_id)
    }

    /// Compress and store a phase result, protecting the context of every
    /// phase not yet executed.
    pub fn store_result(&mut self, raw: RawPhaseResult) -> Result<StoreOutcome> {
        self.memory
            .store_phase_result(raw, &self.graph, &self.executed)
    }

    /// Shrink the memory store toward `target_fraction` of its capacity.
    pub fn cleanup_memory(&mut self, target_fraction: f64) -> CleanupReport {
        self.memory
            .intelligent_cleanup(target_fraction, &self.graph, &self.executed)
    }

    /// Record a committed phase.
    pub fn mark_executed(&mut self, phase_id: &str) {
        if self.executed.insert(phase_id.to_string()) {
            self.completed.push(phase_id.to_string());
        }
    }
}
