//! The run state machine.
//!
//! ```text
//! Planning ─▶ Executing(i) ─┬─▶ Executing(i+1) ─▶ … ─▶ Assembling ─▶ Done
//!                           └─▶ Recovery(i) ─▶ Executing(i) ─▶ …
//!                                        └─▶ Assembling ─▶ Failed (partial)
//! ```
//!
//! Phases run one at a time in dependency order. A phase that fails under
//! budget pressure is narrowed to its required core agents and retried
//! once. Any other failure, or a failed retry, aborts the run; results of
//! completed phases are still assembled into the output.

use crate::agent::AgentRegistry;
use crate::budget::ResourceTracker;
use crate::checkpoint::{CheckpointStore, RunCheckpoint, generate_run_id};
use crate::config::OrchestraConfig;
use crate::error::{OrchestraError, Result};
use crate::events::{EventHandler, NoopHandler, OrchestraEvent};
use crate::graph::CriticalRules;
use crate::memory::{MemoryStore, PhaseResult};
use crate::modules::{ModuleLoader, ModuleSource, PreloadTable};
use crate::orchestrator::classify::RequestClassifier;
use crate::orchestrator::output::{OrchestrationOutput, RunError, assemble_output};
use crate::phase::{ExecutionPlan, PhaseExecutor, PhaseOutcome, RunContext};
use crate::request::OrchestrationRequest;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Planning,
    /// Executing the phase at this plan index.
    Executing(usize),
    /// Recovering the phase at this plan index.
    Recovery(usize),
    Assembling,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => f.write_str("planning"),
            Self::Executing(i) => write!(f, "executing({i})"),
            Self::Recovery(i) => write!(f, "recovery({i})"),
            Self::Assembling => f.write_str("assembling"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Starting point of a run: fresh, or restored from a checkpoint.
struct RunSeed {
    run_id: String,
    request: OrchestrationRequest,
    plan: ExecutionPlan,
    completed: Vec<String>,
    results: Vec<PhaseResult>,
}

impl From<RunCheckpoint> for RunSeed {
    fn from(cp: RunCheckpoint) -> Self {
        Self {
            run_id: cp.run_id,
            request: cp.request,
            plan: cp.plan,
            completed: cp.completed,
            results: cp.results,
        }
    }
}

/// Plans and executes orchestration requests.
///
/// ```ignore
/// let source = Arc::new(DirectorySource::new("agents"));
/// let orchestrator = Orchestrator::new(OrchestraConfig::default(), source)?
///     .with_event_handler(LoggingHandler);
/// let output = orchestrator
///     .execute_request(&OrchestrationRequest::new("admin panel with RBAC"))
///     .await;
/// ```
pub struct Orchestrator {
    config: OrchestraConfig,
    source: Arc<dyn ModuleSource>,
    registry: Arc<AgentRegistry>,
    classifier: RequestClassifier,
    rules: CriticalRules,
    preload: PreloadTable,
    events: Arc<dyn EventHandler>,
    checkpoints: Option<CheckpointStore>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("rules", &self.rules)
            .field("checkpoints", &self.checkpoints)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Validate `config` and build an orchestrator over `source`.
    ///
    /// Creates the checkpoint directory when one is configured.
    pub fn new(config: OrchestraConfig, source: Arc<dyn ModuleSource>) -> Result<Self> {
        config.validate()?;
        let checkpoints = match &config.checkpoint_dir {
            Some(dir) => Some(CheckpointStore::new(dir.clone())?),
            None => None,
        };
        Ok(Self {
            config,
            source,
            registry: Arc::new(AgentRegistry::new()),
            classifier: RequestClassifier::admin_builder(),
            rules: CriticalRules::default(),
            preload: PreloadTable::admin_builder(),
            events: Arc::new(NoopHandler),
            checkpoints,
        })
    }

    pub fn with_registry(mut self, registry: AgentRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_classifier(mut self, classifier: RequestClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_critical_rules(mut self, rules: CriticalRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_preload_table(mut self, table: PreloadTable) -> Self {
        self.preload = table;
        self
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events = Arc::new(handler);
        self
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn config(&self) -> &OrchestraConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> Option<&CheckpointStore> {
        self.checkpoints.as_ref()
    }

    // ── Planning ───────────────────────────────────────────────────

    /// Classify `request` into an ordered plan.
    ///
    /// Loads nothing. Fails `PlanInvalid` when no phase applies or the
    /// summed allocations exceed capacity.
    pub fn create_execution_plan(&self, request: &OrchestrationRequest) -> Result<ExecutionPlan> {
        let phases = self
            .classifier
            .classify(request, self.config.phase_timeout_ms);
        if phases.is_empty() {
            return Err(OrchestraError::PlanInvalid("request matched no phases".into()));
        }
        let plan = ExecutionPlan::from_phases(phases)?;
        plan.check_capacity(self.config.capacity)?;
        Ok(plan)
    }

    // ── Execution ──────────────────────────────────────────────────

    /// Plan and execute `request`.
    pub async fn execute_request(&self, request: &OrchestrationRequest) -> OrchestrationOutput {
        let started = Instant::now();
        let run_id = generate_run_id();
        match self.create_execution_plan(request) {
            Ok(plan) => {
                let seed = RunSeed {
                    run_id,
                    request: request.clone(),
                    plan,
                    completed: Vec::new(),
                    results: Vec::new(),
                };
                self.run(seed, started).await
            }
            Err(err) => self.reject(&run_id, &err, started),
        }
    }

    /// Execute a caller-built plan.
    ///
    /// The phase order is recomputed from the dependency graph, so phases
    /// may be listed in any order.
    pub async fn execute_plan(&self, plan: ExecutionPlan, request: &OrchestrationRequest) -> OrchestrationOutput {
        let started = Instant::now();
        let run_id = generate_run_id();
        let validated = ExecutionPlan::from_phases(plan.phases).and_then(|p| {
            p.check_capacity(self.config.capacity)?;
            Ok(p)
        });
        match validated {
            Ok(plan) => {
                let seed = RunSeed {
                    run_id,
                    request: request.clone(),
                    plan,
                    completed: Vec::new(),
                    results: Vec::new(),
                };
                self.run(seed, started).await
            }
            Err(err) => self.reject(&run_id, &err, started),
        }
    }

    /// Continue a checkpointed run from its first incomplete phase.
    pub async fn resume(&self, run_id: &str) -> Result<OrchestrationOutput> {
        let store = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| OrchestraError::Config("checkpointing is disabled".into()))?;
        let checkpoint = store
            .load(run_id)?
            .ok_or_else(|| OrchestraError::InvalidRequest(format!("no checkpoint for run {run_id}")))?;
        info!(
            "[{run_id}] Resuming after {} completed phase(s)",
            checkpoint.completed.len()
        );
        Ok(self.run(RunSeed::from(checkpoint), Instant::now()).await)
    }

    fn reject(&self, run_id: &str, err: &OrchestraError, started: Instant) -> OrchestrationOutput {
        warn!("[{run_id}] Rejected before execution: {err}");
        self.events.on_event(&OrchestraEvent::StateChanged {
            from: RunState::Planning,
            to: RunState::Failed,
        });
        self.events.on_event(&OrchestraEvent::RunFinished {
            run_id,
            success: false,
            phases_completed: 0,
            budget_used: 0,
        });
        OrchestrationOutput::rejected(run_id, err, elapsed_ms(started))
    }

    async fn run(&self, seed: RunSeed, started: Instant) -> OrchestrationOutput {
        let RunSeed {
            run_id,
            request,
            mut plan,
            completed,
            results,
        } = seed;
        self.events.on_event(&OrchestraEvent::PlanCreated {
            run_id: &run_id,
            phases: plan.phases.len(),
            total_budget: plan.total_budget,
        });

        let graph = match plan.graph(self.rules.clone()) {
            Ok(graph) => graph,
            Err(err) => return self.reject(&run_id, &err, started),
        };

        let config = &self.config;
        let tracker = Arc::new(ResourceTracker::with_margin(config.capacity, config.safety_margin));
        let loader = Arc::new(
            ModuleLoader::new(Arc::clone(&self.source), tracker)
                .with_summary_size(config.summary_size)
                .with_summary_allowance(config.summary_allowance)
                .with_retention(config.retain_after_uses),
        );
        if config.preload {
            // Detached: summaries are a hint and never gate execution.
            drop(loader.preload_summaries(&request.combined_text(), &self.preload));
        }

        let memory = MemoryStore::new(config.store_capacity).with_policy(config.retention.clone());
        let mut ctx = RunContext::new(
            run_id.as_str(),
            request.combined_text(),
            Arc::clone(&loader),
            Arc::clone(&self.registry),
            memory,
            graph,
        );
        for result in results {
            ctx.memory.restore(result);
        }
        for id in &completed {
            ctx.mark_executed(id);
        }

        let executor = PhaseExecutor::new(config.fan_out, Arc::clone(&self.events));
        let mut state = RunState::Planning;
        let mut failure = None;

        for index in 0..plan.phases.len() {
            if ctx.is_executed(&plan.phases[index].id) {
                debug!("Skipping completed phase {}", plan.phases[index].id);
                continue;
            }
            self.transition(&mut state, RunState::Executing(index));
            match self
                .run_phase(&executor, &mut ctx, &mut plan, index, &mut state)
                .await
            {
                Ok(outcome) => {
                    self.events.on_event(&OrchestraEvent::PhaseCompleted {
                        phase_id: &outcome.phase_id,
                        elapsed_ms: outcome.elapsed_ms,
                        result_size: outcome.result_size,
                    });
                    self.cleanup(&mut ctx);
                    self.checkpoint(&ctx, &request, &plan);
                }
                Err(err) => {
                    self.events.on_event(&OrchestraEvent::PhaseFailed {
                        phase_id: &plan.phases[index].id,
                        error: &err,
                    });
                    failure = Some(err);
                    break;
                }
            }
        }

        self.transition(&mut state, RunState::Assembling);
        let sections = assemble_output(&ctx.memory.results());
        let loader_stats = loader.stats();
        let budget_used = ctx.tracker.peak();
        loader.unload_all();

        let success = failure.is_none();
        self.transition(
            &mut state,
            if success { RunState::Done } else { RunState::Failed },
        );
        let phases_completed = ctx.completed.len();
        self.events.on_event(&OrchestraEvent::RunFinished {
            run_id: &run_id,
            success,
            phases_completed,
            budget_used,
        });

        OrchestrationOutput {
            success,
            partial: !success,
            completed_phases: ctx.completed.clone(),
            error: failure.as_ref().map(RunError::from),
            sections,
            budget_used,
            phases_completed,
            elapsed_ms: elapsed_ms(started),
            loader: loader_stats,
            run_id,
        }
    }

    /// Run one phase, narrowing and retrying once under budget pressure.
    async fn run_phase(
        &self,
        executor: &PhaseExecutor,
        ctx: &mut RunContext,
        plan: &mut ExecutionPlan,
        index: usize,
        state: &mut RunState,
    ) -> Result<PhaseOutcome> {
        let total = plan.phases.len();
        let phase = plan.phases[index].clone();
        self.events.on_event(&OrchestraEvent::PhaseStarted {
            phase_id: &phase.id,
            index,
            total,
            attempt: 1,
        });

        let err = match executor.run(ctx, &phase).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_budget_pressure() => err,
            Err(err) => return Err(err),
        };

        self.events.on_event(&OrchestraEvent::PhaseFailed {
            phase_id: &phase.id,
            error: &err,
        });
        self.transition(state, RunState::Recovery(index));
        self.events.on_event(&OrchestraEvent::Recovery {
            phase_id: &phase.id,
            action: "narrow_to_core",
        });
        plan.narrow_to_core(&phase.id);
        let narrowed = plan.phases[index].clone();
        debug!(
            "Narrowed {} from {} to {} agent(s)",
            phase.id,
            phase.agents.len(),
            narrowed.agents.len()
        );

        self.transition(state, RunState::Executing(index));
        self.events.on_event(&OrchestraEvent::PhaseStarted {
            phase_id: &narrowed.id,
            index,
            total,
            attempt: 2,
        });
        executor.run(ctx, &narrowed).await
    }

    fn cleanup(&self, ctx: &mut RunContext) {
        if !self.config.cleanup.enabled {
            return;
        }
        let cleanup = self.config.cleanup.config;
        if ctx.memory.usage_fraction() <= cleanup.trigger {
            return;
        }
        let report = ctx.cleanup_memory(cleanup.target);
        if !report.evicted.is_empty() {
            self.events.on_event(&OrchestraEvent::Eviction {
                evicted: &report.evicted,
                freed: report.freed,
            });
        }
    }

    fn checkpoint(&self, ctx: &RunContext, request: &OrchestrationRequest, plan: &ExecutionPlan) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        let checkpoint = RunCheckpoint {
            run_id: ctx.run_id.clone(),
            request: request.clone(),
            plan: plan.clone(),
            completed: ctx.completed.clone(),
            results: ctx.memory.results(),
            saved_at: Utc::now(),
        };
        match store.save(&checkpoint) {
            Ok(path) => self.events.on_event(&OrchestraEvent::CheckpointSaved {
                run_id: &ctx.run_id,
                path: &path.display().to_string(),
            }),
            Err(e) => warn!("[{}] Failed to save checkpoint: {e}", ctx.run_id),
        }
    }

    fn transition(&self, state: &mut RunState, to: RunState) {
        if *state != to {
            self.events.on_event(&OrchestraEvent::StateChanged { from: *state, to });
            *state = to;
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FnAgent;
    use crate::error::ErrorKind;
    use crate::events::EventObserver;
    use crate::modules::{InMemorySource, SourceModule, Variant};
    use crate::orchestrator::classify::PhaseTemplate;
    use crate::phase::{AgentSpec, PhaseDefinition, PhaseKind};
    use serde_json::json;
    use std::sync::Mutex;

    const MODULES: &[(&str, u64)] = &[
        ("product/requirements-analyst", 3_000),
        ("database/schema-architect", 4_000),
        ("database/migration-planner", 2_000),
        ("backend/api-designer", 3_000),
        ("backend/service-builder", 5_000),
        ("backend/query-optimizer", 2_000),
    ];

    fn source(modules: &[(&str, u64)]) -> Arc<dyn ModuleSource> {
        let mut source = InMemorySource::new();
        for (id, size) in modules {
            source.insert(SourceModule::new(*id, format!("# {id}\nInstructions.")).with_size(*size));
        }
        Arc::new(source)
    }

    fn orchestrator(config: OrchestraConfig, modules: &[(&str, u64)]) -> Orchestrator {
        Orchestrator::new(config.with_preload(false), source(modules)).unwrap()
    }

    #[tokio::test]
    async fn core_pipeline_runs_in_order() {
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        let orch = orchestrator(OrchestraConfig::default(), MODULES).with_event_handler(EventObserver::new(
            move |e| {
                if let OrchestraEvent::StateChanged { to, .. } = e {
                    seen.lock().unwrap().push(to.to_string());
                }
            },
        ));
        let out = orch
            .execute_request(&OrchestrationRequest::new("inventory service"))
            .await;
        assert!(out.success, "{:?}", out.error);
        assert!(!out.partial);
        assert_eq!(out.completed_phases, vec!["requirements", "schema", "api", "backend"]);
        assert_eq!(out.phases_completed, 4);
        assert!(out.sections.contains_key("database"));
        assert!(out.budget_used > 0);
        assert_eq!(
            *states.lock().unwrap(),
            vec!["executing(0)", "executing(1)", "executing(2)", "executing(3)", "assembling", "done"]
        );
    }

    #[tokio::test]
    async fn failed_retry_escalates() {
        // Ceiling 9_000 and two required 5_000-unit agents: narrowing cannot
        // drop either, so the single retry fails too.
        let modules = [("backend/service-builder", 5_000), ("backend/query-optimizer", 5_000)];
        let recoveries = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&recoveries);
        let classifier = RequestClassifier::new().with_template(
            PhaseTemplate::new("backend", PhaseKind::Backend, 1_000)
                .with_parallel(true)
                .with_agent(AgentSpec::required("backend/service-builder"))
                .with_agent(AgentSpec::required("backend/query-optimizer")),
        );
        let orch = orchestrator(OrchestraConfig::default().with_capacity(10_000), &modules)
            .with_classifier(classifier)
            .with_event_handler(EventObserver::new(move |e| {
                if let OrchestraEvent::Recovery { phase_id, .. } = e {
                    seen.lock().unwrap().push(phase_id.to_string());
                }
            }));

        let out = orch.execute_request(&OrchestrationRequest::new("x")).await;
        assert!(!out.success);
        assert!(out.partial);
        assert_eq!(out.error_kind(), Some(ErrorKind::BudgetExceeded));
        assert_eq!(*recoveries.lock().unwrap(), vec!["backend"]);
        assert_eq!(out.loader.resident, 0);
    }

    #[tokio::test]
    async fn narrowing_demotes_detail_and_succeeds() {
        let mut source = InMemorySource::new();
        source.insert(SourceModule::new("backend/service-builder", "# Builder").with_size(5_000));
        source.insert(
            SourceModule::new("documentation/technical-writer", "# Writer")
                .with_detail("Long style guide.")
                .with_size(1_000)
                .with_detail_size(6_000),
        );
        let phase = PhaseDefinition::new("backend", PhaseKind::Backend)
            .with_agent(AgentSpec::required("backend/service-builder"))
            .with_agent(AgentSpec::required("documentation/technical-writer").with_variant(Variant::Detail));
        let plan = ExecutionPlan::from_phases(vec![phase]).unwrap();

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&attempts);
        let orch = Orchestrator::new(
            OrchestraConfig::default().with_capacity(10_000).with_preload(false),
            Arc::new(source),
        )
        .unwrap()
        .with_event_handler(EventObserver::new(move |e| {
            if let OrchestraEvent::PhaseStarted { attempt, .. } = e {
                seen.lock().unwrap().push(*attempt);
            }
        }));

        let out = orch.execute_plan(plan, &OrchestrationRequest::new("x")).await;
        assert!(out.success, "{:?}", out.error);
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
        assert_eq!(out.budget_used, 6_000);
    }

    #[tokio::test]
    async fn required_agent_failure_returns_partial_output() {
        let registry = AgentRegistry::new().with_agent(FnAgent::new("backend/api-designer", |_| {
            Err("model refused".into())
        }));
        let orch = orchestrator(OrchestraConfig::default(), MODULES).with_registry(registry);
        let out = orch
            .execute_request(&OrchestrationRequest::new("inventory service"))
            .await;
        assert!(!out.success);
        assert!(out.partial);
        assert_eq!(out.completed_phases, vec!["requirements", "schema"]);
        assert_eq!(out.error_kind(), Some(ErrorKind::AgentFailure));
        assert!(out.sections.contains_key("database"));
        assert!(!out.sections.contains_key("backend"));
    }

    #[tokio::test]
    async fn checkpoint_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestraConfig::default().with_checkpoint_dir(dir.path());
        let failing = AgentRegistry::new().with_agent(FnAgent::new("backend/service-builder", |_| {
            Err("transient".into())
        }));
        let orch = orchestrator(config.clone(), MODULES).with_registry(failing);
        let first = orch
            .execute_request(&OrchestrationRequest::new("inventory service"))
            .await;
        assert!(!first.success);
        assert_eq!(first.completed_phases.len(), 3);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let healthy = AgentRegistry::new().with_agent(FnAgent::new("backend/service-builder", move |input| {
            seen.lock().unwrap().push(input.phase_id.clone());
            Ok(json!({ "summary": "services" }))
        }));
        let orch = orchestrator(config, MODULES).with_registry(healthy);
        let resumed = orch.resume(&first.run_id).await.unwrap();
        assert!(resumed.success, "{:?}", resumed.error);
        assert_eq!(resumed.run_id, first.run_id);
        assert_eq!(resumed.completed_phases, vec!["requirements", "schema", "api", "backend"]);
        assert_eq!(*calls.lock().unwrap(), vec!["backend"]);
    }

    #[tokio::test]
    async fn resume_without_checkpoints_is_config_error() {
        let orch = orchestrator(OrchestraConfig::default(), MODULES);
        assert!(matches!(orch.resume("run-x").await, Err(OrchestraError::Config(_))));
    }

    #[test]
    fn plan_over_capacity_is_rejected() {
        let orch = orchestrator(OrchestraConfig::default().with_capacity(1_000), MODULES);
        let err = orch
            .create_execution_plan(&OrchestrationRequest::new("inventory service"))
            .unwrap_err();
        assert!(matches!(err, OrchestraError::PlanInvalid(_)));
    }

    #[tokio::test]
    async fn overflowing_caller_plan_is_rejected() {
        let plan = ExecutionPlan {
            phases: vec![
                PhaseDefinition::new("a", PhaseKind::Other).with_budget(u64::MAX),
                PhaseDefinition::new("b", PhaseKind::Other).with_budget(1),
            ],
            total_budget: 0,
            created_at: Utc::now(),
        };
        let orch = orchestrator(OrchestraConfig::default(), MODULES);
        let out = orch.execute_plan(plan, &OrchestrationRequest::new("x")).await;
        assert!(!out.success);
        assert!(!out.partial);
        assert_eq!(out.error_kind(), Some(ErrorKind::PlanInvalid));
        assert_eq!(out.loader.load_calls, 0);
    }

    #[test]
    fn run_state_display() {
        assert_eq!(RunState::Executing(2).to_string(), "executing(2)");
        assert_eq!(RunState::Recovery(0).to_string(), "recovery(0)");
    }
}
