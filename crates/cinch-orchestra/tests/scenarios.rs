//! End-to-end scenarios through the public API.
//!
//! Timing tests run on a paused tokio clock, so simulated agent latency
//! costs no wall time.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cinch_orchestra::modules::ModuleDescriptor;
use cinch_orchestra::prelude::*;
use serde_json::json;

/// Module source that counts every content read.
struct CountingSource {
    inner: InMemorySource,
    reads: Arc<AtomicUsize>,
}

impl ModuleSource for CountingSource {
    fn read(&self, key: &ModuleKey) -> Result<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(key)
    }

    fn size_of(&self, key: &ModuleKey) -> Result<u64> {
        self.inner.size_of(key)
    }

    fn descriptor(&self, key: &ModuleKey) -> Result<ModuleDescriptor> {
        self.inner.descriptor(key)
    }
}

fn source(modules: &[(&str, u64)]) -> InMemorySource {
    let mut source = InMemorySource::new();
    for (id, size) in modules {
        source.insert(SourceModule::new(*id, format!("# {id}\nInstructions for {id}.")).with_size(*size));
    }
    source
}

fn config() -> OrchestraConfig {
    OrchestraConfig::default().with_preload(false)
}

// ── Scenario A: margin-capped admission ─────────────────────────────

#[test]
fn scenario_a_budget_ceiling() {
    let tracker = ResourceTracker::new(1000);
    assert_eq!(tracker.ceiling(), 900);
    tracker.add("A", 400).unwrap();
    assert_eq!(tracker.used(), 400);
    tracker.add("B", 400).unwrap();
    assert_eq!(tracker.used(), 800);

    let err = tracker.add("C", 200).unwrap_err();
    assert!(matches!(err, OrchestraError::BudgetExceeded { requested: 200, used: 800, ceiling: 900, .. }));
    assert_eq!(tracker.used(), 800);
    assert!(tracker.snapshot().is_consistent());
}

// ── Scenario B: missing dependency ──────────────────────────────────

#[tokio::test]
async fn scenario_b_dependency_missing() {
    let loader = ModuleLoader::new(
        Arc::new(source(&[("team/p1-agent", 10), ("team/p2-agent", 10)])),
        Arc::new(ResourceTracker::new(1000)),
    );
    let mut graph = DependencyGraph::new();
    graph.add_phase("p1", Vec::<String>::new()).unwrap();
    graph.add_phase("p2", ["p1"]).unwrap();
    let mut ctx = RunContext::new(
        "run-b",
        "request",
        Arc::new(loader),
        Arc::new(AgentRegistry::new()),
        MemoryStore::new(10_000),
        graph,
    );

    let p2 = PhaseDefinition::new("p2", PhaseKind::Other)
        .with_dep("p1")
        .with_agent(AgentSpec::required("team/p2-agent"));
    let executor = PhaseExecutor::new(4, Arc::new(NoopHandler));
    let err = executor.run(&mut ctx, &p2).await.unwrap_err();

    assert!(matches!(
        err,
        OrchestraError::DependencyMissing { ref phase, ref dependency } if phase == "p2" && dependency == "p1"
    ));
    assert_eq!(err.kind(), ErrorKind::DependencyMissing);
    assert!(!ctx.memory.has_result("p2"));
}

// ── Scenario C: largest-first reclaim ───────────────────────────────

#[test]
fn scenario_c_emergency_reclaim() {
    let tracker = ResourceTracker::new(10_000);
    for (id, size) in [("w", 150), ("x", 100), ("y", 80), ("z", 50)] {
        tracker.add(id, size).unwrap();
    }
    let evicted = tracker.emergency_reclaim(300);
    assert_eq!(evicted, vec!["w", "x", "y"]);
    assert_eq!(tracker.used(), 50);
    assert_eq!(tracker.item_size("z"), Some(50));
    assert!(tracker.snapshot().is_consistent());
}

// ── Scenario D: phase timeout ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn scenario_d_timeout_commits_nothing() {
    let registry = AgentRegistry::new().with_agent(
        FnAgent::new("backend/service-builder", |_| Ok(json!({"summary": "late"})))
            .with_delay(Duration::from_millis(6_000)),
    );
    let phase = PhaseDefinition::new("backend", PhaseKind::Backend)
        .with_timeout_ms(5_000)
        .with_agent(AgentSpec::required("backend/service-builder"));
    let plan = ExecutionPlan::from_phases(vec![phase]).unwrap();

    let orchestrator = Orchestrator::new(config(), Arc::new(source(&[("backend/service-builder", 100)])))
        .unwrap()
        .with_registry(registry);
    let out = orchestrator.execute_plan(plan, &OrchestrationRequest::new("x")).await;

    assert!(!out.success);
    assert!(out.partial);
    assert_eq!(out.error_kind(), Some(ErrorKind::Timeout));
    assert!(out.completed_phases.is_empty());
    assert!(out.sections.is_empty(), "no result stored for the timed-out phase");
    assert_eq!(out.loader.resident, 0);
}

// ── Scenario E: plan rejected before loading ────────────────────────

#[tokio::test]
async fn scenario_e_plan_invalid_loads_nothing() {
    let reads = Arc::new(AtomicUsize::new(0));
    let source = CountingSource {
        inner: source(&[("product/requirements-analyst", 10)]),
        reads: Arc::clone(&reads),
    };
    // The admin-builder plan for this request totals 54_000 units.
    let orchestrator = Orchestrator::new(config().with_capacity(1_000), Arc::new(source)).unwrap();
    let request = OrchestrationRequest::new("inventory service");

    let err = orchestrator.create_execution_plan(&request).unwrap_err();
    assert!(matches!(err, OrchestraError::PlanInvalid(_)));

    let out = orchestrator.execute_request(&request).await;
    assert!(!out.success);
    assert!(!out.partial);
    assert_eq!(out.error_kind(), Some(ErrorKind::PlanInvalid));
    assert_eq!(out.loader.load_calls, 0);
    assert_eq!(reads.load(Ordering::SeqCst), 0);
}

// ── Ordering ────────────────────────────────────────────────────────

#[tokio::test]
async fn out_of_order_plan_runs_in_dependency_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut registry = AgentRegistry::new();
    for id in ["team/a", "team/b", "team/c"] {
        let order = Arc::clone(&order);
        registry.register(id, move || -> Box<dyn Agent> {
            let order = Arc::clone(&order);
            Box::new(FnAgent::new(id, move |input| {
                order.lock().unwrap().push(input.phase_id.clone());
                let seen: Vec<&String> = input.context.direct.keys().collect();
                Ok(json!({ "summary": input.phase_id, "inputs": seen }))
            }))
        });
    }

    let phases = vec![
        PhaseDefinition::new("c", PhaseKind::Other)
            .with_dep("b")
            .with_agent(AgentSpec::required("team/c")),
        PhaseDefinition::new("b", PhaseKind::Other)
            .with_dep("a")
            .with_agent(AgentSpec::required("team/b")),
        PhaseDefinition::new("a", PhaseKind::Other).with_agent(AgentSpec::required("team/a")),
    ];
    let plan = ExecutionPlan {
        phases,
        total_budget: 0,
        created_at: chrono::Utc::now(),
    };

    let orchestrator = Orchestrator::new(config(), Arc::new(source(&[("team/a", 10), ("team/b", 10), ("team/c", 10)])))
        .unwrap()
        .with_registry(registry);
    let out = orchestrator.execute_plan(plan, &OrchestrationRequest::new("x")).await;

    assert!(out.success, "{:?}", out.error);
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    assert_eq!(out.completed_phases, vec!["a", "b", "c"]);
    assert_eq!(out.sections["other"]["c"]["team/c"]["inputs"], json!(["b"]));
}

#[test]
fn cyclic_plan_is_rejected() {
    let phases = vec![
        PhaseDefinition::new("a", PhaseKind::Other).with_dep("b"),
        PhaseDefinition::new("b", PhaseKind::Other).with_dep("a"),
    ];
    assert!(matches!(
        ExecutionPlan::from_phases(phases),
        Err(OrchestraError::CyclicDependency { .. })
    ));
}

// ── Merge determinism ───────────────────────────────────────────────

async fn run_with_delays(fast: u64, slow: u64) -> serde_json::Value {
    let registry = AgentRegistry::new()
        .with_agent(
            FnAgent::new("frontend/admin-ui-builder", |_| Ok(json!({"summary": "pages"})))
                .with_delay(Duration::from_millis(fast)),
        )
        .with_agent(
            FnAgent::new("frontend/component-designer", |_| Ok(json!({"summary": "components"})))
                .with_delay(Duration::from_millis(slow)),
        );
    let phase = PhaseDefinition::new("frontend", PhaseKind::Frontend)
        .with_parallel(true)
        .with_agent(AgentSpec::required("frontend/admin-ui-builder"))
        .with_agent(AgentSpec::required("frontend/component-designer"));
    let plan = ExecutionPlan::from_phases(vec![phase]).unwrap();
    let modules = [("frontend/admin-ui-builder", 10), ("frontend/component-designer", 10)];

    let orchestrator = Orchestrator::new(config(), Arc::new(source(&modules)))
        .unwrap()
        .with_registry(registry);
    let out = orchestrator.execute_plan(plan, &OrchestrationRequest::new("x")).await;
    assert!(out.success, "{:?}", out.error);
    serde_json::to_value(&out.sections).unwrap()
}

#[tokio::test(start_paused = true)]
async fn parallel_merge_ignores_completion_order() {
    let first = run_with_delays(10, 500).await;
    let second = run_with_delays(500, 10).await;
    assert_eq!(first, second);
    assert_eq!(first["frontend"]["frontend"]["frontend/component-designer"]["summary"], "components");
}

// ── Full run over a module directory ────────────────────────────────

#[tokio::test]
async fn directory_modules_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let agents = [
        ("product", "requirements-analyst"),
        ("database", "schema-architect"),
        ("database", "migration-planner"),
        ("backend", "api-designer"),
        ("backend", "service-builder"),
        ("backend", "query-optimizer"),
        ("security", "auth-specialist"),
    ];
    for (team, agent) in agents {
        std::fs::create_dir_all(dir.path().join(team)).unwrap();
        std::fs::write(
            dir.path().join(team).join(format!("{agent}.md")),
            format!("---\ndescription: {agent} for {team}\n---\n# {agent}\nCore steps.\n## Detail\nReference."),
        )
        .unwrap();
    }

    let checkpoints = dir.path().join("runs");
    let orchestrator = Orchestrator::new(
        config().with_checkpoint_dir(&checkpoints),
        Arc::new(DirectorySource::new(dir.path())),
    )
    .unwrap();
    let out = orchestrator
        .execute_request(&OrchestrationRequest::new("customer portal").with_feature("login auth"))
        .await;

    assert!(out.success, "{:?}", out.error);
    let completed: BTreeSet<&str> = out.completed_phases.iter().map(String::as_str).collect();
    assert_eq!(
        completed,
        BTreeSet::from(["requirements", "schema", "api", "backend", "security"])
    );
    assert!(out.sections.contains_key("security"));
    assert_eq!(out.loader.resident, 0);
    assert!(out.budget_used > 0);

    let saved = CheckpointStore::new(&checkpoints).unwrap();
    assert_eq!(saved.list().unwrap(), vec![out.run_id.clone()]);
}
