//! Single-phase execution.
//!
//! [`PhaseExecutor::run`] takes one phase from dependency check to committed
//! result:
//!
//! 1. every declared dependency must already have a stored result
//! 2. the phase's required context is resolved from the memory store
//! 3. under the phase timeout, each agent's module is loaded and handed to
//!    a fresh agent, then agents run in parallel (bounded fan-out) or in
//!    sequence with earlier outputs passed forward
//! 4. every loaded module is released, whatever the outcome
//! 5. the merged output is compressed into the memory store
//!
//! An agent is optional when its [`AgentSpec`] says so or its module is
//! tagged `optional`. Optional agents that fail to load or run are dropped
//! with an [`AgentDropped`](crate::events::OrchestraEvent::AgentDropped)
//! event. Any required failure fails the phase.

use crate::agent::{Agent, AgentInput};
use crate::error::{OrchestraError, Result};
use crate::events::{EventHandler, OrchestraEvent};
use crate::memory::RawPhaseResult;
use crate::modules::ModuleKey;
use crate::phase::context::RunContext;
use crate::phase::definition::{AgentSpec, PhaseDefinition};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What a committed phase produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseOutcome {
    pub phase_id: String,
    /// Output keys of agents that contributed, sorted.
    pub agents: Vec<String>,
    /// Optional agents dropped along the way.
    pub dropped: Vec<String>,
    /// Compressed size stored in the memory store.
    pub result_size: u64,
    /// Stored results evicted to make room for this one.
    pub evicted: Vec<String>,
    pub elapsed_ms: u64,
}

/// An agent ready to run, with its output key.
struct Prepared {
    key: String,
    module: String,
    optional: bool,
    agent: Box<dyn Agent>,
}

/// Runs phases against a [`RunContext`].
pub struct PhaseExecutor {
    fan_out: usize,
    events: Arc<dyn EventHandler>,
}

impl PhaseExecutor {
    pub fn new(fan_out: usize, events: Arc<dyn EventHandler>) -> Self {
        Self {
            fan_out: fan_out.max(1),
            events,
        }
    }

    pub fn fan_out(&self) -> usize {
        self.fan_out
    }

    /// Execute `phase` and commit its result.
    ///
    /// On failure nothing is stored, the phase is not marked executed, and
    /// all modules loaded for it have been released.
    pub async fn run(&self, ctx: &mut RunContext, phase: &PhaseDefinition) -> Result<PhaseOutcome> {
        let started = Instant::now();

        for dep in &phase.deps {
            if !ctx.memory.has_result(dep) {
                return Err(OrchestraError::dependency_missing(&phase.id, dep));
            }
        }

        let mut required = ctx.graph.required_context(&phase.id);
        required.extend(phase.deps.iter().cloned());
        let context = ctx.memory.get_phase_context(&phase.id, &required)?;

        let input = AgentInput {
            phase_id: phase.id.clone(),
            request: ctx.request.clone(),
            context,
            prior: BTreeMap::new(),
        };

        let mut dropped = Vec::new();
        let mut loaded: Vec<ModuleKey> = Vec::new();
        // Loading counts against the timeout too. Keys pushed to `loaded`
        // survive a timeout so they can be released below.
        let shared: &RunContext = ctx;
        let execution = async {
            let prepared = self.prepare_agents(shared, phase, &mut loaded, &mut dropped)?;
            if phase.parallel {
                self.run_parallel(&phase.id, &prepared, &input, &mut dropped).await
            } else {
                self.run_sequential(&phase.id, &prepared, input.clone(), &mut dropped)
                    .await
            }
        };
        let outcome = tokio::time::timeout(phase.timeout(), execution).await;
        release_all(ctx, &loaded);

        let merged = match outcome {
            Ok(Ok(merged)) => merged,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(OrchestraError::Timeout {
                    phase: phase.id.clone(),
                    timeout_ms: phase.timeout_ms,
                });
            }
        };

        let agents: Vec<String> = merged.keys().cloned().collect();
        let payload = Value::Object(merged.into_iter().collect::<Map<String, Value>>());
        let stored = ctx.store_result(RawPhaseResult {
            phase_id: phase.id.clone(),
            kind: phase.kind,
            payload,
        })?;
        if !stored.evicted.is_empty() {
            self.events.on_event(&OrchestraEvent::Eviction {
                evicted: &stored.evicted,
                freed: stored.freed,
            });
        }
        ctx.mark_executed(&phase.id);

        Ok(PhaseOutcome {
            phase_id: phase.id.clone(),
            agents,
            dropped,
            result_size: stored.size,
            evicted: stored.evicted,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Load every agent's module and hand it to a fresh agent.
    ///
    /// Keys of successfully loaded modules are pushed to `loaded` even when
    /// this returns an error, so the caller can release them.
    fn prepare_agents(
        &self,
        ctx: &RunContext,
        phase: &PhaseDefinition,
        loaded: &mut Vec<ModuleKey>,
        dropped: &mut Vec<String>,
    ) -> Result<Vec<Prepared>> {
        let keys = output_keys(&phase.agents);
        let mut prepared = Vec::with_capacity(phase.agents.len());

        for (spec, out_key) in phase.agents.iter().zip(keys) {
            let optional = spec.optional || ctx.loader.load_summary(&spec.module).optional;
            let key = spec.key();
            let module = match ctx.loader.load(&key) {
                Ok(m) => m,
                Err(e) if optional => {
                    self.drop_agent(&phase.id, &out_key, &e.to_string(), dropped);
                    continue;
                }
                Err(e) => return Err(e),
            };
            loaded.push(key.clone());
            self.events.on_event(&OrchestraEvent::ModuleLoaded {
                phase_id: &phase.id,
                module: &key,
                size: module.size,
            });

            let mut agent = ctx.registry.create(&spec.module);
            if let Err(message) = agent.load(&module) {
                if optional {
                    self.drop_agent(&phase.id, &out_key, &message, dropped);
                    continue;
                }
                return Err(OrchestraError::agent_failed(&spec.module, message));
            }
            prepared.push(Prepared {
                key: out_key,
                module: spec.module.clone(),
                optional,
                agent,
            });
        }
        Ok(prepared)
    }

    /// Run agents concurrently, at most `fan_out` at a time.
    ///
    /// The first required failure cancels the agents still running.
    async fn run_parallel(
        &self,
        phase_id: &str,
        prepared: &[Prepared],
        input: &AgentInput,
        dropped: &mut Vec<String>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut results = futures::stream::iter(prepared.iter())
            .map(|p| async move { (p, p.agent.execute(input).await) })
            .buffer_unordered(self.fan_out);

        let mut merged = BTreeMap::new();
        while let Some((p, result)) = results.next().await {
            match result {
                Ok(value) => {
                    merged.insert(p.key.clone(), value);
                }
                Err(message) if p.optional => {
                    self.drop_agent(phase_id, &p.key, &message, dropped);
                }
                Err(message) => return Err(OrchestraError::agent_failed(&p.module, message)),
            }
        }
        Ok(merged)
    }

    /// Run agents in declaration order, each seeing earlier outputs.
    async fn run_sequential(
        &self,
        phase_id: &str,
        prepared: &[Prepared],
        mut input: AgentInput,
        dropped: &mut Vec<String>,
    ) -> Result<BTreeMap<String, Value>> {
        let mut merged = BTreeMap::new();
        for p in prepared {
            match p.agent.execute(&input).await {
                Ok(value) => {
                    input.prior.insert(p.key.clone(), value.clone());
                    merged.insert(p.key.clone(), value);
                }
                Err(message) if p.optional => {
                    self.drop_agent(phase_id, &p.key, &message, dropped);
                }
                Err(message) => return Err(OrchestraError::agent_failed(&p.module, message)),
            }
        }
        Ok(merged)
    }

    fn drop_agent(&self, phase_id: &str, agent: &str, reason: &str, dropped: &mut Vec<String>) {
        debug!("{phase_id}: dropping optional agent {agent}: {reason}");
        self.events.on_event(&OrchestraEvent::AgentDropped {
            phase_id,
            agent,
            reason,
        });
        dropped.push(agent.to_string());
    }
}

impl std::fmt::Debug for PhaseExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseExecutor")
            .field("fan_out", &self.fan_out)
            .finish_non_exhaustive()
    }
}

fn release_all(ctx: &RunContext, loaded: &[ModuleKey]) {
    for key in loaded {
        ctx.loader.release(key);
    }
    if !ctx.tracker.snapshot().is_consistent() {
        warn!("Budget tracker inconsistent after releasing phase modules");
    }
}

/// Output key per agent: the module id, suffixed with its position when a
/// phase lists the same module more than once.
fn output_keys(agents: &[AgentSpec]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for a in agents {
        *counts.entry(a.module.as_str()).or_default() += 1;
    }
    agents
        .iter()
        .enumerate()
        .map(|(i, a)| {
            if counts[a.module.as_str()] > 1 {
                format!("{}#{i}", a.module)
            } else {
                a.module.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRegistry, FnAgent};
    use crate::budget::ResourceTracker;
    use crate::events::{EventObserver, NoopHandler};
    use crate::graph::DependencyGraph;
    use crate::memory::MemoryStore;
    use crate::modules::{InMemorySource, ModuleLoader, SourceModule};
    use crate::phase::definition::PhaseKind;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn context(capacity: u64, modules: &[(&str, u64)], registry: AgentRegistry) -> RunContext {
        let mut source = InMemorySource::new();
        for (id, size) in modules {
            source.insert(SourceModule::new(*id, format!("# {id}")).with_size(*size));
        }
        let loader = ModuleLoader::new(Arc::new(source), Arc::new(ResourceTracker::new(capacity)));
        RunContext::new(
            "run-test",
            "build an admin panel",
            Arc::new(loader),
            Arc::new(registry),
            MemoryStore::new(10_000),
            DependencyGraph::new(),
        )
    }

    fn executor() -> PhaseExecutor {
        PhaseExecutor::new(4, Arc::new(NoopHandler))
    }

    #[tokio::test]
    async fn sequential_agents_see_prior_outputs() {
        let registry = AgentRegistry::new()
            .with_agent(FnAgent::new("a", |_| Ok(json!({"summary": "first"}))))
            .with_agent(FnAgent::new("b", |input| {
                Ok(json!({"summary": format!("saw {}", input.prior.len())}))
            }));
        let mut ctx = context(1000, &[("a", 100), ("b", 100)], registry);
        let phase = PhaseDefinition::new("api", PhaseKind::Api)
            .with_agent(AgentSpec::required("a"))
            .with_agent(AgentSpec::required("b"));

        let outcome = executor().run(&mut ctx, &phase).await.unwrap();
        assert_eq!(outcome.agents, vec!["a", "b"]);
        let stored = &ctx.memory.get("api").unwrap().compressed_payload;
        assert_eq!(stored["b"]["summary"], "saw 1");
        assert!(ctx.is_executed("api"));
        assert_eq!(ctx.tracker.used(), 0, "modules released after the phase");
    }

    #[tokio::test]
    async fn missing_dependency_fails_before_loading() {
        let mut ctx = context(1000, &[("a", 100)], AgentRegistry::new());
        let phase = PhaseDefinition::new("api", PhaseKind::Api)
            .with_dep("schema")
            .with_agent(AgentSpec::required("a"));
        let err = executor().run(&mut ctx, &phase).await.unwrap_err();
        assert!(matches!(err, OrchestraError::DependencyMissing { .. }));
        assert_eq!(ctx.loader.stats().load_calls, 0);
        assert!(!ctx.is_executed("api"));
    }

    #[tokio::test]
    async fn optional_agent_failures_are_dropped() {
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&dropped);
        let events = EventObserver::new(move |e| {
            if let OrchestraEvent::AgentDropped { agent, .. } = e {
                seen.lock().unwrap().push(agent.to_string());
            }
        });
        let registry = AgentRegistry::new()
            .with_agent(FnAgent::new("ok", |_| Ok(json!({"summary": "fine"}))))
            .with_agent(FnAgent::new("flaky", |_| Err("boom".into())));
        let mut ctx = context(1000, &[("ok", 100), ("flaky", 100)], registry);
        let phase = PhaseDefinition::new("backend", PhaseKind::Backend)
            .with_parallel(true)
            .with_agent(AgentSpec::required("ok"))
            .with_agent(AgentSpec::optional("flaky"))
            .with_agent(AgentSpec::optional("ghost"));

        let outcome = PhaseExecutor::new(2, Arc::new(events))
            .run(&mut ctx, &phase)
            .await
            .unwrap();
        assert_eq!(outcome.agents, vec!["ok"]);
        let mut dropped = dropped.lock().unwrap().clone();
        dropped.sort();
        assert_eq!(dropped, vec!["flaky", "ghost"]);
        assert_eq!(ctx.tracker.used(), 0);
    }

    #[tokio::test]
    async fn required_load_failure_releases_earlier_loads() {
        let mut ctx = context(1000, &[("a", 300), ("b", 800)], AgentRegistry::new());
        let phase = PhaseDefinition::new("schema", PhaseKind::Schema)
            .with_agent(AgentSpec::required("a"))
            .with_agent(AgentSpec::required("b"));
        let err = executor().run(&mut ctx, &phase).await.unwrap_err();
        assert!(err.is_budget_pressure());
        assert_eq!(ctx.tracker.used(), 0);
        assert!(!ctx.memory.has_result("schema"));
    }

    #[tokio::test]
    async fn required_agent_error_fails_phase() {
        let registry = AgentRegistry::new().with_agent(FnAgent::new("bad", |_| Err("no".into())));
        let mut ctx = context(1000, &[("bad", 10)], registry);
        let phase = PhaseDefinition::new("api", PhaseKind::Api)
            .with_parallel(true)
            .with_agent(AgentSpec::required("bad"));
        let err = executor().run(&mut ctx, &phase).await.unwrap_err();
        assert!(matches!(err, OrchestraError::AgentFailure { ref agent, .. } if agent == "bad"));
        assert_eq!(ctx.tracker.used(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_phase_times_out_and_releases() {
        let registry = AgentRegistry::new().with_agent(
            FnAgent::new("slow", |_| Ok(json!({}))).with_delay(Duration::from_millis(6_000)),
        );
        let mut ctx = context(1000, &[("slow", 100)], registry);
        let phase = PhaseDefinition::new("backend", PhaseKind::Backend)
            .with_timeout_ms(5_000)
            .with_agent(AgentSpec::required("slow"));
        let err = executor().run(&mut ctx, &phase).await.unwrap_err();
        assert!(matches!(err, OrchestraError::Timeout { timeout_ms: 5_000, .. }));
        assert_eq!(ctx.tracker.used(), 0);
        assert!(!ctx.is_executed("backend"));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_merge_is_independent_of_completion_order() {
        let registry = AgentRegistry::new()
            .with_agent(
                FnAgent::new("z", |_| Ok(json!({"summary": "z"}))).with_delay(Duration::from_millis(10)),
            )
            .with_agent(
                FnAgent::new("a", |_| Ok(json!({"summary": "a"}))).with_delay(Duration::from_millis(50)),
            );
        let phase = PhaseDefinition::new("frontend", PhaseKind::Frontend)
            .with_parallel(true)
            .with_agent(AgentSpec::required("z"))
            .with_agent(AgentSpec::required("a"));

        let mut ctx = context(1000, &[("a", 10), ("z", 10)], registry);
        executor().run(&mut ctx, &phase).await.unwrap();
        let first = ctx.memory.get("frontend").unwrap().compressed_payload.clone();

        let mut reversed = phase.clone();
        reversed.agents.reverse();
        ctx.memory.remove("frontend");
        executor().run(&mut ctx, &reversed).await.unwrap();
        assert_eq!(ctx.memory.get("frontend").unwrap().compressed_payload, first);
    }

    #[tokio::test]
    async fn tagged_module_failure_is_dropped() {
        let mut source = InMemorySource::new();
        source.insert(SourceModule::new("ok", "# ok").with_size(10));
        source.insert(SourceModule::new("flaky", "# flaky").with_size(10).with_optional(true));
        source.insert(SourceModule::new("huge", "# huge").with_size(5_000).with_optional(true));
        let loader = ModuleLoader::new(Arc::new(source), Arc::new(ResourceTracker::new(1000)));
        let registry = AgentRegistry::new()
            .with_agent(FnAgent::new("ok", |_| Ok(json!({"summary": "fine"}))))
            .with_agent(FnAgent::new("flaky", |_| Err("boom".into())));
        let mut ctx = RunContext::new(
            "run-test",
            "request",
            Arc::new(loader),
            Arc::new(registry),
            MemoryStore::new(10_000),
            DependencyGraph::new(),
        );
        // Listed as required; the module tags decide.
        let phase = PhaseDefinition::new("frontend", PhaseKind::Frontend)
            .with_agent(AgentSpec::required("ok"))
            .with_agent(AgentSpec::required("flaky"))
            .with_agent(AgentSpec::required("huge"));

        let outcome = executor().run(&mut ctx, &phase).await.unwrap();
        assert_eq!(outcome.agents, vec!["ok"]);
        // "huge" is dropped while loading, "flaky" when it runs.
        assert_eq!(outcome.dropped, vec!["huge", "flaky"]);
        assert!(ctx.memory.has_result("frontend"));
        assert_eq!(ctx.tracker.used(), 0);
    }

    /// Source whose reads block the thread, like a slow disk.
    struct SlowSource {
        inner: InMemorySource,
        delay: Duration,
    }

    impl crate::modules::ModuleSource for SlowSource {
        fn read(&self, key: &ModuleKey) -> Result<String> {
            std::thread::sleep(self.delay);
            self.inner.read(key)
        }

        fn size_of(&self, key: &ModuleKey) -> Result<u64> {
            self.inner.size_of(key)
        }

        fn descriptor(&self, key: &ModuleKey) -> Result<crate::modules::ModuleDescriptor> {
            self.inner.descriptor(key)
        }
    }

    #[tokio::test]
    async fn slow_loading_counts_against_timeout() {
        let source = SlowSource {
            inner: InMemorySource::new().with_module(SourceModule::new("a", "# a").with_size(10)),
            delay: Duration::from_millis(150),
        };
        let loader = ModuleLoader::new(Arc::new(source), Arc::new(ResourceTracker::new(1000)));
        let registry = AgentRegistry::new()
            .with_agent(FnAgent::new("a", |_| Ok(json!({}))).with_delay(Duration::from_millis(10)));
        let mut ctx = RunContext::new(
            "run-test",
            "request",
            Arc::new(loader),
            Arc::new(registry),
            MemoryStore::new(10_000),
            DependencyGraph::new(),
        );
        let phase = PhaseDefinition::new("api", PhaseKind::Api)
            .with_timeout_ms(50)
            .with_agent(AgentSpec::required("a"));

        let err = executor().run(&mut ctx, &phase).await.unwrap_err();
        assert!(matches!(err, OrchestraError::Timeout { timeout_ms: 50, .. }));
        assert_eq!(ctx.tracker.used(), 0, "module loaded before the deadline is released");
        assert!(!ctx.memory.has_result("api"));
    }

    #[test]
    fn duplicate_modules_get_positional_keys() {
        let agents = vec![
            AgentSpec::required("x"),
            AgentSpec::required("y"),
            AgentSpec::optional("x"),
        ];
        assert_eq!(output_keys(&agents), vec!["x#0", "y", "x#2"]);
    }
}
