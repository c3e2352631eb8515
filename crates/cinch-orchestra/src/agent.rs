//! Agent abstraction.
//!
//! An [`Agent`] is the executable side of an agent module. The engine never
//! interprets module content itself; it hands the loaded module to an agent
//! and later asks the agent to produce a JSON result for one phase.
//!
//! Agents are created per phase from an [`AgentRegistry`] keyed by module
//! id. Ids without a registered factory fall back to [`ModuleAgent`], which
//! only reports what it loaded.

use crate::memory::PhaseContext;
use crate::modules::LoadedModule;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed future returned by [`Agent::execute`].
pub type AgentFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, String>> + Send + 'a>>;

/// Everything an agent sees when it runs.
#[derive(Debug, Clone, Default)]
pub struct AgentInput {
    pub phase_id: String,
    /// Free-form request text.
    pub request: String,
    /// Dependency context from the memory store.
    pub context: PhaseContext,
    /// Outputs of earlier agents in the same sequential phase, by agent id.
    pub prior: BTreeMap<String, Value>,
}

// ── Agent trait ────────────────────────────────────────────────────

/// An executable agent bound to one module id.
///
/// # Example
///
/// ```ignore
/// struct SchemaArchitect { instructions: String }
///
/// impl Agent for SchemaArchitect {
///     fn id(&self) -> &str { "database/schema-architect" }
///
///     fn load(&mut self, module: &LoadedModule) -> Result<(), String> {
///         self.instructions = module.content.to_string();
///         Ok(())
///     }
///
///     fn execute<'a>(&'a self, input: &'a AgentInput) -> AgentFuture<'a> {
///         Box::pin(async move { Ok(json!({ "entities": [] })) })
///     }
/// }
/// ```
pub trait Agent: Send + Sync {
    /// The module id this agent runs.
    fn id(&self) -> &str;

    /// One-line description for logs and planning.
    fn describe(&self) -> String {
        self.id().to_string()
    }

    /// Accept the loaded module content before execution.
    fn load(&mut self, module: &LoadedModule) -> Result<(), String> {
        let _ = module;
        Ok(())
    }

    /// Produce this agent's result for one phase.
    fn execute<'a>(&'a self, input: &'a AgentInput) -> AgentFuture<'a>;
}

// ── ModuleAgent ────────────────────────────────────────────────────

/// Fallback agent that reports the module it loaded.
#[derive(Debug, Clone)]
pub struct ModuleAgent {
    id: String,
    module: Option<LoadedModule>,
}

impl ModuleAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            module: None,
        }
    }
}

impl Agent for ModuleAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn describe(&self) -> String {
        match &self.module {
            Some(m) => format!("{} ({}, {} units)", self.id, m.key.variant, m.size),
            None => self.id.clone(),
        }
    }

    fn load(&mut self, module: &LoadedModule) -> Result<(), String> {
        self.module = Some(module.clone());
        Ok(())
    }

    fn execute<'a>(&'a self, input: &'a AgentInput) -> AgentFuture<'a> {
        Box::pin(async move {
            let Some(module) = &self.module else {
                return Err(format!("module {} was never loaded", self.id));
            };
            let summary = module
                .content
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .unwrap_or("");
            Ok(json!({
                "summary": summary,
                "phase": input.phase_id,
                "variant": module.key.variant,
                "inputs": input.context.direct.keys().collect::<Vec<_>>(),
            }))
        })
    }
}

// ── FnAgent ────────────────────────────────────────────────────────

type AgentFn = dyn Fn(&AgentInput) -> Result<Value, String> + Send + Sync;

/// Closure-backed agent with an optional simulated latency.
///
/// Useful for tests and for embedding callers whose agents are plain
/// functions.
#[derive(Clone)]
pub struct FnAgent {
    id: String,
    delay: Duration,
    handler: Arc<AgentFn>,
}

impl FnAgent {
    pub fn new(
        id: impl Into<String>,
        handler: impl Fn(&AgentInput) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            delay: Duration::ZERO,
            handler: Arc::new(handler),
        }
    }

    /// Sleep this long before producing a result.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl fmt::Debug for FnAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAgent")
            .field("id", &self.id)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl Agent for FnAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn execute<'a>(&'a self, input: &'a AgentInput) -> AgentFuture<'a> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.handler)(input)
        })
    }
}

// ── Registry ───────────────────────────────────────────────────────

type AgentFactory = Arc<dyn Fn() -> Box<dyn Agent> + Send + Sync>;

/// Creates agents by module id.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `id`. Replaces any previous registration.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        factory: impl Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    ) {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    /// Register a factory (builder pattern).
    pub fn with(
        mut self,
        id: impl Into<String>,
        factory: impl Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    ) -> Self {
        self.register(id, factory);
        self
    }

    /// Register a cloneable agent under its own id (builder pattern).
    pub fn with_agent<A: Agent + Clone + 'static>(self, agent: A) -> Self {
        let id = agent.id().to_string();
        self.with(id, move || Box::new(agent.clone()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// A fresh agent for `id`, or a [`ModuleAgent`] if none is registered.
    pub fn create(&self, id: &str) -> Box<dyn Agent> {
        match self.factories.get(id) {
            Some(factory) => factory(),
            None => Box::new(ModuleAgent::new(id)),
        }
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.factories.keys().collect();
        ids.sort();
        f.debug_struct("AgentRegistry").field("agents", &ids).finish()
    }
}
