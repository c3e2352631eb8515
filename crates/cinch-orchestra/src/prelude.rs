//! Convenience re-exports for common `cinch-orchestra` types.
//!
//! ```ignore
//! use cinch_orchestra::prelude::*;
//! ```
//!
//! Covers building and running an orchestrator, writing agents, and
//! observing runs. Lower-level pieces (module cache, compressors, graph
//! internals) stay in their modules.

// ── Errors ──────────────────────────────────────────────────────────
pub use crate::error::{ErrorKind, OrchestraError, Result};

// ── Configuration and input ─────────────────────────────────────────
pub use crate::config::{CleanupConfig, OrchestraConfig, Toggle};
pub use crate::request::OrchestrationRequest;

// ── Modules and agents ──────────────────────────────────────────────
pub use crate::agent::{Agent, AgentFuture, AgentInput, AgentRegistry, FnAgent, ModuleAgent};
pub use crate::modules::{
    DirectorySource, InMemorySource, LoadedModule, ModuleKey, ModuleLoader, ModuleSource,
    SourceModule, Variant,
};

// ── Planning and execution ──────────────────────────────────────────
pub use crate::budget::ResourceTracker;
pub use crate::graph::{CriticalRules, DependencyGraph};
pub use crate::memory::{MemoryStore, PhaseContext, RetentionPolicy};
pub use crate::orchestrator::{
    OrchestrationOutput, Orchestrator, PhaseTemplate, RequestClassifier, RunState,
};
pub use crate::phase::{AgentSpec, ExecutionPlan, PhaseDefinition, PhaseExecutor, PhaseKind, RunContext};

// ── Events and durability ───────────────────────────────────────────
pub use crate::checkpoint::CheckpointStore;
pub use crate::events::{
    CompositeEventHandler, EventHandler, EventObserver, LoggingHandler, NoopHandler, OrchestraEvent,
};
