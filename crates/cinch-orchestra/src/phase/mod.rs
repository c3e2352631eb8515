//! Phases: what runs, in which order, and how one phase executes.

pub mod context;
pub mod definition;
pub mod executor;

pub use context::RunContext;
pub use definition::{AgentSpec, DEFAULT_PHASE_TIMEOUT_MS, ExecutionPlan, PhaseDefinition, PhaseKind};
pub use executor::{PhaseExecutor, PhaseOutcome};
