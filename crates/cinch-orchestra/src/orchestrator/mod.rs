//! Request planning, phase sequencing, recovery, and output assembly.

pub mod classify;
pub mod output;
pub mod run;

pub use classify::{PhaseTemplate, RequestClassifier};
pub use output::{OrchestrationOutput, RunError, Sections, assemble_output};
pub use run::{Orchestrator, RunState};
