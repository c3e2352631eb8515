//! Run output assembly.

use crate::error::{ErrorKind, OrchestraError};
use crate::memory::PhaseResult;
use crate::modules::LoaderStats;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Output sections: domain → phase id → compressed result.
pub type Sections = BTreeMap<String, BTreeMap<String, Value>>;

/// User-visible failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&OrchestraError> for RunError {
    fn from(err: &OrchestraError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Final result of a run.
///
/// A failed run that got past planning is `partial`: `sections` still holds
/// whatever the completed phases produced.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationOutput {
    pub run_id: String,
    pub success: bool,
    pub partial: bool,
    pub completed_phases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub sections: Sections,
    /// Peak module budget in use during the run, in units.
    pub budget_used: u64,
    pub phases_completed: usize,
    pub elapsed_ms: u64,
    pub loader: LoaderStats,
}

impl OrchestrationOutput {
    /// Output for a run that never got a valid plan. Nothing was loaded.
    pub fn rejected(run_id: impl Into<String>, err: &OrchestraError, elapsed_ms: u64) -> Self {
        Self {
            run_id: run_id.into(),
            success: false,
            partial: false,
            completed_phases: Vec::new(),
            error: Some(RunError::from(err)),
            sections: Sections::new(),
            budget_used: 0,
            phases_completed: 0,
            elapsed_ms,
            loader: LoaderStats::default(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// Group stored results by their kind's domain.
pub fn assemble_output(results: &[PhaseResult]) -> Sections {
    let mut sections = Sections::new();
    for result in results {
        sections
            .entry(result.kind.domain().to_string())
            .or_default()
            .insert(result.phase_id.clone(), result.compressed_payload.clone());
    }
    sections
}
