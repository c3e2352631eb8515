//! Error taxonomy for budgeted orchestration runs.
//!
//! Every fallible operation in the crate returns [`OrchestraError`]. The
//! user-visible run output only carries the coarse [`ErrorKind`] plus the
//! rendered message, so callers can branch on the kind without matching
//! variant payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestraError {
    /// A load would push resident usage past the safety-margined ceiling.
    #[error("Budget exceeded loading {item}: {used} used + {requested} requested > {ceiling} ceiling")]
    BudgetExceeded {
        item: String,
        requested: u64,
        used: u64,
        ceiling: u64,
    },

    /// An optional or detail load could not fit. Softer than `BudgetExceeded`.
    #[error("Context limit reached loading {item}: {requested} requested, {available} available")]
    ContextLimit {
        item: String,
        requested: u64,
        available: u64,
    },

    #[error("Phase '{phase}' is missing a stored result for dependency '{dependency}'")]
    DependencyMissing { phase: String, dependency: String },

    #[error("Agent '{agent}' failed: {message}")]
    AgentFailure { agent: String, message: String },

    #[error("Phase '{phase}' timed out after {timeout_ms}ms")]
    Timeout { phase: String, timeout_ms: u64 },

    #[error("Invalid execution plan: {0}")]
    PlanInvalid(String),

    #[error("Adding dependency '{phase}' -> '{dependency}' would create a cycle")]
    CyclicDependency { phase: String, dependency: String },

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestraError {
    /// Create an agent failure error.
    pub fn agent_failed(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AgentFailure {
            agent: agent.into(),
            message: message.into(),
        }
    }

    /// Create a missing dependency error.
    pub fn dependency_missing(phase: impl Into<String>, dependency: impl Into<String>) -> Self {
        Self::DependencyMissing {
            phase: phase.into(),
            dependency: dependency.into(),
        }
    }

    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            Self::ContextLimit { .. } => ErrorKind::ContextLimit,
            Self::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            Self::AgentFailure { .. } => ErrorKind::AgentFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::PlanInvalid(_) => ErrorKind::PlanInvalid,
            Self::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Self::ModuleNotFound(_) => ErrorKind::ModuleNotFound,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }

    /// Whether this failure came from running out of resident budget.
    ///
    /// The orchestrator answers these with one narrow-and-retry attempt.
    pub fn is_budget_pressure(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. } | Self::ContextLimit { .. })
    }
}

pub type Result<T> = std::result::Result<T, OrchestraError>;

/// Coarse, serializable error classification surfaced in run output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BudgetExceeded,
    ContextLimit,
    DependencyMissing,
    AgentFailure,
    Timeout,
    PlanInvalid,
    CyclicDependency,
    ModuleNotFound,
    InvalidRequest,
    Config,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BudgetExceeded => "BudgetExceeded",
            Self::ContextLimit => "ContextLimit",
            Self::DependencyMissing => "DependencyMissing",
            Self::AgentFailure => "AgentFailure",
            Self::Timeout => "Timeout",
            Self::PlanInvalid => "PlanInvalid",
            Self::CyclicDependency => "CyclicDependency",
            Self::ModuleNotFound => "ModuleNotFound",
            Self::InvalidRequest => "InvalidRequest",
            Self::Config => "Config",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_errors_count_as_pressure() {
        let exceeded = OrchestraError::BudgetExceeded {
            item: "a".into(),
            requested: 10,
            used: 900,
            ceiling: 900,
        };
        let limit = OrchestraError::ContextLimit {
            item: "a".into(),
            requested: 10,
            available: 0,
        };
        assert!(exceeded.is_budget_pressure());
        assert!(limit.is_budget_pressure());
        assert!(!OrchestraError::PlanInvalid("x".into()).is_budget_pressure());
    }

    #[test]
    fn kind_display_matches_taxonomy() {
        let err = OrchestraError::dependency_missing("api", "schema");
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
        assert_eq!(err.kind().to_string(), "DependencyMissing");
        assert!(err.to_string().contains("'schema'"));
    }

    #[test]
    fn io_errors_are_internal() {
        let err: OrchestraError = std::io::Error::other("disk").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
