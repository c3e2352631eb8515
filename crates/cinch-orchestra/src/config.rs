//! Configuration for an [`Orchestrator`](crate::orchestrator::Orchestrator).
//!
//! Every field has a default, so a config file only needs the values it
//! overrides:
//!
//! ```json
//! { "capacity": 120000, "fan_out": 2, "cleanup": { "enabled": false } }
//! ```
//!
//! Builder methods cover the common settings:
//!
//! ```ignore
//! let config = OrchestraConfig::default()
//!     .with_capacity(50_000)
//!     .with_phase_timeout_ms(30_000)
//!     .with_checkpoint_dir(".orchestra/runs");
//! ```

use crate::budget::DEFAULT_SAFETY_MARGIN;
use crate::error::{OrchestraError, Result};
use crate::memory::{DEFAULT_STORE_CAPACITY, RetentionPolicy};
use crate::modules::{DEFAULT_SUMMARY_ALLOWANCE, DEFAULT_SUMMARY_SIZE};
use crate::phase::DEFAULT_PHASE_TIMEOUT_MS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default module budget, in units.
pub const DEFAULT_CAPACITY: u64 = 200_000;

// ── Generic toggle ────────────────────────────────────────────────

/// Enabled/disabled wrapper for optional behaviors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Toggle<T: Default> {
    pub enabled: bool,
    pub config: T,
}

impl<T: Default> Toggle<T> {
    /// A disabled instance with default inner config.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── Cleanup ────────────────────────────────────────────────────────

/// When the memory store gets cleaned between phases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Store usage fraction that triggers a cleanup pass.
    pub trigger: f64,
    /// Usage fraction a cleanup pass aims for.
    pub target: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            trigger: 0.8,
            target: 0.6,
        }
    }
}

// ── OrchestraConfig ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestraConfig {
    /// Module budget capacity in units.
    pub capacity: u64,
    /// Fraction of capacity loads may occupy.
    pub safety_margin: f64,
    /// Memory store capacity in units.
    pub store_capacity: u64,
    /// Max agents running at once inside a parallel phase.
    pub fan_out: usize,
    pub summary_size: u64,
    pub summary_allowance: u64,
    /// Timeout applied to phases the classifier builds.
    pub phase_timeout_ms: u64,
    /// Uses after which a module stays resident between phases. `0` disables.
    pub retain_after_uses: u32,
    pub cleanup: Toggle<CleanupConfig>,
    pub retention: RetentionPolicy,
    /// Preload predicted module summaries at run start.
    pub preload: bool,
    /// Where run checkpoints are written. `None` disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for OrchestraConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            store_capacity: DEFAULT_STORE_CAPACITY,
            fan_out: 4,
            summary_size: DEFAULT_SUMMARY_SIZE,
            summary_allowance: DEFAULT_SUMMARY_ALLOWANCE,
            phase_timeout_ms: DEFAULT_PHASE_TIMEOUT_MS,
            retain_after_uses: 3,
            cleanup: Toggle::default(),
            retention: RetentionPolicy::default(),
            preload: true,
            checkpoint_dir: None,
        }
    }
}

impl OrchestraConfig {
    /// Load a JSON config file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(OrchestraError::Config("capacity must be positive".into()));
        }
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(OrchestraError::Config(format!(
                "safety_margin must be in (0, 1], got {}",
                self.safety_margin
            )));
        }
        if self.fan_out == 0 {
            return Err(OrchestraError::Config("fan_out must be at least 1".into()));
        }
        let cleanup = &self.cleanup.config;
        if self.cleanup.enabled && cleanup.target > cleanup.trigger {
            return Err(OrchestraError::Config(format!(
                "cleanup target {} is above trigger {}",
                cleanup.target, cleanup.trigger
            )));
        }
        Ok(())
    }

    pub fn with_capacity(mut self, capacity: u64) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = margin;
        self
    }

    pub fn with_store_capacity(mut self, capacity: u64) -> Self {
        self.store_capacity = capacity;
        self
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_phase_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.phase_timeout_ms = timeout_ms;
        self
    }

    pub fn with_retain_after_uses(mut self, uses: u32) -> Self {
        self.retain_after_uses = uses;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_cleanup(mut self, cleanup: Toggle<CleanupConfig>) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }
}
