//! Compressed phase results kept between phases.
//!
//! Each committed phase leaves one [`PhaseResult`] here. The store has its
//! own capacity, separate from the module budget; when an insert would
//! overflow it, lower-value results are evicted first. Results still needed
//! by an unexecuted phase (the graph's protected set) are never candidates.

use crate::budget::estimate_units;
use crate::error::{OrchestraError, Result};
use crate::graph::DependencyGraph;
use crate::memory::compress::compressor_for;
use crate::phase::PhaseKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Default memory store capacity in units.
pub const DEFAULT_STORE_CAPACITY: u64 = 60_000;

// ── Retention policy ───────────────────────────────────────────────

/// Pluggable eviction policy: per-kind priorities plus the thresholds that
/// make a result cache-worthy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Higher outlasts lower. Kinds not listed get priority 1.
    pub priorities: BTreeMap<PhaseKind, u8>,
    /// Accesses above this count make a result cache-worthy.
    pub frequent_access: u32,
    /// Results smaller than this many units are cache-worthy.
    pub small_size: u64,
    /// Results with more dependents than this are cache-worthy.
    pub fan_out: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        let priorities = BTreeMap::from([
            (PhaseKind::Requirements, 9),
            (PhaseKind::Schema, 9),
            (PhaseKind::Api, 6),
            (PhaseKind::Backend, 6),
            (PhaseKind::Frontend, 6),
            (PhaseKind::Security, 6),
            (PhaseKind::Testing, 4),
            (PhaseKind::Documentation, 2),
        ]);
        Self {
            priorities,
            frequent_access: 3,
            small_size: 200,
            fan_out: 2,
        }
    }
}

impl RetentionPolicy {
    pub fn priority(&self, kind: PhaseKind) -> u8 {
        self.priorities.get(&kind).copied().unwrap_or(1)
    }

    pub fn with_priority(mut self, kind: PhaseKind, priority: u8) -> Self {
        self.priorities.insert(kind, priority);
        self
    }

    /// Whether a result resists eviction outside the protected set.
    pub fn is_cache_worthy(&self, accesses: u32, size: u64, dependents: usize) -> bool {
        accesses > self.frequent_access || size < self.small_size || dependents > self.fan_out
    }
}

// ── Results ────────────────────────────────────────────────────────

/// Uncompressed output of a successful phase.
#[derive(Debug, Clone)]
pub struct RawPhaseResult {
    pub phase_id: String,
    pub kind: PhaseKind,
    pub payload: Value,
}

/// A committed, compressed phase result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase_id: String,
    pub kind: PhaseKind,
    pub compressed_payload: Value,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub dependents: BTreeSet<String>,
}

/// Dependency context handed to a running phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseContext {
    /// Results of the phases this one requires, keyed by phase id.
    pub direct: BTreeMap<String, Value>,
    /// Cross-cutting results (requirements, security) not already in `direct`.
    pub global: BTreeMap<String, Value>,
}

impl PhaseContext {
    pub fn is_empty(&self) -> bool {
        self.direct.is_empty() && self.global.is_empty()
    }
}

/// What a store insert did.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOutcome {
    pub size: u64,
    pub evicted: Vec<String>,
    /// Units freed by eviction.
    pub freed: u64,
}

/// What an `intelligent_cleanup` pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub evicted: Vec<String>,
    pub freed: u64,
    /// Results skipped because an unexecuted phase still needs them.
    pub protected: BTreeSet<String>,
    pub reached_target: bool,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    result: PhaseResult,
    seq: u64,
    accesses: u32,
}

// ── Store ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MemoryStore {
    capacity: u64,
    used: u64,
    entries: HashMap<String, StoredEntry>,
    next_seq: u64,
    policy: RetentionPolicy,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_STORE_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            used: 0,
            entries: HashMap::new(),
            next_seq: 0,
            policy: RetentionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetentionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.used as f64 / self.capacity as f64
    }

    pub fn has_result(&self, phase_id: &str) -> bool {
        self.entries.contains_key(phase_id)
    }

    pub fn get(&self, phase_id: &str) -> Option<&PhaseResult> {
        self.entries.get(phase_id).map(|e| &e.result)
    }

    /// Compress and commit a phase result.
    ///
    /// If the store would overflow, unprotected results are evicted first.
    /// When even that cannot make room the insert fails with
    /// `BudgetExceeded` and nothing changes.
    pub fn store_phase_result(
        &mut self,
        raw: RawPhaseResult,
        graph: &DependencyGraph,
        executed: &BTreeSet<String>,
    ) -> Result<StoreOutcome> {
        let compressor = compressor_for(raw.kind);
        let compressed = compressor.compress(&raw.payload);
        let size = estimate_units(&serde_json::to_string(&compressed)?);
        let dependents = graph.dependents(&raw.phase_id);

        // A re-run replaces its previous result.
        let replaced = self.entries.get(&raw.phase_id).map_or(0, |e| e.result.size);
        let used_after = self.used - replaced + size;

        let mut evicted = Vec::new();
        let mut freed = 0;
        if used_after > self.capacity {
            let need = used_after - self.capacity;
            let mut protected = graph.protected_set(executed);
            protected.insert(raw.phase_id.clone());
            let plan = self.eviction_plan(need, &protected);
            freed = plan.iter().map(|id| self.entries[id].result.size).sum();
            if freed < need {
                warn!(
                    "Memory store cannot fit {} ({size} units): {} used of {}",
                    raw.phase_id, self.used, self.capacity
                );
                return Err(OrchestraError::BudgetExceeded {
                    item: format!("store:{}", raw.phase_id),
                    requested: size,
                    used: self.used,
                    ceiling: self.capacity,
                });
            }
            for id in &plan {
                self.remove(id);
            }
            evicted = plan;
        }

        self.remove(&raw.phase_id);
        debug!(
            "Stored {} ({} compressor, {size} units, {} dependent(s))",
            raw.phase_id,
            compressor.name(),
            dependents.len()
        );
        let result = PhaseResult {
            phase_id: raw.phase_id,
            kind: raw.kind,
            compressed_payload: compressed,
            size,
            created_at: Utc::now(),
            dependents,
        };
        self.insert(result);
        Ok(StoreOutcome {
            size,
            evicted,
            freed,
        })
    }

    fn insert(&mut self, result: PhaseResult) {
        self.used += result.size;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            result.phase_id.clone(),
            StoredEntry {
                result,
                seq,
                accesses: 0,
            },
        );
    }

    /// Re-insert a result verbatim, e.g. from a checkpoint.
    pub fn restore(&mut self, result: PhaseResult) {
        self.remove(&result.phase_id);
        if self.used + result.size > self.capacity {
            warn!(
                "Restoring {} pushes the memory store over capacity ({} + {} > {})",
                result.phase_id, self.used, result.size, self.capacity
            );
        }
        self.insert(result);
    }

    /// Remove a result. Returns it if present.
    pub fn remove(&mut self, phase_id: &str) -> Option<PhaseResult> {
        let entry = self.entries.remove(phase_id)?;
        self.used -= entry.result.size;
        Some(entry.result)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used = 0;
    }

    /// Resolve a phase's dependency context.
    ///
    /// Fails with `DependencyMissing` for the first dependency without a
    /// stored result.
    pub fn get_phase_context(&mut self, phase_id: &str, deps: &BTreeSet<String>) -> Result<PhaseContext> {
        if let Some(missing) = deps.iter().find(|d| !self.entries.contains_key(*d)) {
            return Err(OrchestraError::dependency_missing(phase_id, missing.clone()));
        }

        let mut context = PhaseContext::default();
        for dep in deps {
            if let Some(entry) = self.entries.get_mut(dep) {
                entry.accesses += 1;
                context
                    .direct
                    .insert(dep.clone(), entry.result.compressed_payload.clone());
            }
        }
        for (id, entry) in &self.entries {
            if entry.result.kind.is_cross_cutting() && id != phase_id && !context.direct.contains_key(id) {
                context
                    .global
                    .insert(id.clone(), entry.result.compressed_payload.clone());
            }
        }
        Ok(context)
    }

    /// Unprotected ids in eviction order, cut off once `need` is covered.
    fn eviction_plan(&self, need: u64, protected: &BTreeSet<String>) -> Vec<String> {
        let mut candidates: Vec<(&String, &StoredEntry)> = self
            .entries
            .iter()
            .filter(|(id, _)| !protected.contains(*id))
            .collect();
        candidates.sort_by_key(|(_, e)| {
            (
                self.policy
                    .is_cache_worthy(e.accesses, e.result.size, e.result.dependents.len()),
                self.policy.priority(e.result.kind),
                e.seq,
            )
        });

        let mut freed = 0;
        let mut plan = Vec::new();
        for (id, entry) in candidates {
            if freed >= need {
                break;
            }
            freed += entry.result.size;
            plan.push(id.clone());
        }
        plan
    }

    /// Evict unprotected results until at least `need` units are freed or
    /// no candidates remain. Returns the evicted ids in order.
    pub fn evict(&mut self, need: u64, protected: &BTreeSet<String>) -> Vec<String> {
        let plan = self.eviction_plan(need, protected);
        for id in &plan {
            self.remove(id);
        }
        plan
    }

    /// Shrink usage toward `target_fraction` of capacity, never touching
    /// results an unexecuted phase still requires.
    pub fn intelligent_cleanup(
        &mut self,
        target_fraction: f64,
        graph: &DependencyGraph,
        executed: &BTreeSet<String>,
    ) -> CleanupReport {
        let target = (self.capacity as f64 * target_fraction.clamp(0.0, 1.0)).floor() as u64;
        if self.used <= target {
            return CleanupReport {
                reached_target: true,
                ..CleanupReport::default()
            };
        }

        let protected = graph.protected_set(executed);
        let before = self.used;
        let evicted = self.evict(before - target, &protected);
        let freed = before - self.used;
        let reached_target = self.used <= target;
        if reached_target {
            info!("Memory cleanup evicted {} result(s), freed {freed} units", evicted.len());
        } else {
            warn!(
                "Memory cleanup stopped at {} units (target {target}); {} result(s) protected",
                self.used,
                protected.len()
            );
        }
        CleanupReport {
            evicted,
            freed,
            protected,
            reached_target,
        }
    }

    /// All results in insertion order.
    pub fn results(&self) -> Vec<PhaseResult> {
        let mut entries: Vec<&StoredEntry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.result.clone()).collect()
    }
}
