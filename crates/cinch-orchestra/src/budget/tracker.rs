//! Resident-size accounting against a safety-margined capacity.
//!
//! Every loaded agent module is recorded here under its key. Loads are
//! admitted only while `used + size <= floor(capacity * safety_margin)`.
//! All mutation goes through one mutex so concurrent loads inside a parallel
//! phase cannot break the `used == sum(per_item)` invariant.

use crate::error::{OrchestraError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Default fraction of capacity that loads may occupy.
pub const DEFAULT_SAFETY_MARGIN: f64 = 0.9;

#[derive(Debug, Default)]
struct TrackerState {
    used: u64,
    per_item: HashMap<String, u64>,
    peak: u64,
}

/// Mutex-guarded usage accumulator shared by every loader in a run.
#[derive(Debug)]
pub struct ResourceTracker {
    capacity: u64,
    safety_margin: f64,
    state: Mutex<TrackerState>,
}

impl ResourceTracker {
    /// Create a tracker with the default 0.9 safety margin.
    pub fn new(capacity: u64) -> Self {
        Self::with_margin(capacity, DEFAULT_SAFETY_MARGIN)
    }

    /// Create a tracker with a custom safety margin in `(0, 1]`.
    pub fn with_margin(capacity: u64, safety_margin: f64) -> Self {
        Self {
            capacity,
            safety_margin: safety_margin.clamp(0.0, 1.0),
            state: Mutex::new(TrackerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total capacity before the safety margin is applied.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Highest usage admitted for loads: `floor(capacity * margin)`.
    pub fn ceiling(&self) -> u64 {
        (self.capacity as f64 * self.safety_margin).floor() as u64
    }

    /// Current resident usage.
    pub fn used(&self) -> u64 {
        self.lock().used
    }

    /// Highest usage observed since construction.
    pub fn peak(&self) -> u64 {
        self.lock().peak
    }

    /// Size currently recorded for `id`, if tracked.
    pub fn item_size(&self, id: &str) -> Option<u64> {
        self.lock().per_item.get(id).copied()
    }

    /// Room left under the ceiling.
    pub fn available(&self) -> u64 {
        self.ceiling().saturating_sub(self.used())
    }

    /// Usage as a fraction of raw capacity.
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        self.used() as f64 / self.capacity as f64
    }

    /// Side-effect-free admission check against the margined ceiling.
    pub fn can_load(&self, size: u64) -> bool {
        let used = self.lock().used;
        used.saturating_add(size) <= self.ceiling()
    }

    /// Record `size` units under `id`, or fail with `BudgetExceeded`.
    ///
    /// Adding to an already-tracked id accumulates onto its entry.
    pub fn add(&self, id: &str, size: u64) -> Result<()> {
        let ceiling = self.ceiling();
        let mut state = self.lock();
        if state.used.saturating_add(size) > ceiling {
            debug!(
                "Rejecting {id}: {} used + {size} requested > {ceiling} ceiling",
                state.used
            );
            return Err(OrchestraError::BudgetExceeded {
                item: id.to_string(),
                requested: size,
                used: state.used,
                ceiling,
            });
        }
        *state.per_item.entry(id.to_string()).or_insert(0) += size;
        state.used += size;
        state.peak = state.peak.max(state.used);
        Ok(())
    }

    /// Release up to `size` units from `id`. Unknown ids are a no-op.
    ///
    /// Returns the number of units actually released.
    pub fn remove(&self, id: &str, size: u64) -> u64 {
        let mut state = self.lock();
        let Some(entry) = state.per_item.get_mut(id) else {
            return 0;
        };
        let released = size.min(*entry);
        *entry -= released;
        if *entry == 0 {
            state.per_item.remove(id);
        }
        state.used -= released;
        released
    }

    /// Evict tracked items largest-first until at least `target` is freed.
    ///
    /// Returns the evicted ids in eviction order. If everything is evicted
    /// before reaching the target, returns all of them.
    pub fn emergency_reclaim(&self, target: u64) -> Vec<String> {
        self.emergency_reclaim_where(target, |_| true)
    }

    /// Like [`emergency_reclaim`](Self::emergency_reclaim), restricted to ids
    /// accepted by `eligible`.
    pub fn emergency_reclaim_where(&self, target: u64, eligible: impl Fn(&str) -> bool) -> Vec<String> {
        let mut state = self.lock();
        let mut candidates: Vec<(String, u64)> = state
            .per_item
            .iter()
            .filter(|(id, _)| eligible(id))
            .map(|(id, size)| (id.clone(), *size))
            .collect();
        // Largest first; ties broken by id so the order is reproducible.
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut freed = 0u64;
        let mut evicted = Vec::new();
        for (id, size) in candidates {
            if freed >= target {
                break;
            }
            state.per_item.remove(&id);
            state.used -= size;
            freed += size;
            evicted.push(id);
        }

        if freed < target {
            warn!("Emergency reclaim freed {freed} of {target} requested units");
        } else {
            debug!("Emergency reclaim freed {freed} units from {} item(s)", evicted.len());
        }
        evicted
    }

    /// Point-in-time copy of the accounting state.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let state = self.lock();
        BudgetSnapshot {
            capacity: self.capacity,
            ceiling: self.ceiling(),
            used: state.used,
            peak: state.peak,
            per_item: state.per_item.clone(),
        }
    }
}

/// Snapshot of resource usage at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub capacity: u64,
    pub ceiling: u64,
    pub used: u64,
    pub peak: u64,
    pub per_item: HashMap<String, u64>,
}

impl BudgetSnapshot {
    /// Whether `used` equals the sum of per-item usage.
    pub fn is_consistent(&self) -> bool {
        self.per_item.values().sum::<u64>() == self.used
    }

    /// Format as a short log-friendly string.
    pub fn to_log_string(&self) -> String {
        let pct = if self.capacity > 0 {
            self.used as f64 / self.capacity as f64 * 100.0
        } else {
            100.0
        };
        format!(
            "budget: {} units ({pct:.0}% of {}, ceiling {}), {} item(s)",
            self.used,
            self.capacity,
            self.ceiling,
            self.per_item.len(),
        )
    }
}
