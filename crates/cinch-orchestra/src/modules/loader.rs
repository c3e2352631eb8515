//! Budget-accounted module loading.
//!
//! [`ModuleLoader`] is the only component that charges module content to the
//! [`ResourceTracker`]. Core and detail loads are admitted against the
//! margined ceiling; summaries draw from a small separate allowance and
//! never fail.
//!
//! Lock order is loader state, then tracker. Source reads happen outside
//! the loader lock, so two tasks racing on the same key re-check the cache
//! before charging.

use crate::budget::ResourceTracker;
use crate::error::{OrchestraError, Result};
use crate::modules::cache::{LoadedModule, ModuleCache};
use crate::modules::descriptor::{ModuleDescriptor, ModuleKey, Variant};
use crate::modules::predict::PreloadTable;
use crate::modules::source::ModuleSource;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Fixed size charged for one summary.
pub const DEFAULT_SUMMARY_SIZE: u64 = 10;

/// Units reserved for cached summaries, outside the main pool.
pub const DEFAULT_SUMMARY_ALLOWANCE: u64 = 2_000;

/// Loader counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoaderStats {
    /// Core and detail load attempts, including cache hits.
    pub load_calls: u64,
    pub hits: u64,
    pub misses: u64,
    pub summary_loads: u64,
    /// Modules currently resident.
    pub resident: usize,
    /// Units held by resident modules.
    pub resident_size: u64,
}

impl LoaderStats {
    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct LoaderState {
    cache: ModuleCache,
    summaries: HashMap<String, ModuleDescriptor>,
    summary_used: u64,
    load_calls: u64,
    summary_loads: u64,
}

/// Loads agent modules from a [`ModuleSource`] under a shared budget.
pub struct ModuleLoader {
    source: Arc<dyn ModuleSource>,
    tracker: Arc<ResourceTracker>,
    summary_size: u64,
    summary_allowance: u64,
    /// Uses after which a released module stays resident. `0` disables
    /// retention.
    retain_after_uses: u32,
    state: Mutex<LoaderState>,
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("summary_size", &self.summary_size)
            .field("summary_allowance", &self.summary_allowance)
            .field("retain_after_uses", &self.retain_after_uses)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ModuleLoader {
    pub fn new(source: Arc<dyn ModuleSource>, tracker: Arc<ResourceTracker>) -> Self {
        Self {
            source,
            tracker,
            summary_size: DEFAULT_SUMMARY_SIZE,
            summary_allowance: DEFAULT_SUMMARY_ALLOWANCE,
            retain_after_uses: 0,
            state: Mutex::new(LoaderState::default()),
        }
    }

    pub fn with_summary_size(mut self, size: u64) -> Self {
        self.summary_size = size;
        self
    }

    pub fn with_summary_allowance(mut self, allowance: u64) -> Self {
        self.summary_allowance = allowance;
        self
    }

    pub fn with_retention(mut self, retain_after_uses: u32) -> Self {
        self.retain_after_uses = retain_after_uses;
        self
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    // ── Summaries ──────────────────────────────────────────────────

    /// Fetch the summary descriptor for `id`. Never fails.
    ///
    /// Unknown or unreadable modules yield a stub descriptor. Summaries are
    /// cached while the allowance lasts and never touch the main budget.
    pub fn load_summary(&self, id: &str) -> ModuleDescriptor {
        {
            let mut state = self.lock();
            state.summary_loads += 1;
            if let Some(cached) = state.summaries.get(id) {
                return cached.clone();
            }
        }

        let descriptor = match self.source.descriptor(&ModuleKey::summary(id)) {
            Ok(mut d) => {
                d.estimated_size = self.summary_size;
                d
            }
            Err(e) => {
                debug!("Summary for {id} unavailable ({e}); using stub");
                ModuleDescriptor::stub(id, Variant::Summary, self.summary_size)
            }
        };

        let mut state = self.lock();
        if !state.summaries.contains_key(id) {
            if state.summary_used + self.summary_size <= self.summary_allowance {
                state.summary_used += self.summary_size;
                state.summaries.insert(id.to_string(), descriptor.clone());
            } else {
                trace!("Summary allowance exhausted; {id} not cached");
            }
        }
        descriptor
    }

    /// Whether a summary for `id` is cached.
    pub fn has_summary(&self, id: &str) -> bool {
        self.lock().summaries.contains_key(id)
    }

    // ── Core / detail ──────────────────────────────────────────────

    /// Load the core variant of `id`, charging it to the tracker.
    pub fn load_core(&self, id: &str) -> Result<LoadedModule> {
        self.load_accounted(ModuleKey::core(id))
    }

    /// Load the detail variant of `id`.
    ///
    /// A detail load that does not fit reports `ContextLimit` rather than
    /// `BudgetExceeded`.
    pub fn load_detail(&self, id: &str) -> Result<LoadedModule> {
        self.load_accounted(ModuleKey::detail(id)).map_err(|e| match e {
            OrchestraError::BudgetExceeded {
                item,
                requested,
                used,
                ceiling,
            } => OrchestraError::ContextLimit {
                item,
                requested,
                available: ceiling.saturating_sub(used),
            },
            other => other,
        })
    }

    /// Load any variant. Summaries are returned uncharged.
    pub fn load(&self, key: &ModuleKey) -> Result<LoadedModule> {
        match key.variant {
            Variant::Summary => {
                let descriptor = self.load_summary(&key.id);
                Ok(LoadedModule {
                    key: key.clone(),
                    content: Arc::from(descriptor.description.as_str()),
                    size: descriptor.estimated_size,
                })
            }
            Variant::Core => self.load_core(&key.id),
            Variant::Detail => self.load_detail(&key.id),
        }
    }

    fn load_accounted(&self, key: ModuleKey) -> Result<LoadedModule> {
        {
            let mut state = self.lock();
            state.load_calls += 1;
            if let Some(module) = state.cache.acquire(&key) {
                trace!("Cache hit for {key}");
                return Ok(module);
            }
        }

        let content = self.source.read(&key)?;
        let size = self.source.size_of(&key)?;

        let mut state = self.lock();
        // Another task may have loaded the same key while we were reading.
        if let Some(module) = state.cache.reacquire(&key) {
            return Ok(module);
        }

        let tracker_id = key.to_string();
        if let Err(err) = self.tracker.add(&tracker_id, size) {
            let idle = state.cache.idle_ids();
            if !err.is_budget_pressure() || idle.is_empty() {
                return Err(err);
            }
            let needed = size.saturating_sub(self.tracker.available());
            let evicted = self
                .tracker
                .emergency_reclaim_where(needed, |id| idle.contains(id));
            for id in &evicted {
                state.cache.remove_by_tracker_id(id);
            }
            info!(
                "Reclaimed {} retained module(s) to fit {key} ({size} units)",
                evicted.len()
            );
            self.tracker.add(&tracker_id, size)?;
        }

        debug!("Loaded module {key} ({size} units)");
        let module = LoadedModule {
            key,
            content: Arc::from(content),
            size,
        };
        state.cache.insert(module.clone());
        Ok(module)
    }

    /// Load many modules of one variant, smallest first.
    ///
    /// Individual failures do not stop the batch; every id gets an outcome.
    pub fn batch_load(&self, ids: &[String], variant: Variant) -> BTreeMap<String, Result<LoadedModule>> {
        let mut ordered: Vec<(u64, &String)> = ids
            .iter()
            .map(|id| {
                let size = self
                    .source
                    .size_of(&ModuleKey::new(id.clone(), variant))
                    .unwrap_or(u64::MAX);
                (size, id)
            })
            .collect();
        ordered.sort();
        ordered.dedup_by(|a, b| a.1 == b.1);

        let mut outcomes = BTreeMap::new();
        for (_, id) in ordered {
            let outcome = self.load(&ModuleKey::new(id.clone(), variant));
            if let Err(e) = &outcome {
                debug!("Batch load of {id} failed: {e}");
            }
            outcomes.insert(id.clone(), outcome);
        }
        outcomes
    }

    // ── Unloading ──────────────────────────────────────────────────

    /// Unload a module unconditionally. Returns whether it was resident.
    pub fn unload(&self, key: &ModuleKey) -> bool {
        let mut state = self.lock();
        let Some(module) = state.cache.remove(key) else {
            return false;
        };
        self.tracker.remove(&module.tracker_id(), module.size);
        debug!("Unloaded module {key} ({} units)", module.size);
        true
    }

    /// Phase-end release of a module.
    ///
    /// Modules used fewer than `retain_after_uses` times are unloaded once
    /// nothing holds them. Frequently used ones stay resident and become
    /// the first candidates for reclaim.
    pub fn release(&self, key: &ModuleKey) {
        if key.variant == Variant::Summary {
            return;
        }
        let mut state = self.lock();
        let Some((in_use, uses)) = state.cache.release(key) else {
            return;
        };
        if in_use > 0 {
            return;
        }
        let retain = self.retain_after_uses > 0 && uses >= self.retain_after_uses;
        if retain {
            trace!("Retaining {key} after {uses} use(s)");
            return;
        }
        if let Some(module) = state.cache.remove(key) {
            self.tracker.remove(&module.tracker_id(), module.size);
            debug!("Unloaded module {key} ({} units)", module.size);
        }
    }

    /// Unload every resident module. Used at run end.
    pub fn unload_all(&self) -> usize {
        let mut state = self.lock();
        let modules = state.cache.drain();
        for module in &modules {
            self.tracker.remove(&module.tracker_id(), module.size);
        }
        if !modules.is_empty() {
            debug!("Unloaded {} resident module(s)", modules.len());
        }
        modules.len()
    }

    pub fn is_resident(&self, key: &ModuleKey) -> bool {
        self.lock().cache.contains(key)
    }

    pub fn stats(&self) -> LoaderStats {
        let state = self.lock();
        LoaderStats {
            load_calls: state.load_calls,
            hits: state.cache.hits(),
            misses: state.cache.misses(),
            summary_loads: state.summary_loads,
            resident: state.cache.len(),
            resident_size: state.cache.resident_size(),
        }
    }

    // ── Prediction ─────────────────────────────────────────────────

    /// Preload summaries for modules predicted from `text` in the background.
    ///
    /// The returned handle resolves to the number of summaries fetched;
    /// callers normally drop it.
    pub fn preload_summaries(self: &Arc<Self>, text: &str, table: &PreloadTable) -> JoinHandle<usize> {
        let predicted: Vec<String> = table.predict(text).into_iter().collect();
        let loader = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            for id in &predicted {
                loader.load_summary(id);
            }
            if !predicted.is_empty() {
                debug!("Preloaded {} summary(ies)", predicted.len());
            }
            predicted.len()
        })
    }
}
