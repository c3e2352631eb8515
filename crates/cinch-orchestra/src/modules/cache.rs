//! Resident module cache.
//!
//! Holds every core/detail module currently charged to the resource
//! tracker. Entries carry an in-use count (phases currently holding the
//! module) and a lifetime use count that drives the retention heuristic in
//! [`ModuleLoader::release`](super::ModuleLoader::release).

use crate::modules::descriptor::ModuleKey;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A module variant whose content is resident.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModule {
    pub key: ModuleKey,
    pub content: Arc<str>,
    /// Units charged for this module.
    pub size: u64,
}

impl LoadedModule {
    /// Id under which this module is charged to the tracker.
    pub fn tracker_id(&self) -> String {
        self.key.to_string()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    module: LoadedModule,
    in_use: u32,
    uses: u32,
}

/// Cache of resident modules keyed by `(id, variant)`.
#[derive(Debug, Default)]
pub struct ModuleCache {
    entries: HashMap<ModuleKey, CacheEntry>,
    /// Hits counter for diagnostics.
    hits: u64,
    /// Misses counter for diagnostics.
    misses: u64,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a resident module and mark it in use. Counts a hit or miss.
    pub fn acquire(&mut self, key: &ModuleKey) -> Option<LoadedModule> {
        let found = self.reacquire(key);
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Like [`acquire`](Self::acquire) but without touching the counters.
    pub fn reacquire(&mut self, key: &ModuleKey) -> Option<LoadedModule> {
        let entry = self.entries.get_mut(key)?;
        entry.in_use += 1;
        entry.uses += 1;
        Some(entry.module.clone())
    }

    /// Insert a freshly loaded module, already marked in use once.
    pub fn insert(&mut self, module: LoadedModule) {
        self.entries.insert(
            module.key.clone(),
            CacheEntry {
                module,
                in_use: 1,
                uses: 1,
            },
        );
    }

    /// Drop one in-use mark. Returns `(in_use, uses)` after the release.
    pub fn release(&mut self, key: &ModuleKey) -> Option<(u32, u32)> {
        let entry = self.entries.get_mut(key)?;
        entry.in_use = entry.in_use.saturating_sub(1);
        Some((entry.in_use, entry.uses))
    }

    pub fn remove(&mut self, key: &ModuleKey) -> Option<LoadedModule> {
        self.entries.remove(key).map(|e| e.module)
    }

    /// Remove the entry charged under `tracker_id`, if any.
    pub fn remove_by_tracker_id(&mut self, tracker_id: &str) -> Option<LoadedModule> {
        let key = self
            .entries
            .keys()
            .find(|k| k.to_string() == tracker_id)
            .cloned()?;
        self.remove(&key)
    }

    /// Tracker ids of resident modules no phase currently holds.
    pub fn idle_ids(&self) -> HashSet<String> {
        self.entries
            .values()
            .filter(|e| e.in_use == 0)
            .map(|e| e.module.tracker_id())
            .collect()
    }

    pub fn contains(&self, key: &ModuleKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove every entry, returning what was resident.
    pub fn drain(&mut self) -> Vec<LoadedModule> {
        self.entries.drain().map(|(_, e)| e.module).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total units held by resident modules.
    pub fn resident_size(&self) -> u64 {
        self.entries.values().map(|e| e.module.size).sum()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

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
