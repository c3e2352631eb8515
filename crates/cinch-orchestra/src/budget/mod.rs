//! Resident budget accounting.
//!
//! The budget models a finite working-memory resource: everything loaded
//! into a run (agent module content) is charged against one capacity,
//! operated under a safety margin. See [`ResourceTracker`].

pub mod tracker;

pub use tracker::{BudgetSnapshot, DEFAULT_SAFETY_MARGIN, ResourceTracker};

/// Default characters per budget unit, matching the usual 3-4 chars/token
/// estimate for English text.
pub const DEFAULT_CHARS_PER_UNIT: f64 = 3.5;

/// Estimate the budget units consumed by `text`.
pub fn estimate_units(text: &str) -> u64 {
    estimate_units_for_chars(text.len())
}

/// Estimate the budget units consumed by `chars` characters.
pub fn estimate_units_for_chars(chars: usize) -> u64 {
    (chars as f64 / DEFAULT_CHARS_PER_UNIT).ceil() as u64
}
