//! Memory store for compressed phase results.

pub mod compress;
pub mod store;

pub use compress::{Compressor, OutputCompressor, SchemaCompressor, compressor_for};
pub use store::{
    CleanupReport, DEFAULT_STORE_CAPACITY, MemoryStore, PhaseContext, PhaseResult, RawPhaseResult,
    RetentionPolicy, StoreOutcome,
};
