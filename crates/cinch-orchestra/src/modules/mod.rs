//! Agent modules: identity, sources, caching, and budgeted loading.

pub mod cache;
pub mod descriptor;
pub mod loader;
pub mod predict;
pub mod source;

pub use cache::{LoadedModule, ModuleCache};
pub use descriptor::{ModuleDescriptor, ModuleKey, Variant, team_of};
pub use loader::{DEFAULT_SUMMARY_ALLOWANCE, DEFAULT_SUMMARY_SIZE, LoaderStats, ModuleLoader};
pub use predict::{PreloadRule, PreloadTable};
pub use source::{DirectorySource, InMemorySource, ModuleSource, SourceModule};
