//! Context-budgeted orchestration of agent modules.
//!
//! `cinch-orchestra` turns a free-form request ("an admin panel with RBAC and
//! an audit log") into a plan of dependent phases, runs each phase's agents
//! against a finite working-memory budget, and assembles the compressed phase
//! results into one structured deliverable.
//!
//! Agent modules are opaque, sized units of content read from a
//! [`ModuleSource`](modules::ModuleSource). The engine never lets resident
//! modules exceed a safety-margined share of capacity, compresses every phase
//! result to its specification before later phases see it, and evicts stored
//! results only when no unexecuted phase still needs them.
//!
//! # Getting started
//!
//! ```ignore
//! use cinch_orchestra::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let source = Arc::new(DirectorySource::new("agents"));
//!     let orchestrator = Orchestrator::new(OrchestraConfig::default(), source)?
//!         .with_event_handler(LoggingHandler);
//!
//!     let request = OrchestrationRequest::new("Admin dashboard with RBAC")
//!         .with_feature("audit log");
//!     let output = orchestrator.execute_request(&request).await;
//!
//!     println!("{}", serde_json::to_string_pretty(&output)?);
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Budget accounting:** [`ResourceTracker`](budget::ResourceTracker)
//!   admits loads against `floor(capacity × margin)` and reclaims
//!   largest-first under pressure.
//! - **Loading modules:** [`ModuleLoader`](modules::ModuleLoader) loads
//!   summary, core, and detail variants, caches them, and keeps frequently
//!   used modules resident between phases.
//! - **Ordering phases:** [`DependencyGraph`](graph::DependencyGraph) orders
//!   phases and computes which stored results must survive eviction.
//! - **Storing results:** [`MemoryStore`](memory::MemoryStore) compresses,
//!   prioritizes, and evicts phase results.
//! - **Running phases:** [`PhaseExecutor`](phase::PhaseExecutor) loads a
//!   phase's agents, runs them with bounded fan-out under a timeout, and
//!   commits the merged result.
//! - **Running requests:** [`Orchestrator`](orchestrator::Orchestrator)
//!   plans, sequences phases, recovers from budget pressure, checkpoints,
//!   and assembles output.
//! - **Writing agents:** implement [`Agent`](agent::Agent) and register it
//!   in an [`AgentRegistry`](agent::AgentRegistry).
//! - **Observing runs:** implement [`EventHandler`](events::EventHandler).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`budget`] | Resource tracker and unit estimation |
//! | [`modules`] | Module sources, descriptors, cache, loader, preload prediction |
//! | [`agent`] | `Agent` trait, registry, closure and fallback agents |
//! | [`graph`] | Phase dependency graph and critical rules |
//! | [`memory`] | Result compression and the memory store |
//! | [`phase`] | Phase definitions, plans, per-run context, executor |
//! | [`orchestrator`] | Classification, the run state machine, output assembly |
//! | [`events`] | Run events and handlers |
//! | [`checkpoint`] | Run checkpoints for resumption |

pub mod agent;
pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod memory;
pub mod modules;
pub mod orchestrator;
pub mod phase;
pub mod prelude;
pub mod request;

pub use error::{ErrorKind, OrchestraError, Result};

// Re-export schemars for callers deriving request extensions.
pub use schemars;
