//! Run lifecycle events and their handlers.
//!
//! The orchestrator reports what it is doing through [`OrchestraEvent`]
//! variants, from plan creation through per-phase execution to the final
//! result. Callers implement [`EventHandler`] to feed usage trackers,
//! dashboards, or logs.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget runs |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`EventObserver`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::error::OrchestraError;
use crate::modules::ModuleKey;
use crate::orchestrator::RunState;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum OrchestraEvent<'a> {
    /// A plan was built (or loaded for resumption).
    PlanCreated {
        run_id: &'a str,
        phases: usize,
        total_budget: u64,
    },
    /// The run moved between states.
    StateChanged { from: RunState, to: RunState },
    /// A phase is about to run. `attempt` is 2 for the narrowed retry.
    PhaseStarted {
        phase_id: &'a str,
        index: usize,
        total: usize,
        attempt: u32,
    },
    /// A module was loaded for a phase.
    ModuleLoaded {
        phase_id: &'a str,
        module: &'a ModuleKey,
        size: u64,
    },
    /// An optional agent was dropped from a phase.
    AgentDropped {
        phase_id: &'a str,
        agent: &'a str,
        reason: &'a str,
    },
    /// A phase committed its result.
    PhaseCompleted {
        phase_id: &'a str,
        elapsed_ms: u64,
        result_size: u64,
    },
    /// A phase attempt failed.
    PhaseFailed {
        phase_id: &'a str,
        error: &'a OrchestraError,
    },
    /// A recovery strategy is being applied to a phase.
    Recovery { phase_id: &'a str, action: &'a str },
    /// Stored results were evicted from the memory store.
    Eviction { evicted: &'a [String], freed: u64 },
    /// A run checkpoint was written.
    CheckpointSaved { run_id: &'a str, path: &'a str },
    /// The run ended.
    RunFinished {
        run_id: &'a str,
        success: bool,
        phases_completed: usize,
        budget_used: u64,
    },
}

/// Observer for orchestration events.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &OrchestraEvent<'_>) {
        let _ = event;
    }
}

/// A no-op event handler.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = EventObserver::new(|event| {
///     if let OrchestraEvent::PhaseCompleted { phase_id, .. } = event {
///         println!("done: {phase_id}");
///     }
/// });
/// ```
pub struct EventObserver<F>(F)
where
    F: Fn(&OrchestraEvent<'_>) + Send + Sync;

impl<F> EventObserver<F>
where
    F: Fn(&OrchestraEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for EventObserver<F>
where
    F: Fn(&OrchestraEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &OrchestraEvent<'_>) {
        (self.0)(event);
    }
}

/// Dispatches every event to each inner handler in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(usage_tracker);
/// ```
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Conditionally add a handler to the chain.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &OrchestraEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// An event handler that logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &OrchestraEvent<'_>) {
        match event {
            OrchestraEvent::PlanCreated {
                run_id,
                phases,
                total_budget,
            } => {
                info!("[{run_id}] Plan: {phases} phase(s), {total_budget} units estimated");
            }
            OrchestraEvent::StateChanged { from, to } => {
                debug!("State: {from} → {to}");
            }
            OrchestraEvent::PhaseStarted {
                phase_id,
                index,
                total,
                attempt,
            } => {
                if *attempt > 1 {
                    info!("[phase {}/{total}] {phase_id} (retry {attempt})", index + 1);
                } else {
                    info!("[phase {}/{total}] {phase_id}", index + 1);
                }
            }
            OrchestraEvent::ModuleLoaded {
                phase_id,
                module,
                size,
            } => {
                debug!("{phase_id}: loaded {module} ({size} units)");
            }
            OrchestraEvent::AgentDropped {
                phase_id,
                agent,
                reason,
            } => {
                warn!("{phase_id}: dropped optional agent {agent}: {reason}");
            }
            OrchestraEvent::PhaseCompleted {
                phase_id,
                elapsed_ms,
                result_size,
            } => {
                info!("{phase_id} completed in {elapsed_ms}ms ({result_size} units stored)");
            }
            OrchestraEvent::PhaseFailed { phase_id, error } => {
                warn!("{phase_id} failed: {error}");
            }
            OrchestraEvent::Recovery { phase_id, action } => {
                info!("{phase_id}: recovering via {action}");
            }
            OrchestraEvent::Eviction { evicted, freed } => {
                info!("Evicted {} stored result(s), freed {freed} units", evicted.len());
            }
            OrchestraEvent::CheckpointSaved { run_id, path } => {
                debug!("[{run_id}] Checkpoint saved: {path}");
            }
            OrchestraEvent::RunFinished {
                run_id,
                success,
                phases_completed,
                budget_used,
            } => {
                if *success {
                    info!("[{run_id}] Finished: {phases_completed} phase(s), peak {budget_used} units");
                } else {
                    warn!("[{run_id}] Failed after {phases_completed} phase(s), peak {budget_used} units");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn composite_dispatches_to_all_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = Arc::clone(&seen);
        let b = Arc::clone(&seen);
        let handler = CompositeEventHandler::new()
            .with(NoopHandler)
            .with(EventObserver::new(move |e| {
                if let OrchestraEvent::Recovery { phase_id, .. } = e {
                    a.lock().unwrap().push(format!("a:{phase_id}"));
                }
            }))
            .with_if(false, LoggingHandler)
            .with(EventObserver::new(move |e| {
                if let OrchestraEvent::Recovery { action, .. } = e {
                    b.lock().unwrap().push(format!("b:{action}"));
                }
            }));
        assert_eq!(handler.len(), 3);

        handler.on_event(&OrchestraEvent::Recovery {
            phase_id: "backend",
            action: "narrow_to_core",
        });
        assert_eq!(*seen.lock().unwrap(), vec!["a:backend", "b:narrow_to_core"]);
    }

    #[test]
    fn logging_handler_accepts_every_event() {
        let err = OrchestraError::PlanInvalid("x".into());
        let key = ModuleKey::core("m");
        let evicted = vec!["p".to_string()];
        let events = [
            OrchestraEvent::PlanCreated { run_id: "r", phases: 1, total_budget: 10 },
            OrchestraEvent::StateChanged { from: RunState::Planning, to: RunState::Assembling },
            OrchestraEvent::PhaseStarted { phase_id: "p", index: 0, total: 1, attempt: 2 },
            OrchestraEvent::ModuleLoaded { phase_id: "p", module: &key, size: 5 },
            OrchestraEvent::AgentDropped { phase_id: "p", agent: "a", reason: "r" },
            OrchestraEvent::PhaseCompleted { phase_id: "p", elapsed_ms: 1, result_size: 2 },
            OrchestraEvent::PhaseFailed { phase_id: "p", error: &err },
            OrchestraEvent::Eviction { evicted: &evicted, freed: 3 },
            OrchestraEvent::CheckpointSaved { run_id: "r", path: "/tmp/x" },
            OrchestraEvent::RunFinished { run_id: "r", success: false, phases_completed: 0, budget_used: 0 },
        ];
        for event in &events {
            LoggingHandler.on_event(event);
        }
    }
}
