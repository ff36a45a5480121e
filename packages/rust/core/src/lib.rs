//! Pipeline core: pass handlers and the run orchestrator.
//!
//! A run executes the six fixed passes in order against one job. Each pass
//! is a [`passes::PassHandler`] that reads its predecessors' validated
//! artifacts and writes its own; the [`orchestrator::Orchestrator`] owns
//! the manifest, enforces the gates between passes, and routes count drift
//! to the reconciliation engine.

pub mod orchestrator;
pub mod passes;

pub use orchestrator::{CancelToken, Orchestrator, ProgressReporter, RunOptions, RunSummary, SilentProgress};
pub use passes::{HandlerRegistry, PassContext, PassHandler, PassOutput};
