//! Parallel execution of operations over a dependency graph
//!
//! Operations such as starting or stopping containers run concurrently,
//! ordered by their dependencies and bounded by a process-wide limit plus
//! an optional per-run limit.

pub mod context;
pub mod executor;
pub mod graph;
pub mod limit;
pub mod state;

pub use context::ExecContext;
pub use executor::{
    parallel_execute, Collected, Dependency, Object, Outcome, OutcomeStatus, ParallelExecution,
    ParallelIter,
};
pub use limit::{GlobalLimit, LocalLimit, Semaphore, DEFAULT_PARALLEL_LIMIT};
pub use state::ExecutionState;

use std::time::Duration;

/// How long blocking loops wait on their queue before re-checking state
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
