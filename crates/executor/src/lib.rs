//! Build-graph execution.
//!
//! The executor walks an analyzed [`wireit_analyzer::BuildGraph`] from its
//! root, memoizing one execution per script, deciding fresh / cached / run
//! per script, bounding concurrent child commands with a worker pool, and
//! managing the lifecycle of long-lived services, including hand-off of
//! running service children between executor iterations in watch mode.

mod child;
mod execute;
mod pool;
mod service;
mod state;

pub use child::ScriptChild;
pub use execute::{Executor, ExecutorOptions, FailureMode, Outcome, SuccessKind};
pub use pool::WorkerPool;
pub use service::{AdoptableService, ServiceHandle, ServiceMap, ServiceState};
