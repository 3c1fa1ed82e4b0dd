//! Prioritised task scheduling: the [`Priority`] ladder, the ordered
//! task queue, and the shared thread pool that drains it.

pub mod pool;
pub mod priority;
pub mod queue;

pub use pool::{ExecutorGroup, PoolExecutor, PoolOptions, PrioritisedThreadPool};
pub use priority::Priority;
pub use queue::{PrioritisedTask, PrioritisedTaskQueue};

use crate::error::QueueError;

/// Something that accepts units of work for eventual execution.
///
/// Continuation dispatch in [`Completable`](crate::Completable) and the
/// async constructors go through this seam; the pool's
/// [`PoolExecutor`] is the primary implementation.
pub trait Executor: Send + Sync {
    /// Submits a job. `Err` means the job was refused (and dropped);
    /// callers that must observe the failure route it through their own
    /// error channel.
    fn execute(&self, job: Box<dyn FnOnce() + Send>) -> Result<(), QueueError>;
}
