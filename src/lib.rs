//! Gridlock: concurrent primitives for latency-sensitive server
//! runtimes.
//!
//! # Overview
//!
//! Gridlock packages the coordination building blocks a region-parallel
//! server needs without paying for coarse locks:
//!
//! - [`Completable`]: a single-assignment completion future with
//!   chained continuations, executor dispatch, and a parking `join`.
//! - [`ConcurrentLongMap`]: an `i64`-keyed chained hash table with
//!   lock-free readers, per-bucket writer locks, and incremental
//!   resizing behind redirect entries.
//! - [`ReentrantAreaLock`]: a reentrant 2-D range lock over section
//!   coordinates, built on the map.
//! - [`PrioritisedThreadPool`] with [`PrioritisedTaskQueue`]: shared
//!   worker threads draining executor groups by priority, with
//!   parallelism caps, hold times, and high-priority preemption at poll
//!   boundaries.
//!
//! # Memory ordering
//!
//! Every shared field carries an explicit ordering discipline; the
//! happens-before guarantee throughout is the usual concurrent-map one:
//! writes preceding a successful completion, insertion, or unlock are
//! visible to any thread that subsequently observes it.
//!
//! # Module structure
//!
//! - [`completable`]: completion future and continuation dispatch
//! - [`map`]: the concurrent hash table
//! - [`lock`]: the reentrant area lock
//! - [`executor`]: priorities, the task queue, and the thread pool
//! - [`util`]: key mixing and the striped size counter
//! - [`error`]: shared error types

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::module_name_repetitions)]

pub mod completable;
pub mod error;
pub mod executor;
pub mod lock;
pub mod map;
pub mod util;

pub use completable::{default_executor, Completable, ErrorTransformer, Outcome};
pub use error::{CompletionError, QueueError};
pub use executor::{
    Executor, ExecutorGroup, PoolExecutor, PoolOptions, Priority, PrioritisedTask,
    PrioritisedTaskQueue, PrioritisedThreadPool,
};
pub use lock::{AreaLockNode, ReentrantAreaLock};
pub use map::ConcurrentLongMap;
