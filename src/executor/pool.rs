//! Prioritised thread pool.
//!
//! One pool owns N worker threads and a set of *executor groups*. Each
//! group owns executors, each with its own prioritised queue, a
//! parallelism cap, and a hold time telling workers how long to stay
//! with the executor before looking elsewhere. Priorities are only
//! directly comparable between executors whose groups share a
//! *division*; across divisions the pool balances on group parallelism
//! and recency instead.
//!
//! Workers select an executor under the pool lock, drain it until it
//! runs dry, the hold deadline passes, a high-priority alert arrives,
//! or the worker/executor is halted, and then return it. Idle workers
//! spin briefly and then park; queueing a task at [`Priority::High`] or
//! above wakes an idle worker, or leaves a sticky alert on a busy one
//! so it drops its current executor at the next poll boundary.

use crate::error::QueueError;
use crate::executor::priority::Priority;
use crate::executor::queue::{PrioritisedTask, PrioritisedTaskQueue, TaskListener};
use crate::executor::Executor;
use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

/// Tasks at or above this priority alert a worker instead of merely
/// waking one.
const HIGH_PRIORITY_NOTIFY_THRESHOLD: Priority = Priority::High;
/// Scheduling floor for a shut-down executor that still has tasks.
const QUEUE_SHUTDOWN_PRIORITY: Priority = Priority::High;

/// How long an idle worker spins (repolling) before parking.
const WORKER_SPIN_WAIT: Duration = Duration::from_micros(100);
/// Park slice between repolls during the spin phase.
const WORKER_PARK_SLICE: Duration = Duration::from_micros(10);

/// Configuration for a [`PrioritisedThreadPool`].
#[derive(Clone)]
pub struct PoolOptions {
    /// Worker thread name prefix; the worker index is appended.
    pub thread_name_prefix: String,
    /// Callback invoked on each worker thread as it starts.
    pub on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback invoked on each worker thread as it stops.
    pub on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            thread_name_prefix: "gridlock-worker".to_string(),
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl std::fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOptions")
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

struct Worker {
    id: usize,
    parked: CachePadded<AtomicBool>,
    alerted_high: CachePadded<AtomicBool>,
    halted: AtomicBool,
    shutdown: AtomicBool,
    thread: OnceLock<Thread>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(id: usize) -> Self {
        Self {
            id,
            parked: CachePadded::new(AtomicBool::new(false)),
            alerted_high: CachePadded::new(AtomicBool::new(false)),
            halted: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            thread: OnceLock::new(),
            handle: Mutex::new(None),
        }
    }

    /// Wakes the worker if it is parked. Returns `true` only when this
    /// call performed the wake.
    fn notify_tasks(&self) -> bool {
        if self.parked.load(Ordering::SeqCst) && self.parked.swap(false, Ordering::SeqCst) {
            if let Some(thread) = self.thread.get() {
                thread.unpark();
            }
            return true;
        }
        false
    }

    /// Wakes the worker, or leaves a sticky alert so it drops its
    /// current executor at the next poll boundary.
    fn alert_high_priority(&self) -> bool {
        if self.notify_tasks() {
            return true;
        }
        self.alerted_high.store(true, Ordering::SeqCst);
        false
    }

    fn consume_alert(&self) -> bool {
        self.alerted_high.load(Ordering::SeqCst) && self.alerted_high.swap(false, Ordering::SeqCst)
    }

    /// Asks the worker to exit after draining what it can.
    fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.parked.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Asks the worker to exit without draining.
    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
        self.parked.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    fn run_loop(&self, pool: &PoolInner) {
        'main: loop {
            self.poll_tasks(pool);

            // spin phase: repoll in short park slices before committing
            // to a full park
            let spin_start = Instant::now();
            loop {
                thread::yield_now();
                thread::park_timeout(WORKER_PARK_SLICE);

                if self.poll_tasks(pool) {
                    continue 'main;
                }
                if self.handle_close(pool) {
                    return;
                }
                if spin_start.elapsed() >= WORKER_SPIN_WAIT {
                    break;
                }
            }

            if self.handle_close(pool) {
                return;
            }

            self.parked.store(true, Ordering::SeqCst);

            // re-poll after publishing the parked flag: a task queued
            // between the last poll and the store would not notify us
            if self.poll_tasks(pool) {
                self.parked.store(false, Ordering::SeqCst);
                continue;
            }

            if self.handle_close(pool) {
                return;
            }

            // park() can return spuriously; the flag is the condition
            while self.parked.load(Ordering::SeqCst) {
                thread::park();
            }
        }
    }

    fn handle_close(&self, pool: &PoolInner) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            // drain once more so close() leaves no runnable task behind
            self.poll_tasks(pool);
            return true;
        }
        false
    }

    /// Drains executors until none are obtainable. Returns whether any
    /// task was executed.
    fn poll_tasks(&self, pool: &PoolInner) -> bool {
        let mut ret = false;

        loop {
            if self.halted.load(Ordering::SeqCst) {
                break;
            }
            let Some(executor) = pool.obtain_queue() else {
                break;
            };
            let deadline = Instant::now() + executor.hold_time;
            loop {
                if self.halted.load(Ordering::SeqCst) || executor.halted.load(Ordering::SeqCst) {
                    break;
                }
                match catch_unwind(AssertUnwindSafe(|| executor.queue.execute_task())) {
                    Ok(true) => ret = true,
                    Ok(false) => break,
                    Err(_payload) => {
                        tracing::error!(worker = self.id, "task panicked in pool worker");
                        ret = true;
                    }
                }
                if self.consume_alert() || Instant::now() > deadline {
                    break;
                }
            }
            pool.return_queue(&executor);
        }

        ret
    }
}

struct PoolInner {
    options: PoolOptions,
    epoch: Instant,
    /// The pool monitor: executor selection, parallelism counters, and
    /// registry mutations serialise on this.
    sel_lock: Mutex<()>,
    shutdown: AtomicBool,
    groups: RwLock<Vec<Arc<GroupInner>>>,
    workers: RwLock<Vec<Arc<Worker>>>,
    alive: RwLock<Vec<Arc<Worker>>>,
    next_worker_id: AtomicUsize,
}

impl PoolInner {
    fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Selects the executor a worker should drain next, bumping its
    /// parallelism counters. `None` when nothing is runnable.
    fn obtain_queue(&self) -> Option<Arc<ExecInner>> {
        let now = self.now_nanos();
        let _guard = self.sel_lock.lock();

        let mut best: Option<(Arc<ExecInner>, Priority, Arc<GroupInner>)> = None;

        let groups = self.groups.read().clone();
        for group in groups {
            let mut group_best: Option<(Arc<ExecInner>, Priority)> = None;

            let executors = group.executors.read().clone();
            for executor in executors {
                let max = executor.max_parallelism.load(Ordering::SeqCst);
                if max > 0 && executor.current_parallelism.load(Ordering::SeqCst) >= max {
                    continue;
                }
                let Some(priority) = executor.target_priority() else {
                    continue;
                };
                let replace = match &group_best {
                    None => true,
                    Some((incumbent, incumbent_priority)) => {
                        better_inside_group(&executor, priority, incumbent, *incumbent_priority)
                    }
                };
                if replace {
                    group_best = Some((executor, priority));
                }
            }

            let Some((candidate, candidate_priority)) = group_best else {
                continue;
            };
            let replace = match &best {
                None => true,
                Some((incumbent, incumbent_priority, incumbent_group)) => better_across_groups(
                    &candidate,
                    candidate_priority,
                    &group,
                    incumbent,
                    *incumbent_priority,
                    incumbent_group,
                ),
            };
            if replace {
                best = Some((candidate, candidate_priority, group));
            }
        }

        let (executor, _, group) = best?;
        executor.last_retrieved.store(now, Ordering::SeqCst);
        executor.current_parallelism.fetch_add(1, Ordering::SeqCst);
        group.current_parallelism.fetch_add(1, Ordering::SeqCst);
        Some(executor)
    }

    fn return_queue(&self, executor: &Arc<ExecInner>) {
        {
            let _guard = self.sel_lock.lock();
            executor.current_parallelism.fetch_sub(1, Ordering::SeqCst);
            if let Some(group) = executor.group.upgrade() {
                group.current_parallelism.fetch_sub(1, Ordering::SeqCst);
            }
        }

        if executor.queue.is_shutdown() && executor.queue.has_no_scheduled_tasks() {
            if let Some(group) = executor.group.upgrade() {
                group.remove_executor(executor);
            }
        }
    }

    fn notify_all_threads(&self) {
        let workers = self.workers.read().clone();
        for worker in workers {
            worker.notify_tasks();
        }
    }

    fn die(&self, worker: &Arc<Worker>) {
        self.alive.write().retain(|w| !Arc::ptr_eq(w, worker));
    }
}

fn worker_main(pool: Arc<PoolInner>, me: Arc<Worker>) {
    let _ = me.thread.set(thread::current());
    if let Some(callback) = &pool.options.on_thread_start {
        callback();
    }

    me.run_loop(&pool);

    pool.die(&me);
    if let Some(callback) = &pool.options.on_thread_stop {
        callback();
    }
}

/// Candidate beats incumbent within one group on
/// `(priority, executor parallelism, last retrieved)`.
fn better_inside_group(
    candidate: &ExecInner,
    candidate_priority: Priority,
    incumbent: &ExecInner,
    incumbent_priority: Priority,
) -> bool {
    let key = |executor: &ExecInner, priority: Priority| {
        (
            priority.ordinal(),
            executor.current_parallelism.load(Ordering::SeqCst),
            executor.last_retrieved.load(Ordering::SeqCst),
        )
    };
    key(candidate, candidate_priority) < key(incumbent, incumbent_priority)
}

/// Candidate beats incumbent across groups. Priorities are only
/// comparable inside a division; otherwise group parallelism and
/// recency decide.
fn better_across_groups(
    candidate: &ExecInner,
    candidate_priority: Priority,
    candidate_group: &GroupInner,
    incumbent: &ExecInner,
    incumbent_priority: Priority,
    incumbent_group: &GroupInner,
) -> bool {
    if candidate_group.division == incumbent_group.division
        && candidate_priority.ordinal() != incumbent_priority.ordinal()
    {
        return candidate_priority.ordinal() < incumbent_priority.ordinal();
    }

    let key = |executor: &ExecInner, group: &GroupInner| {
        (
            group.current_parallelism.load(Ordering::SeqCst),
            executor.last_retrieved.load(Ordering::SeqCst),
        )
    };
    key(candidate, candidate_group) < key(incumbent, incumbent_group)
}

struct GroupInner {
    pool: Weak<PoolInner>,
    division: i32,
    suborder_gen: AtomicI64,
    current_parallelism: AtomicI32,
    executors: RwLock<Vec<Arc<ExecInner>>>,
}

impl GroupInner {
    fn remove_executor(&self, executor: &Arc<ExecInner>) {
        self.executors
            .write()
            .retain(|e| !Arc::ptr_eq(e, executor));
    }
}

struct ExecInner {
    group: Weak<GroupInner>,
    queue: PrioritisedTaskQueue,
    max_parallelism: AtomicI32,
    hold_time: Duration,
    current_parallelism: AtomicI32,
    halted: AtomicBool,
    last_retrieved: AtomicU64,
}

impl ExecInner {
    /// The priority this executor competes at: its queue head, floored
    /// at [`QUEUE_SHUTDOWN_PRIORITY`] once shut down so pending work
    /// drains promptly. `None` means nothing to run.
    fn target_priority(&self) -> Option<Priority> {
        let head = self.queue.highest_priority();
        if !self.queue.is_shutdown() {
            return head;
        }
        Some(match head {
            None => QUEUE_SHUTDOWN_PRIORITY,
            Some(priority) => Priority::max(priority, QUEUE_SHUTDOWN_PRIORITY),
        })
    }

    fn can_notify(&self) -> bool {
        if self.halted.load(Ordering::SeqCst) {
            return false;
        }
        let max = self.max_parallelism.load(Ordering::SeqCst);
        max <= 0 || self.current_parallelism.load(Ordering::SeqCst) < max
    }

    fn with_pool(&self, f: impl FnOnce(&PoolInner)) {
        if let Some(group) = self.group.upgrade() {
            if let Some(pool) = group.pool.upgrade() {
                f(&pool);
            }
        }
    }

    fn notify_scheduled(&self) {
        if !self.can_notify() {
            return;
        }
        self.with_pool(|pool| {
            let workers = pool.workers.read().clone();
            for worker in workers {
                if worker.notify_tasks() {
                    return;
                }
            }
        });
    }

    fn notify_high_priority(&self) {
        if !self.can_notify() {
            return;
        }
        self.with_pool(|pool| {
            let workers = pool.workers.read().clone();
            for worker in workers {
                if worker.alert_high_priority() {
                    return;
                }
            }
        });
    }

    fn shutdown(self: &Arc<Self>) -> bool {
        if !self.queue.shutdown() {
            return false;
        }
        if self.queue.has_no_scheduled_tasks() {
            if let Some(group) = self.group.upgrade() {
                group.remove_executor(self);
            }
        }
        true
    }
}

impl TaskListener for ExecInner {
    fn on_queued(&self, priority: Priority) {
        if priority.is_higher_or_equal(HIGH_PRIORITY_NOTIFY_THRESHOLD) {
            self.notify_high_priority();
        } else {
            self.notify_scheduled();
        }
    }

    fn on_priority_raised(&self, priority: Priority) {
        if priority.is_higher_or_equal(HIGH_PRIORITY_NOTIFY_THRESHOLD) {
            self.notify_high_priority();
        }
    }
}

/// A pool of worker threads draining prioritised executors.
///
/// The pool starts with zero threads; call
/// [`adjust_thread_count`](Self::adjust_thread_count) to size it.
#[derive(Clone)]
pub struct PrioritisedThreadPool {
    inner: Arc<PoolInner>,
}

impl PrioritisedThreadPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new(options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                epoch: Instant::now(),
                sel_lock: Mutex::new(()),
                shutdown: AtomicBool::new(false),
                groups: RwLock::new(Vec::new()),
                workers: RwLock::new(Vec::new()),
                alive: RwLock::new(Vec::new()),
                next_worker_id: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of worker threads that have not yet fully exited.
    #[must_use]
    pub fn alive_threads(&self) -> usize {
        self.inner.alive.read().len()
    }

    /// Number of worker threads the pool currently targets.
    #[must_use]
    pub fn core_threads(&self) -> usize {
        self.inner.workers.read().len()
    }

    /// Returns whether the pool has been shut down or halted.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Creates an executor group in `division`. `flags` is reserved.
    ///
    /// # Panics
    ///
    /// Panics if the pool has been shut down.
    pub fn create_executor_group(&self, division: i32, flags: u32) -> ExecutorGroup {
        let _ = flags;
        let _guard = self.inner.sel_lock.lock();
        assert!(
            !self.inner.shutdown.load(Ordering::SeqCst),
            "thread pool is shutdown"
        );
        let group = Arc::new(GroupInner {
            pool: Arc::downgrade(&self.inner),
            division,
            suborder_gen: AtomicI64::new(0),
            current_parallelism: AtomicI32::new(0),
            executors: RwLock::new(Vec::new()),
        });
        self.inner.groups.write().push(Arc::clone(&group));
        ExecutorGroup { inner: group }
    }

    /// Grows or shrinks the worker set to `threads`. No-op once the
    /// pool is shut down.
    pub fn adjust_thread_count(&self, threads: usize) {
        let _guard = self.inner.sel_lock.lock();
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let current = self.inner.workers.read().clone();
        if threads == current.len() {
            return;
        }

        if threads < current.len() {
            for worker in current.iter().rev().take(current.len() - threads) {
                worker.halt();
                self.inner
                    .workers
                    .write()
                    .retain(|w| !Arc::ptr_eq(w, worker));
            }
        } else {
            for _ in 0..(threads - current.len()) {
                self.spawn_worker();
            }
        }
    }

    fn spawn_worker(&self) {
        let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(Worker::new(id));
        self.inner.alive.write().push(Arc::clone(&worker));
        self.inner.workers.write().push(Arc::clone(&worker));

        let pool = Arc::clone(&self.inner);
        let me = Arc::clone(&worker);
        let name = format!("{}-{}", self.inner.options.thread_name_prefix, id);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_main(pool, me))
            .expect("failed to spawn pool worker thread");
        *worker.handle.lock() = Some(handle);
    }

    /// Shuts the pool down: every executor queue stops accepting tasks,
    /// workers drain what remains and exit. Optionally waits for them.
    pub fn shutdown(&self, wait: bool) {
        {
            let _guard = self.inner.sel_lock.lock();
            self.inner.shutdown.store(true, Ordering::SeqCst);
        }

        let groups = self.inner.groups.read().clone();
        for group in &groups {
            let executors = group.executors.read().clone();
            for executor in &executors {
                executor.shutdown();
            }
        }

        let workers = self.inner.workers.read().clone();
        for worker in &workers {
            worker.close();
        }

        if wait {
            self.join(None);
        }
    }

    /// Stops the pool without draining: workers exit at the next task
    /// boundary. Optionally shuts down the executor queues too.
    pub fn halt(&self, shutdown_queues: bool) {
        {
            let _guard = self.inner.sel_lock.lock();
            self.inner.shutdown.store(true, Ordering::SeqCst);
        }

        if shutdown_queues {
            let groups = self.inner.groups.read().clone();
            for group in &groups {
                let executors = group.executors.read().clone();
                for executor in &executors {
                    executor.queue.shutdown();
                }
            }
        }

        let workers = self.inner.workers.read().clone();
        for worker in &workers {
            worker.halt();
        }
    }

    /// Waits until every worker has exited, or `timeout` passes.
    /// Returns `false` on timeout. `None` waits indefinitely.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.inner.alive.read().is_empty() {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            thread::sleep(Duration::from_millis(2));
        }

        // every worker has left its loop; reap the finished handles
        let workers = self.inner.workers.read().clone();
        for worker in workers {
            if let Some(handle) = worker.handle.lock().take() {
                let _ = handle.join();
            }
        }
        true
    }
}

impl std::fmt::Debug for PrioritisedThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrioritisedThreadPool")
            .field("core_threads", &self.core_threads())
            .field("alive_threads", &self.alive_threads())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// A set of executors whose priorities are compared within one
/// division.
#[derive(Clone)]
pub struct ExecutorGroup {
    inner: Arc<GroupInner>,
}

impl ExecutorGroup {
    /// The division this group schedules in.
    #[must_use]
    pub fn division(&self) -> i32 {
        self.inner.division
    }

    /// Creates an executor in this group. `max_parallelism <= 0` means
    /// unlimited; `hold_time` bounds how long one worker stays with the
    /// executor per selection. `flags` is reserved.
    ///
    /// # Panics
    ///
    /// Panics if the pool has been shut down.
    pub fn create_executor(
        &self,
        max_parallelism: i32,
        hold_time: Duration,
        flags: u32,
    ) -> PoolExecutor {
        let _ = flags;
        let pool = self
            .inner
            .pool
            .upgrade()
            .expect("thread pool dropped before its executor group");
        let _guard = pool.sel_lock.lock();
        assert!(!pool.shutdown.load(Ordering::SeqCst), "thread pool is shutdown");

        let executor = Arc::new(ExecInner {
            group: Arc::downgrade(&self.inner),
            queue: PrioritisedTaskQueue::new(),
            max_parallelism: AtomicI32::new(max_parallelism),
            hold_time,
            current_parallelism: AtomicI32::new(0),
            halted: AtomicBool::new(false),
            last_retrieved: AtomicU64::new(pool.now_nanos()),
        });
        self.inner.executors.write().push(Arc::clone(&executor));
        PoolExecutor { inner: executor }
    }

    /// Snapshot of the group's current executors.
    #[must_use]
    pub fn executors(&self) -> Vec<PoolExecutor> {
        self.inner
            .executors
            .read()
            .iter()
            .map(|inner| PoolExecutor {
                inner: Arc::clone(inner),
            })
            .collect()
    }

    /// Returns the next value from the group's suborder counter.
    pub fn generate_next_suborder(&self) -> i64 {
        self.inner.suborder_gen.fetch_add(1, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ExecutorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorGroup")
            .field("division", &self.inner.division)
            .field("executors", &self.inner.executors.read().len())
            .finish()
    }
}

/// An executor scheduled on the pool: a prioritised queue plus the
/// scheduling knobs workers use to pick it.
#[derive(Clone)]
pub struct PoolExecutor {
    inner: Arc<ExecInner>,
}

impl PoolExecutor {
    /// Creates a task bound to this executor without queueing it.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is not schedulable.
    pub fn create_task(
        &self,
        run: impl FnOnce() + Send + 'static,
        priority: Priority,
    ) -> PrioritisedTask {
        let sub_order = self.generate_next_suborder();
        self.create_task_with_suborder(run, priority, sub_order)
    }

    /// Creates a task with an explicit suborder without queueing it.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is not schedulable.
    pub fn create_task_with_suborder(
        &self,
        run: impl FnOnce() + Send + 'static,
        priority: Priority,
        sub_order: i64,
    ) -> PrioritisedTask {
        let inner_dyn: Arc<dyn TaskListener> = self.inner.clone();
        let listener: Weak<dyn TaskListener> = Arc::downgrade(&inner_dyn);
        self.inner
            .queue
            .create_task_raw(Box::new(run), priority, sub_order, Some(listener))
    }

    /// Creates and queues a task; wakes or alerts a worker.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Shutdown`] if the executor has been shut
    /// down.
    pub fn queue_task(
        &self,
        run: impl FnOnce() + Send + 'static,
        priority: Priority,
    ) -> Result<PrioritisedTask, QueueError> {
        let task = self.create_task(run, priority);
        task.queue()?;
        Ok(task)
    }

    /// Creates and queues a task with an explicit suborder.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Shutdown`] if the executor has been shut
    /// down.
    pub fn queue_task_with_suborder(
        &self,
        run: impl FnOnce() + Send + 'static,
        priority: Priority,
        sub_order: i64,
    ) -> Result<PrioritisedTask, QueueError> {
        let task = self.create_task_with_suborder(run, priority, sub_order);
        task.queue()?;
        Ok(task)
    }

    /// Executes the executor's lowest-ordered task on the calling
    /// thread.
    pub fn execute_task(&self) -> bool {
        self.inner.queue.execute_task()
    }

    /// Returns the next value from the owning group's suborder counter.
    pub fn generate_next_suborder(&self) -> i64 {
        self.inner
            .group
            .upgrade()
            .map_or(0, |group| group.suborder_gen.fetch_add(1, Ordering::SeqCst))
    }

    /// Shuts the executor's queue down; the executor detaches from its
    /// group once drained. Returns `true` for the call that performed
    /// the transition.
    pub fn shutdown(&self) -> bool {
        self.inner.shutdown()
    }

    /// Returns whether the executor's queue has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.queue.is_shutdown()
    }

    /// Detaches the executor from its group without shutting the queue
    /// down or waiting for queued tasks.
    pub fn halt(&self) {
        self.inner.halted.store(true, Ordering::SeqCst);
        if let Some(group) = self.inner.group.upgrade() {
            group.remove_executor(&self.inner);
        }
    }

    /// Returns whether the executor is running or scheduled to run
    /// tasks; for a live executor, whether it can still accept them.
    #[must_use]
    pub fn is_active(&self) -> bool {
        if self.inner.halted.load(Ordering::SeqCst) {
            return self.inner.current_parallelism.load(Ordering::SeqCst) > 0;
        }
        if !self.is_shutdown() {
            return true;
        }
        !self.inner.queue.has_no_scheduled_tasks()
    }

    /// Updates the parallelism cap (`<= 0` means unlimited) and
    /// re-notifies workers, which may now be able to pick this executor.
    pub fn set_max_parallelism(&self, max_parallelism: i32) {
        self.inner
            .max_parallelism
            .store(max_parallelism, Ordering::SeqCst);
        if self.inner.target_priority().is_some() {
            self.inner.with_pool(PoolInner::notify_all_threads);
        }
    }

    /// The current parallelism cap.
    #[must_use]
    pub fn max_parallelism(&self) -> i32 {
        self.inner.max_parallelism.load(Ordering::SeqCst)
    }

    /// Number of workers currently draining this executor.
    #[must_use]
    pub fn current_parallelism(&self) -> i32 {
        self.inner.current_parallelism.load(Ordering::SeqCst)
    }

    /// Total number of tasks ever queued to this executor.
    #[must_use]
    pub fn total_tasks_scheduled(&self) -> u64 {
        self.inner.queue.total_tasks_scheduled()
    }

    /// Total number of queued tasks that have executed or been
    /// cancelled.
    #[must_use]
    pub fn total_tasks_executed(&self) -> u64 {
        self.inner.queue.total_tasks_executed()
    }
}

impl Executor for PoolExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) -> Result<(), QueueError> {
        let inner_dyn: Arc<dyn TaskListener> = self.inner.clone();
        let listener: Weak<dyn TaskListener> = Arc::downgrade(&inner_dyn);
        let task = self.inner.queue.create_task_raw(
            job,
            Priority::Normal,
            self.generate_next_suborder(),
            Some(listener),
        );
        task.queue().map(|_| ())
    }
}

impl std::fmt::Debug for PoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolExecutor")
            .field("max_parallelism", &self.max_parallelism())
            .field("current_parallelism", &self.current_parallelism())
            .field("shutdown", &self.is_shutdown())
            .field("halted", &self.inner.halted.load(Ordering::SeqCst))
            .finish()
    }
}
