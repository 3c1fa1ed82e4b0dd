//! Ordered multiset of prioritised tasks.
//!
//! Tasks are totally ordered by `(priority, suborder, id)`; the `id` is
//! a creation counter giving a stable tiebreaker, so two tasks queued at
//! the same priority and suborder execute in creation order. The queue
//! is an ordered index of *holder* records: changing a task's priority
//! or suborder inserts a fresh holder and flags the old one as removed,
//! so pollers simply skip stale holders.
//!
//! Cancellation races with polling through a single arbiter: whichever
//! side first flips the task to [`Priority::Completing`] wins.

use crate::error::QueueError;
use crate::executor::priority::Priority;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Receives scheduling events for tasks created through a pool
/// executor; used to wake or alert worker threads.
pub(crate) trait TaskListener: Send + Sync {
    /// A task was queued at `priority`.
    fn on_queued(&self, priority: Priority);
    /// A queued task's priority was set or raised to `priority`.
    fn on_priority_raised(&self, priority: Priority);
}

/// Sort key for the ordered index. Derived ordering is exactly
/// `(priority ordinal ASC, suborder ASC, id ASC)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HolderKey {
    priority: i8,
    sub_order: i64,
    id: u64,
}

/// A keying record placed into the ordered index. Re-keying a task
/// replaces its holder; the stale holder is flagged removed so a
/// concurrent poll discards it.
struct Holder {
    key: HolderKey,
    task: Arc<TaskInner>,
    removed: AtomicBool,
}

impl Holder {
    /// Flags the holder as removed; returns `true` for the caller that
    /// performed the flip.
    fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::SeqCst)
    }
}

struct TaskState {
    run: Option<Box<dyn FnOnce() + Send>>,
    priority: Priority,
    sub_order: i64,
    holder: Option<Arc<Holder>>,
}

struct TaskInner {
    id: u64,
    queue: Weak<QueueInner>,
    listener: Option<Weak<dyn TaskListener>>,
    state: Mutex<TaskState>,
}

struct QueueInner {
    task_id_gen: AtomicU64,
    scheduled: AtomicU64,
    executed: AtomicU64,
    suborder_gen: AtomicI64,
    shutdown: AtomicBool,
    index: SkipMap<HolderKey, Arc<Holder>>,
}

/// Bumps the executed counter when dropped, so the count survives a
/// panicking task body.
struct ExecutedBump(Weak<QueueInner>);

impl Drop for ExecutedBump {
    fn drop(&mut self) {
        if let Some(queue) = self.0.upgrade() {
            queue.executed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A concurrent task queue ordered by `(priority, suborder, id)`.
///
/// The queue itself never runs anything; workers (or any caller) drain
/// it with [`execute_task`](Self::execute_task).
#[derive(Clone)]
pub struct PrioritisedTaskQueue {
    inner: Arc<QueueInner>,
}

impl Default for PrioritisedTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PrioritisedTaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                task_id_gen: AtomicU64::new(0),
                scheduled: AtomicU64::new(0),
                executed: AtomicU64::new(0),
                suborder_gen: AtomicI64::new(0),
                shutdown: AtomicBool::new(false),
                index: SkipMap::new(),
            }),
        }
    }

    /// Total number of tasks ever queued.
    #[must_use]
    pub fn total_tasks_scheduled(&self) -> u64 {
        self.inner.scheduled.load(Ordering::SeqCst)
    }

    /// Total number of queued tasks that have since executed or been
    /// cancelled.
    #[must_use]
    pub fn total_tasks_executed(&self) -> u64 {
        self.inner.executed.load(Ordering::SeqCst)
    }

    /// Returns the next value from the queue's suborder counter.
    pub fn generate_next_suborder(&self) -> i64 {
        self.inner.suborder_gen.fetch_add(1, Ordering::SeqCst)
    }

    /// Marks the queue as shut down; pending tasks stay queued. Returns
    /// `true` for the call that performed the transition.
    pub fn shutdown(&self) -> bool {
        !self.inner.shutdown.swap(true, Ordering::SeqCst)
    }

    /// Returns whether the queue has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Returns whether every task ever queued has executed or been
    /// cancelled.
    #[must_use]
    pub fn has_no_scheduled_tasks(&self) -> bool {
        // executed is read first: reading scheduled first could observe
        // a concurrent queue+execute pair as executed > scheduled.
        let executed = self.inner.executed.load(Ordering::SeqCst);
        let scheduled = self.inner.scheduled.load(Ordering::SeqCst);
        executed == scheduled
    }

    /// Returns the lowest-ordered queued task, if any.
    #[must_use]
    pub fn peek_first(&self) -> Option<PrioritisedTask> {
        self.inner.index.front().map(|entry| PrioritisedTask {
            inner: Arc::clone(&entry.value().task),
        })
    }

    /// Returns the priority of the lowest-ordered queued task.
    #[must_use]
    pub fn highest_priority(&self) -> Option<Priority> {
        self.inner
            .index
            .front()
            .map(|entry| Priority::from_ordinal(entry.key().priority))
    }

    /// Returns the priority and suborder of the lowest-ordered queued
    /// task.
    #[must_use]
    pub fn highest_priority_suborder(&self) -> Option<(Priority, i64)> {
        self.inner
            .index
            .front()
            .map(|entry| (Priority::from_ordinal(entry.key().priority), entry.key().sub_order))
    }

    /// Creates a task bound to this queue without queueing it.
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
        self.create_task_raw(Box::new(run), priority, sub_order, None)
    }

    pub(crate) fn create_task_raw(
        &self,
        run: Box<dyn FnOnce() + Send>,
        priority: Priority,
        sub_order: i64,
        listener: Option<Weak<dyn TaskListener>>,
    ) -> PrioritisedTask {
        assert!(
            priority.is_schedulable(),
            "invalid scheduling priority: {priority:?}"
        );
        let id = self.inner.task_id_gen.fetch_add(1, Ordering::SeqCst);
        PrioritisedTask {
            inner: Arc::new(TaskInner {
                id,
                queue: Arc::downgrade(&self.inner),
                listener,
                state: Mutex::new(TaskState {
                    run: Some(run),
                    priority,
                    sub_order,
                    holder: None,
                }),
            }),
        }
    }

    /// Creates and queues a task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Shutdown`] if the queue has been shut down.
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
    /// Returns [`QueueError::Shutdown`] if the queue has been shut down.
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

    /// Executes the lowest-ordered non-cancelled task. Returns `false`
    /// when the queue held no runnable task.
    pub fn execute_task(&self) -> bool {
        loop {
            let Some(entry) = self.inner.index.pop_front() else {
                return false;
            };
            let holder = entry.value();
            holder.mark_removed();
            let task = PrioritisedTask {
                inner: Arc::clone(&holder.task),
            };
            if task.execute() {
                return true;
            }
            // lost the completing race (cancelled or re-keyed stale
            // holder); try the next entry
        }
    }

    /// Removes and returns the runnable of the lowest-ordered
    /// non-cancelled task without executing it. The task is marked
    /// completing and counted as executed.
    pub fn poll_task(&self) -> Option<Box<dyn FnOnce() + Send>> {
        loop {
            let entry = self.inner.index.pop_front()?;
            let holder = entry.value();
            holder.mark_removed();
            let task = PrioritisedTask {
                inner: Arc::clone(&holder.task),
            };
            if let Some(run) = task.take_cancelled() {
                return Some(run);
            }
        }
    }
}

impl std::fmt::Debug for PrioritisedTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrioritisedTaskQueue")
            .field("scheduled", &self.total_tasks_scheduled())
            .field("executed", &self.total_tasks_executed())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Handle to a task created on a [`PrioritisedTaskQueue`].
///
/// Handles are cheap to clone; all operations act on the shared task.
#[derive(Clone)]
pub struct PrioritisedTask {
    inner: Arc<TaskInner>,
}

impl PrioritisedTask {
    /// Inserts the task into its queue. Returns `Ok(false)` if it is
    /// already queued or already completing.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Shutdown`] if the queue has been shut down;
    /// a task that raced a concurrent shutdown is cancelled.
    pub fn queue(&self) -> Result<bool, QueueError> {
        let Some(queue) = self.inner.queue.upgrade() else {
            return Err(QueueError::Shutdown);
        };
        let priority;
        {
            let mut state = self.inner.state.lock();
            if state.holder.is_some() || state.priority == Priority::Completing {
                return Ok(false);
            }
            if queue.shutdown.load(Ordering::SeqCst) {
                return Err(QueueError::Shutdown);
            }

            let holder = Arc::new(Holder {
                key: HolderKey {
                    priority: state.priority.ordinal(),
                    sub_order: state.sub_order,
                    id: self.inner.id,
                },
                task: Arc::clone(&self.inner),
                removed: AtomicBool::new(false),
            });
            state.holder = Some(Arc::clone(&holder));
            priority = state.priority;

            queue.scheduled.fetch_add(1, Ordering::SeqCst);
            queue.index.insert(holder.key, holder);
        }

        // A shutdown that raced the insert above may have missed this
        // task; pull it back out.
        if queue.shutdown.load(Ordering::SeqCst) {
            self.cancel();
            return Err(QueueError::Shutdown);
        }

        if let Some(listener) = self.listener() {
            listener.on_queued(priority);
        }
        Ok(true)
    }

    /// Returns whether the task is currently queued and not completing.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        let state = self.inner.state.lock();
        state.holder.is_some() && state.priority != Priority::Completing
    }

    /// Cancels the task. Returns `false` if it already executed or was
    /// already cancelled.
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing {
            return false;
        }
        state.priority = Priority::Completing;
        state.run = None;
        if let Some(holder) = state.holder.take() {
            if holder.mark_removed() {
                if let Some(queue) = self.inner.queue.upgrade() {
                    queue.index.remove(&holder.key);
                }
            }
            if let Some(queue) = self.inner.queue.upgrade() {
                queue.executed.fetch_add(1, Ordering::SeqCst);
            }
        }
        true
    }

    /// Runs the task. Returns `false` if it already executed or was
    /// cancelled.
    pub fn execute(&self) -> bool {
        let run;
        let bump;
        {
            let mut state = self.inner.state.lock();
            if state.priority == Priority::Completing {
                return false;
            }
            state.priority = Priority::Completing;
            bump = state
                .holder
                .is_some()
                .then(|| ExecutedBump(self.inner.queue.clone()));
            if let Some(holder) = state.holder.take() {
                if holder.mark_removed() {
                    if let Some(queue) = self.inner.queue.upgrade() {
                        queue.index.remove(&holder.key);
                    }
                }
            }
            run = state.run.take();
        }
        let _bump = bump;
        if let Some(run) = run {
            run();
        }
        true
    }

    /// Cancels the task and hands back its runnable: the poll path that
    /// wants to run the body itself.
    fn take_cancelled(&self) -> Option<Box<dyn FnOnce() + Send>> {
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing {
            return None;
        }
        state.priority = Priority::Completing;
        let run = state.run.take();
        if let Some(holder) = state.holder.take() {
            if holder.mark_removed() {
                if let Some(queue) = self.inner.queue.upgrade() {
                    queue.index.remove(&holder.key);
                }
            }
            if let Some(queue) = self.inner.queue.upgrade() {
                queue.executed.fetch_add(1, Ordering::SeqCst);
            }
        }
        run
    }

    /// Returns the task's current priority (`Completing` once it has
    /// executed or been cancelled).
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.inner.state.lock().priority
    }

    /// Sets the priority, re-keying the task if queued. Returns `false`
    /// if completing or unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is not schedulable.
    pub fn set_priority(&self, priority: Priority) -> bool {
        assert!(
            priority.is_schedulable(),
            "invalid scheduling priority: {priority:?}"
        );
        {
            let mut state = self.inner.state.lock();
            if state.priority == Priority::Completing || state.priority == priority {
                return false;
            }
            state.priority = priority;
            self.rekey(&mut state);
        }
        if let Some(listener) = self.listener() {
            listener.on_priority_raised(priority);
        }
        true
    }

    /// Raises the priority to `priority` if it is currently lower.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is not schedulable.
    pub fn raise_priority(&self, priority: Priority) -> bool {
        assert!(
            priority.is_schedulable(),
            "invalid scheduling priority: {priority:?}"
        );
        {
            let mut state = self.inner.state.lock();
            if state.priority == Priority::Completing
                || state.priority.is_higher_or_equal(priority)
            {
                return false;
            }
            state.priority = priority;
            self.rekey(&mut state);
        }
        if let Some(listener) = self.listener() {
            listener.on_priority_raised(priority);
        }
        true
    }

    /// Lowers the priority to `priority` if it is currently higher.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is not schedulable.
    pub fn lower_priority(&self, priority: Priority) -> bool {
        assert!(
            priority.is_schedulable(),
            "invalid scheduling priority: {priority:?}"
        );
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing || state.priority.is_lower_or_equal(priority) {
            return false;
        }
        state.priority = priority;
        self.rekey(&mut state);
        true
    }

    /// Returns the task's suborder.
    #[must_use]
    pub fn sub_order(&self) -> i64 {
        self.inner.state.lock().sub_order
    }

    /// Sets the suborder, re-keying the task if queued. Returns `false`
    /// if completing or unchanged.
    pub fn set_sub_order(&self, sub_order: i64) -> bool {
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing || state.sub_order == sub_order {
            return false;
        }
        state.sub_order = sub_order;
        self.rekey(&mut state);
        true
    }

    /// Raises the suborder to `sub_order` if it is currently lower.
    pub fn raise_sub_order(&self, sub_order: i64) -> bool {
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing || state.sub_order >= sub_order {
            return false;
        }
        state.sub_order = sub_order;
        self.rekey(&mut state);
        true
    }

    /// Lowers the suborder to `sub_order` if it is currently higher.
    pub fn lower_sub_order(&self, sub_order: i64) -> bool {
        let mut state = self.inner.state.lock();
        if state.priority == Priority::Completing || state.sub_order <= sub_order {
            return false;
        }
        state.sub_order = sub_order;
        self.rekey(&mut state);
        true
    }

    /// Sets both ordering keys at once. Returns `false` if completing
    /// or both are unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is not schedulable.
    pub fn set_priority_and_sub_order(&self, priority: Priority, sub_order: i64) -> bool {
        assert!(
            priority.is_schedulable(),
            "invalid scheduling priority: {priority:?}"
        );
        {
            let mut state = self.inner.state.lock();
            if state.priority == Priority::Completing
                || (state.priority == priority && state.sub_order == sub_order)
            {
                return false;
            }
            state.priority = priority;
            state.sub_order = sub_order;
            self.rekey(&mut state);
        }
        if let Some(listener) = self.listener() {
            listener.on_priority_raised(priority);
        }
        true
    }

    /// Replaces the task's holder under the state lock: flag and remove
    /// the old record, insert a fresh one at the new key. No-op when the
    /// task is not queued.
    fn rekey(&self, state: &mut TaskState) {
        let Some(old) = state.holder.take() else {
            return;
        };
        let queue = self.inner.queue.upgrade();
        if old.mark_removed() {
            if let Some(queue) = &queue {
                queue.index.remove(&old.key);
            }
        }
        let holder = Arc::new(Holder {
            key: HolderKey {
                priority: state.priority.ordinal(),
                sub_order: state.sub_order,
                id: self.inner.id,
            },
            task: Arc::clone(&self.inner),
            removed: AtomicBool::new(false),
        });
        state.holder = Some(Arc::clone(&holder));
        if let Some(queue) = &queue {
            queue.index.insert(holder.key, holder);
        }
    }

    fn listener(&self) -> Option<Arc<dyn TaskListener>> {
        self.inner.listener.as_ref().and_then(Weak::upgrade)
    }
}

impl std::fmt::Debug for PrioritisedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PrioritisedTask")
            .field("id", &self.inner.id)
            .field("priority", &state.priority)
            .field("sub_order", &state.sub_order)
            .field("queued", &state.holder.is_some())
            .finish()
    }
}
