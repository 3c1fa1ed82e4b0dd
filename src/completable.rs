//! Single-assignment completion future with chained continuations.
//!
//! A [`Completable`] holds at most one result, set exactly once by
//! [`complete`](Completable::complete) or
//! [`complete_exceptionally`](Completable::complete_exceptionally).
//! Continuations registered before completion are kept on a lock-free
//! stack and drained atomically when the result arrives; continuations
//! registered afterwards run inline on the registering thread.
//!
//! Every transform takes an optional *error transformer* that is invoked
//! when the user callback fails (panics); its output becomes the
//! downstream error. The default transformer logs the error and returns
//! it unchanged.
//!
//! # Executor dispatch
//!
//! Each chaining method has an `_async` form taking an
//! [`Executor`]; the continuation is submitted there instead of running
//! on the completing thread. A rejected submission is treated like a
//! callback failure and surfaces through the downstream error channel.

use crate::error::{CompletionError, QueueError};
use crate::executor::pool::{PoolExecutor, PoolOptions, PrioritisedThreadPool};
use crate::executor::Executor;
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

/// The settled state of a [`Completable`]: a value or an error.
pub type Outcome<T> = Result<T, CompletionError>;

/// Maps a failure from a user callback into the error published
/// downstream.
pub type ErrorTransformer = Arc<dyn Fn(CompletionError) -> CompletionError + Send + Sync>;

/// Returns the default error transformer: logs the error and passes it
/// through unchanged.
#[must_use]
pub fn default_error_transformer() -> ErrorTransformer {
    static DEFAULT: OnceLock<ErrorTransformer> = OnceLock::new();
    Arc::clone(DEFAULT.get_or_init(|| {
        Arc::new(|error| {
            tracing::error!(%error, "unhandled error during completable operation");
            error
        })
    }))
}

/// Returns the process-wide default executor, a lazily-started shared
/// thread pool sized to the available parallelism.
#[must_use]
pub fn default_executor() -> Arc<dyn Executor> {
    static DEFAULT: OnceLock<(PrioritisedThreadPool, Arc<PoolExecutor>)> = OnceLock::new();
    let (_, executor) = DEFAULT.get_or_init(|| {
        let pool = PrioritisedThreadPool::new(PoolOptions {
            thread_name_prefix: "gridlock-default".to_string(),
            ..PoolOptions::default()
        });
        let threads = thread::available_parallelism().map_or(2, usize::from);
        pool.adjust_thread_count(threads);
        let group = pool.create_executor_group(0, 0);
        let executor = Arc::new(group.create_executor(0, Duration::from_micros(100), 0));
        (pool, executor)
    });
    let executor: Arc<dyn Executor> = executor.clone();
    executor
}

/// Applies a transformer to an error. If the transformer itself panics,
/// the panic is attached to the original error as a suppressed cause and
/// the original is used.
fn apply_transformer(transformer: &ErrorTransformer, error: CompletionError) -> CompletionError {
    let cloned = error.clone();
    match catch_unwind(AssertUnwindSafe(|| transformer(cloned))) {
        Ok(mapped) => mapped,
        Err(payload) => error.with_suppressed(CompletionError::from_panic(payload)),
    }
}

/// What a continuation receives when it fires.
enum Input<T> {
    /// The upstream settled with this outcome.
    Settled(Outcome<T>),
    /// The continuation could not be handed to its executor.
    DispatchFailed(CompletionError),
}

type Job<T> = Box<dyn FnOnce(Input<T>) + Send>;

/// One pending continuation, linked into the upstream's LIFO stack.
struct Continuation<T> {
    next: *mut Continuation<T>,
    executor: Option<Arc<dyn Executor>>,
    job: Job<T>,
}

impl<T: Clone + Send + Sync + 'static> Continuation<T> {
    fn boxed(executor: Option<Arc<dyn Executor>>, job: Job<T>) -> Box<Self> {
        Box::new(Self {
            next: ptr::null_mut(),
            executor,
            job,
        })
    }

    /// Runs the continuation: inline when it has no executor, otherwise
    /// submitted to it. Submission failure feeds `DispatchFailed` to the
    /// job on the current thread.
    fn execute(self: Box<Self>, outcome: Outcome<T>) {
        let Continuation { executor, job, .. } = *self;
        match executor {
            None => job(Input::Settled(outcome)),
            Some(executor) => {
                // The job must survive a rejected submission, so it is
                // parked in a shared cell both paths drain exactly once.
                let cell = Arc::new(Mutex::new(Some(job)));
                let submitted = {
                    let cell = Arc::clone(&cell);
                    Box::new(move || {
                        if let Some(job) = cell.lock().take() {
                            job(Input::Settled(outcome));
                        }
                    })
                };
                if let Err(error) = executor.execute(submitted) {
                    if let Some(job) = cell.lock().take() {
                        job(Input::DispatchFailed(CompletionError::new(error)));
                    }
                }
            }
        }
    }
}

/// Sentinel stack value meaning "completed and drained". Never
/// dereferenced, only compared.
fn completed_sentinel<T>() -> *mut Continuation<T> {
    1usize as *mut Continuation<T>
}

struct Inner<T> {
    result: OnceLock<Outcome<T>>,
    stack: AtomicPtr<Continuation<T>>,
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Links the continuation at the stack head, or runs it inline if
    /// the stack has already been drained.
    fn push_or_run(&self, continuation: Box<Continuation<T>>) {
        let raw = Box::into_raw(continuation);
        let backoff = Backoff::new();
        let mut head = self.stack.load(Ordering::SeqCst);
        loop {
            if head == completed_sentinel::<T>() {
                // safety: `raw` came from Box::into_raw above and was
                // never published.
                let continuation = unsafe { Box::from_raw(raw) };
                let outcome = self
                    .result
                    .get()
                    .expect("stack drained before result was published")
                    .clone();
                continuation.execute(outcome);
                return;
            }
            // safety: `raw` is unpublished; we fully own it until the CAS
            // succeeds.
            unsafe { (*raw).next = head };
            match self
                .stack
                .compare_exchange_weak(head, raw, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }

    /// Drains and executes the continuation stack. Must only be called
    /// by the thread that won the completion race.
    fn propagate(&self) {
        let outcome = self
            .result
            .get()
            .expect("propagating before result was published");
        let mut head = self.stack.swap(completed_sentinel::<T>(), Ordering::SeqCst);
        while !head.is_null() {
            // safety: nodes on the stack are uniquely owned by it; the
            // swap above transferred that ownership to us.
            let continuation = unsafe { Box::from_raw(head) };
            head = continuation.next;
            continuation.execute(outcome.clone());
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let mut head = *self.stack.get_mut();
        if head == completed_sentinel::<T>() {
            return;
        }
        // Never completed: free any registered continuations without
        // running them. Their downstream stages stay unset.
        while !head.is_null() {
            // safety: exclusive access via &mut self; every node on the
            // stack is uniquely owned by it.
            let continuation = unsafe { Box::from_raw(head) };
            head = continuation.next;
        }
    }
}

/// A single-assignment result carrier with composable transforms.
///
/// Handles are cheap to clone and share one underlying state; two
/// handles compare as the same completable iff they were cloned from
/// one another.
pub struct Completable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Completable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Completable<T> {
    /// Creates an unset completable.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                result: OnceLock::new(),
                stack: AtomicPtr::new(ptr::null_mut()),
            }),
        }
    }

    fn settled(outcome: Outcome<T>) -> Self {
        let ret = Self {
            inner: Arc::new(Inner {
                result: OnceLock::new(),
                stack: AtomicPtr::new(completed_sentinel::<T>()),
            }),
        };
        ret.inner
            .result
            .set(outcome)
            .unwrap_or_else(|_| unreachable!("freshly created result cell was occupied"));
        ret
    }

    /// Creates a completable already holding `value`.
    #[must_use]
    pub fn completed(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// Creates a completable already holding `error`.
    #[must_use]
    pub fn failed(error: CompletionError) -> Self {
        Self::settled(Err(error))
    }

    /// Runs `supplier` on the calling thread and captures its value, or
    /// its panic as an error.
    pub fn supplied(supplier: impl FnOnce() -> T) -> Self {
        Self::supplied_with(supplier, default_error_transformer())
    }

    /// Like [`supplied`](Self::supplied) with an explicit transformer
    /// for supplier failure.
    pub fn supplied_with(supplier: impl FnOnce() -> T, transformer: ErrorTransformer) -> Self {
        match catch_unwind(AssertUnwindSafe(supplier)) {
            Ok(value) => Self::completed(value),
            Err(payload) => Self::failed(apply_transformer(
                &transformer,
                CompletionError::from_panic(payload),
            )),
        }
    }

    /// Runs `supplier` on `executor`; the returned completable settles
    /// with its value, its panic, or the submission failure.
    pub fn supplied_async(
        supplier: impl FnOnce() -> T + Send + 'static,
        executor: &Arc<dyn Executor>,
    ) -> Self {
        Self::supplied_async_with(supplier, executor, default_error_transformer())
    }

    /// Like [`supplied_async`](Self::supplied_async) with an explicit
    /// transformer.
    pub fn supplied_async_with(
        supplier: impl FnOnce() -> T + Send + 'static,
        executor: &Arc<dyn Executor>,
        transformer: ErrorTransformer,
    ) -> Self {
        let ret = Self::new();
        let completer = ret.clone();
        let job_transformer = Arc::clone(&transformer);
        let submitted = Box::new(move || {
            match catch_unwind(AssertUnwindSafe(supplier)) {
                Ok(value) => completer.complete(value),
                Err(payload) => completer.complete_exceptionally(apply_transformer(
                    &job_transformer,
                    CompletionError::from_panic(payload),
                )),
            };
        });
        if let Err(error) = executor.execute(submitted) {
            ret.complete_exceptionally(apply_transformer(
                &transformer,
                CompletionError::new(error),
            ));
        }
        ret
    }

    /// Publishes `value`. Returns `false` if a result was already set.
    pub fn complete(&self, value: T) -> bool {
        self.complete_raw(Ok(value))
    }

    /// Publishes `error`. Returns `false` if a result was already set.
    pub fn complete_exceptionally(&self, error: CompletionError) -> bool {
        self.complete_raw(Err(error))
    }

    fn complete_raw(&self, outcome: Outcome<T>) -> bool {
        if self.inner.result.set(outcome).is_err() {
            return false;
        }
        self.inner.propagate();
        true
    }

    /// Returns whether a result (value or error) has been published.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.result.get().is_some()
    }

    /// Returns whether the completable settled with a value.
    #[must_use]
    pub fn is_normally_complete(&self) -> bool {
        matches!(self.inner.result.get(), Some(Ok(_)))
    }

    /// Returns whether the completable settled with an error.
    #[must_use]
    pub fn is_exceptionally_complete(&self) -> bool {
        matches!(self.inner.result.get(), Some(Err(_)))
    }

    /// Returns the published error, or `None` when unset.
    ///
    /// # Panics
    ///
    /// Panics if the completable settled with a value.
    #[must_use]
    pub fn exception(&self) -> Option<CompletionError> {
        match self.inner.result.get() {
            None => None,
            Some(Err(error)) => Some(error.clone()),
            Some(Ok(_)) => panic!("not completed exceptionally"),
        }
    }

    /// Returns the published value, `default` when unset, or the
    /// published error.
    pub fn get_now(&self, default: T) -> Outcome<T> {
        match self.inner.result.get() {
            None => Ok(default),
            Some(outcome) => outcome.clone(),
        }
    }

    /// Blocks the calling thread until a result is published and
    /// returns it.
    pub fn join(&self) -> Outcome<T> {
        if let Some(outcome) = self.inner.result.get() {
            return outcome.clone();
        }

        let released = Arc::new(AtomicBool::new(false));
        let target = thread::current();
        let unpark = {
            let released = Arc::clone(&released);
            Box::new(move |_input: Input<T>| {
                released.store(true, Ordering::Release);
                target.unpark();
            })
        };
        self.inner.push_or_run(Continuation::boxed(None, unpark));

        // park() may return spuriously; the release flag is the only
        // wakeup condition.
        while !released.load(Ordering::Acquire) {
            thread::park();
        }

        self.inner
            .result
            .get()
            .expect("join released before result was published")
            .clone()
    }

    /// Registers one continuation: `step` maps the upstream outcome to
    /// the downstream one, with panics routed through `transformer`.
    fn chain<U>(
        &self,
        executor: Option<Arc<dyn Executor>>,
        transformer: ErrorTransformer,
        step: impl FnOnce(Outcome<T>) -> Outcome<U> + Send + 'static,
    ) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        let downstream = Completable::<U>::new();
        let ret = downstream.clone();
        let job = Box::new(move |input: Input<T>| match input {
            Input::DispatchFailed(error) => {
                downstream.complete_exceptionally(apply_transformer(&transformer, error));
            }
            Input::Settled(outcome) => {
                match catch_unwind(AssertUnwindSafe(move || step(outcome))) {
                    Ok(Ok(value)) => {
                        downstream.complete(value);
                    }
                    Ok(Err(error)) => {
                        downstream.complete_exceptionally(error);
                    }
                    Err(payload) => {
                        downstream.complete_exceptionally(apply_transformer(
                            &transformer,
                            CompletionError::from_panic(payload),
                        ));
                    }
                }
            }
        });
        self.inner.push_or_run(Continuation::boxed(executor, job));
        ret
    }

    /// Maps the value through `function`; upstream errors propagate.
    pub fn then_apply<U>(&self, function: impl FnOnce(T) -> U + Send + 'static) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.then_apply_with(function, default_error_transformer())
    }

    /// [`then_apply`](Self::then_apply) with an explicit transformer.
    pub fn then_apply_with<U>(
        &self,
        function: impl FnOnce(T) -> U + Send + 'static,
        transformer: ErrorTransformer,
    ) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.chain(None, transformer, |outcome| outcome.map(function))
    }

    /// [`then_apply`](Self::then_apply) running on `executor`.
    pub fn then_apply_async<U>(
        &self,
        function: impl FnOnce(T) -> U + Send + 'static,
        executor: &Arc<dyn Executor>,
    ) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.then_apply_async_with(function, executor, default_error_transformer())
    }

    /// [`then_apply_async`](Self::then_apply_async) with an explicit
    /// transformer.
    pub fn then_apply_async_with<U>(
        &self,
        function: impl FnOnce(T) -> U + Send + 'static,
        executor: &Arc<dyn Executor>,
        transformer: ErrorTransformer,
    ) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.chain(Some(Arc::clone(executor)), transformer, |outcome| {
            outcome.map(function)
        })
    }

    /// Consumes the value; upstream errors propagate.
    pub fn then_accept(&self, consumer: impl FnOnce(T) + Send + 'static) -> Completable<()> {
        self.then_accept_with(consumer, default_error_transformer())
    }

    /// [`then_accept`](Self::then_accept) with an explicit transformer.
    pub fn then_accept_with(
        &self,
        consumer: impl FnOnce(T) + Send + 'static,
        transformer: ErrorTransformer,
    ) -> Completable<()> {
        self.chain(None, transformer, |outcome| {
            outcome.map(|value| consumer(value))
        })
    }

    /// [`then_accept`](Self::then_accept) running on `executor`.
    pub fn then_accept_async(
        &self,
        consumer: impl FnOnce(T) + Send + 'static,
        executor: &Arc<dyn Executor>,
    ) -> Completable<()> {
        self.then_accept_async_with(consumer, executor, default_error_transformer())
    }

    /// [`then_accept_async`](Self::then_accept_async) with an explicit
    /// transformer.
    pub fn then_accept_async_with(
        &self,
        consumer: impl FnOnce(T) + Send + 'static,
        executor: &Arc<dyn Executor>,
        transformer: ErrorTransformer,
    ) -> Completable<()> {
        self.chain(Some(Arc::clone(executor)), transformer, |outcome| {
            outcome.map(|value| consumer(value))
        })
    }

    /// Runs `runnable` when the upstream completes with a value;
    /// upstream errors propagate.
    pub fn then_run(&self, runnable: impl FnOnce() + Send + 'static) -> Completable<()> {
        self.then_run_with(runnable, default_error_transformer())
    }

    /// [`then_run`](Self::then_run) with an explicit transformer.
    pub fn then_run_with(
        &self,
        runnable: impl FnOnce() + Send + 'static,
        transformer: ErrorTransformer,
    ) -> Completable<()> {
        self.chain(None, transformer, |outcome| {
            outcome.map(|_value| runnable())
        })
    }

    /// [`then_run`](Self::then_run) running on `executor`.
    pub fn then_run_async(
        &self,
        runnable: impl FnOnce() + Send + 'static,
        executor: &Arc<dyn Executor>,
    ) -> Completable<()> {
        self.then_run_async_with(runnable, executor, default_error_transformer())
    }

    /// [`then_run_async`](Self::then_run_async) with an explicit
    /// transformer.
    pub fn then_run_async_with(
        &self,
        runnable: impl FnOnce() + Send + 'static,
        executor: &Arc<dyn Executor>,
        transformer: ErrorTransformer,
    ) -> Completable<()> {
        self.chain(Some(Arc::clone(executor)), transformer, |outcome| {
            outcome.map(|_value| runnable())
        })
    }

    /// Maps both the value and error cases through `function`.
    pub fn handle<U>(
        &self,
        function: impl FnOnce(Option<T>, Option<CompletionError>) -> U + Send + 'static,
    ) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.handle_with(function, default_error_transformer())
    }

    /// [`handle`](Self::handle) with an explicit transformer.
    pub fn handle_with<U>(
        &self,
        function: impl FnOnce(Option<T>, Option<CompletionError>) -> U + Send + 'static,
        transformer: ErrorTransformer,
    ) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.chain(None, transformer, |outcome| match outcome {
            Ok(value) => Ok(function(Some(value), None)),
            Err(error) => Ok(function(None, Some(error))),
        })
    }

    /// [`handle`](Self::handle) running on `executor`.
    pub fn handle_async<U>(
        &self,
        function: impl FnOnce(Option<T>, Option<CompletionError>) -> U + Send + 'static,
        executor: &Arc<dyn Executor>,
    ) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.handle_async_with(function, executor, default_error_transformer())
    }

    /// [`handle_async`](Self::handle_async) with an explicit
    /// transformer.
    pub fn handle_async_with<U>(
        &self,
        function: impl FnOnce(Option<T>, Option<CompletionError>) -> U + Send + 'static,
        executor: &Arc<dyn Executor>,
        transformer: ErrorTransformer,
    ) -> Completable<U>
    where
        U: Clone + Send + Sync + 'static,
    {
        self.chain(Some(Arc::clone(executor)), transformer, |outcome| {
            match outcome {
                Ok(value) => Ok(function(Some(value), None)),
                Err(error) => Ok(function(None, Some(error))),
            }
        })
    }

    /// Observes the outcome without changing it; the downstream mirrors
    /// the upstream.
    pub fn when_complete(
        &self,
        consumer: impl FnOnce(Option<&T>, Option<&CompletionError>) + Send + 'static,
    ) -> Completable<T> {
        self.when_complete_with(consumer, default_error_transformer())
    }

    /// [`when_complete`](Self::when_complete) with an explicit
    /// transformer.
    pub fn when_complete_with(
        &self,
        consumer: impl FnOnce(Option<&T>, Option<&CompletionError>) + Send + 'static,
        transformer: ErrorTransformer,
    ) -> Completable<T> {
        self.chain(None, transformer, |outcome| match outcome {
            Ok(value) => {
                consumer(Some(&value), None);
                Ok(value)
            }
            Err(error) => {
                consumer(None, Some(&error));
                Err(error)
            }
        })
    }

    /// [`when_complete`](Self::when_complete) running on `executor`.
    pub fn when_complete_async(
        &self,
        consumer: impl FnOnce(Option<&T>, Option<&CompletionError>) + Send + 'static,
        executor: &Arc<dyn Executor>,
    ) -> Completable<T> {
        self.when_complete_async_with(consumer, executor, default_error_transformer())
    }

    /// [`when_complete_async`](Self::when_complete_async) with an
    /// explicit transformer.
    pub fn when_complete_async_with(
        &self,
        consumer: impl FnOnce(Option<&T>, Option<&CompletionError>) + Send + 'static,
        executor: &Arc<dyn Executor>,
        transformer: ErrorTransformer,
    ) -> Completable<T> {
        self.chain(Some(Arc::clone(executor)), transformer, |outcome| {
            match outcome {
                Ok(value) => {
                    consumer(Some(&value), None);
                    Ok(value)
                }
                Err(error) => {
                    consumer(None, Some(&error));
                    Err(error)
                }
            }
        })
    }

    /// Recovers from an upstream error; values pass through unchanged.
    pub fn exceptionally(
        &self,
        function: impl FnOnce(CompletionError) -> T + Send + 'static,
    ) -> Completable<T> {
        self.exceptionally_with(function, default_error_transformer())
    }

    /// [`exceptionally`](Self::exceptionally) with an explicit
    /// transformer.
    pub fn exceptionally_with(
        &self,
        function: impl FnOnce(CompletionError) -> T + Send + 'static,
        transformer: ErrorTransformer,
    ) -> Completable<T> {
        self.chain(None, transformer, |outcome| match outcome {
            Ok(value) => Ok(value),
            Err(error) => Ok(function(error)),
        })
    }

    /// [`exceptionally`](Self::exceptionally) running on `executor`.
    pub fn exceptionally_async(
        &self,
        function: impl FnOnce(CompletionError) -> T + Send + 'static,
        executor: &Arc<dyn Executor>,
    ) -> Completable<T> {
        self.exceptionally_async_with(function, executor, default_error_transformer())
    }

    /// [`exceptionally_async`](Self::exceptionally_async) with an
    /// explicit transformer.
    pub fn exceptionally_async_with(
        &self,
        function: impl FnOnce(CompletionError) -> T + Send + 'static,
        executor: &Arc<dyn Executor>,
        transformer: ErrorTransformer,
    ) -> Completable<T> {
        self.chain(Some(Arc::clone(executor)), transformer, |outcome| {
            match outcome {
                Ok(value) => Ok(value),
                Err(error) => Ok(function(error)),
            }
        })
    }
}

/// A completable is pollable as a standard future; the waker is
/// registered as a continuation.
impl<T: Clone + Send + Sync + 'static> Future for Completable<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.inner.result.get() {
            return Poll::Ready(outcome.clone());
        }
        let waker = cx.waker().clone();
        self.inner.push_or_run(Continuation::boxed(
            None,
            Box::new(move |_input: Input<T>| waker.wake()),
        ));
        // Re-check: completion may have raced the registration, in which
        // case the waker already fired inline.
        match self.inner.result.get() {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => Poll::Pending,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Completable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Completable");
        match self.inner.result.get() {
            None => s.field("state", &"unset"),
            Some(Ok(value)) => s.field("state", &"value").field("value", value),
            Some(Err(error)) => s.field("state", &"error").field("error", error),
        };
        s.finish()
    }
}

// Convenience conversion mirroring `QueueError` rejections into the
// completion error channel.
impl From<QueueError> for CompletionError {
    fn from(error: QueueError) -> Self {
        Self::new(error)
    }
}
