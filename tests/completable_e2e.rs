//! End-to-end completable scenarios: chained transforms and executor
//! dispatch across a live thread pool.

use gridlock::{Completable, CompletionError, Executor, PoolOptions, Priority, PrioritisedThreadPool};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[test]
fn supplied_chain_computes_seven() {
    let result = Completable::supplied(|| 3)
        .then_apply(|x| x * 2)
        .then_apply(|x| x + 1)
        .join();
    assert_eq!(result.unwrap(), 7);
}

struct StageExecutor {
    executor: gridlock::PoolExecutor,
    threads_seen: Arc<Mutex<HashSet<ThreadId>>>,
}

impl Executor for StageExecutor {
    fn execute(&self, job: Box<dyn FnOnce() + Send>) -> Result<(), gridlock::QueueError> {
        let threads_seen = Arc::clone(&self.threads_seen);
        self.executor
            .queue_task(
                move || {
                    threads_seen.lock().unwrap().insert(thread::current().id());
                    job();
                },
                Priority::Normal,
            )
            .map(|_| ())
    }
}

#[test]
fn async_stages_run_on_their_executors_in_order() {
    let pool = PrioritisedThreadPool::new(PoolOptions::default());
    pool.adjust_thread_count(3);
    let group = pool.create_executor_group(0, 0);

    let stages: Vec<Arc<StageExecutor>> = (0..3)
        .map(|_| {
            Arc::new(StageExecutor {
                executor: group.create_executor(1, Duration::from_millis(1), 0),
                threads_seen: Arc::new(Mutex::new(HashSet::new())),
            })
        })
        .collect();

    // each stage records the order it ran in; a stage may only observe
    // the previous stage's sequence number
    let sequence = Arc::new(AtomicUsize::new(0));

    let source = Completable::new();
    let mut chained = source.clone();
    for stage in &stages {
        let sequence = Arc::clone(&sequence);
        let stage: Arc<dyn Executor> = Arc::clone(stage) as Arc<dyn Executor>;
        chained = chained.then_apply_async(
            move |x: usize| {
                let observed = sequence.fetch_add(1, Ordering::SeqCst);
                assert_eq!(observed, x, "stage ran out of order");
                x + 1
            },
            &stage,
        );
    }

    source.complete(0);
    assert_eq!(chained.join().unwrap(), 3);
    assert_eq!(sequence.load(Ordering::SeqCst), 3);

    // every stage dispatched to pool workers, never the completing or
    // joining thread
    let main = thread::current().id();
    for stage in &stages {
        let seen = stage.threads_seen.lock().unwrap();
        assert!(!seen.is_empty(), "stage never dispatched");
        assert!(!seen.contains(&main), "stage ran inline on the caller");
    }

    pool.shutdown(true);
}

#[test]
fn exceptional_completion_flows_through_chain() {
    let source: Completable<i32> = Completable::new();
    let recovered = source
        .then_apply(|x| x * 100)
        .exceptionally(|error| {
            assert!(error.to_string().contains("supply failed"));
            -1
        });

    source.complete_exceptionally(CompletionError::msg("supply failed"));
    assert_eq!(recovered.join().unwrap(), -1);
}

#[test]
fn many_threads_race_to_complete_only_one_wins() {
    let completable: Completable<usize> = Completable::new();
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let completable = completable.clone();
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                if completable.complete(i) {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    let value = completable.join().unwrap();
    assert!(value < 8);
}
