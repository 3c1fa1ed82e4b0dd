//! Reentrant 2-D area lock.
//!
//! A thread locks an inclusive rectangle of *section* coordinates
//! (world coordinates right-shifted by the lock's coordinate shift).
//! Overlapping rectangles from different threads serialise on the first
//! contended cell; disjoint rectangles never contend. A thread that
//! already holds every cell of a range re-acquires it for free.
//!
//! Ownership is tracked in a [`ConcurrentLongMap`] from packed cell
//! coordinates to the acquisition's [`AreaNode`]; since a cell maps to
//! at most one node and a node records its owning thread, mutual
//! exclusion reduces to the map's `put_if_absent` atomicity.

use crate::map::ConcurrentLongMap;
use crate::util::hash::pack_coordinate;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::Duration;

/// Failed-acquisition count below which contention is handled by
/// spinning; above it, by parking.
const SPIN_FAILURE_LIMIT: u64 = 128;
/// Failure count separating short fixed parks from escalating parks.
const SHORT_PARK_FAILURE_LIMIT: u64 = 1_200;

/// Waiter queue attached to an acquisition. After the owner drains it
/// the queue closes: late `add` calls fail so the would-be waiter
/// retries instead of parking against a dead node.
struct WaiterQueue {
    state: Mutex<WaiterState>,
}

struct WaiterState {
    open: bool,
    waiting: VecDeque<Thread>,
}

impl WaiterQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState {
                open: true,
                waiting: VecDeque::new(),
            }),
        }
    }

    /// Registers a thread to be unparked on release. Returns `false`
    /// once the queue has been closed to adds.
    fn add(&self, thread: Thread) -> bool {
        let mut state = self.state.lock();
        if !state.open {
            return false;
        }
        state.waiting.push_back(thread);
        true
    }

    /// Pops one waiter; closes the queue to adds when empty.
    fn poll_or_block_adds(&self) -> Option<Thread> {
        let mut state = self.state.lock();
        match state.waiting.pop_front() {
            Some(thread) => Some(thread),
            None => {
                state.open = false;
                None
            }
        }
    }

    /// Reopens the queue after a failed acquisition retries.
    fn allow_adds(&self) {
        self.state.lock().open = true;
    }
}

/// One acquisition: the owning thread plus the waiters blocked on it.
struct AreaNode {
    owner: Thread,
    waiters: WaiterQueue,
}

impl AreaNode {
    fn new(owner: Thread) -> Self {
        Self {
            owner,
            waiters: WaiterQueue::new(),
        }
    }

    fn drain_waiters(&self) {
        while let Some(thread) = self.waiters.poll_or_block_adds() {
            thread.unpark();
        }
    }
}

/// Token for a held area; pass it back to
/// [`ReentrantAreaLock::unlock`]. Consuming it on unlock makes a
/// double-unlock unrepresentable.
pub struct AreaLockNode {
    lock_token: Arc<()>,
    node: Arc<AreaNode>,
    /// The cells this acquisition inserted; empty for a fully
    /// reentrant acquisition, which has nothing to release.
    cells: Vec<i64>,
}

impl std::fmt::Debug for AreaLockNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AreaLockNode")
            .field("cells", &self.cells.len())
            .field("owner", &self.node.owner.id())
            .finish()
    }
}

/// Reentrant range lock over a 2-D grid of section coordinates.
pub struct ReentrantAreaLock {
    coordinate_shift: u32,
    token: Arc<()>,
    nodes: ConcurrentLongMap<Arc<AreaNode>>,
}

impl ReentrantAreaLock {
    /// Creates an area lock; world coordinates are right-shifted by
    /// `coordinate_shift` to obtain section coordinates.
    ///
    /// # Panics
    ///
    /// Panics if `coordinate_shift` is 32 or more.
    #[must_use]
    pub fn new(coordinate_shift: u32) -> Self {
        assert!(coordinate_shift < 32, "coordinate shift out of range: {coordinate_shift}");
        Self {
            coordinate_shift,
            token: Arc::new(()),
            // aggressive load factor to reduce bucket contention
            nodes: ConcurrentLongMap::with_capacity(128, 0.2),
        }
    }

    /// The configured coordinate shift.
    #[must_use]
    pub fn coordinate_shift(&self) -> u32 {
        self.coordinate_shift
    }

    /// Returns whether the calling thread holds the cell containing
    /// `(x, z)`.
    #[must_use]
    pub fn is_held_by_current_thread(&self, x: i32, z: i32) -> bool {
        self.is_held_by_current_thread_range(x, z, x, z)
    }

    /// Returns whether the calling thread holds every cell within
    /// `radius` of the center.
    #[must_use]
    pub fn is_held_by_current_thread_radius(&self, center_x: i32, center_z: i32, radius: i32) -> bool {
        self.is_held_by_current_thread_range(
            center_x - radius,
            center_z - radius,
            center_x + radius,
            center_z + radius,
        )
    }

    /// Returns whether the calling thread holds every cell of the
    /// inclusive rectangle.
    ///
    /// # Panics
    ///
    /// Panics if `from > to` on either axis.
    #[must_use]
    pub fn is_held_by_current_thread_range(
        &self,
        from_x: i32,
        from_z: i32,
        to_x: i32,
        to_z: i32,
    ) -> bool {
        assert!(from_x <= to_x && from_z <= to_z, "invalid range");
        let shift = self.coordinate_shift;
        let current = thread::current().id();
        let guard = self.nodes.guard();

        for section_z in (from_z >> shift)..=(to_z >> shift) {
            for section_x in (from_x >> shift)..=(to_x >> shift) {
                let coordinate = pack_coordinate(section_x, section_z);
                match self.nodes.get(coordinate, &guard) {
                    Some(node) if node.owner.id() == current => {}
                    _ => return false,
                }
            }
        }
        true
    }

    /// Attempts to lock the cell containing `(x, z)` without blocking.
    #[must_use]
    pub fn try_lock(&self, x: i32, z: i32) -> Option<AreaLockNode> {
        self.try_lock_range(x, z, x, z)
    }

    /// Attempts to lock every cell within `radius` of the center
    /// without blocking.
    #[must_use]
    pub fn try_lock_radius(&self, center_x: i32, center_z: i32, radius: i32) -> Option<AreaLockNode> {
        self.try_lock_range(
            center_x - radius,
            center_z - radius,
            center_x + radius,
            center_z + radius,
        )
    }

    /// Attempts to lock the inclusive rectangle without blocking.
    /// Returns `None` if any cell is held by another thread; cells this
    /// call inserted are rolled back.
    ///
    /// # Panics
    ///
    /// Panics if `from > to` on either axis.
    #[must_use]
    pub fn try_lock_range(
        &self,
        from_x: i32,
        from_z: i32,
        to_x: i32,
        to_z: i32,
    ) -> Option<AreaLockNode> {
        assert!(from_x <= to_x && from_z <= to_z, "invalid range");
        let shift = self.coordinate_shift;
        let current = thread::current();
        let node = Arc::new(AreaNode::new(current.clone()));
        let mut cells = Vec::new();
        let mut failed = false;

        {
            let guard = self.nodes.guard();
            'scan: for section_z in (from_z >> shift)..=(to_z >> shift) {
                for section_x in (from_x >> shift)..=(to_x >> shift) {
                    let coordinate = pack_coordinate(section_x, section_z);
                    match self.nodes.put_if_absent(coordinate, Arc::clone(&node), &guard) {
                        None => cells.push(coordinate),
                        Some(prev) => {
                            if prev.owner.id() != current.id() {
                                failed = true;
                                break 'scan;
                            }
                            // pre-owned by us: nothing to insert
                        }
                    }
                }
            }
        }

        if !failed {
            return Some(AreaLockNode {
                lock_token: Arc::clone(&self.token),
                node,
                cells,
            });
        }

        if !cells.is_empty() {
            self.roll_back(&node, &mut cells);
        }
        None
    }

    /// Locks the cell containing `(x, z)`, blocking until available.
    #[must_use]
    pub fn lock(&self, x: i32, z: i32) -> AreaLockNode {
        let shift = self.coordinate_shift;
        let coordinate = pack_coordinate(x >> shift, z >> shift);
        let current = thread::current();
        let node = Arc::new(AreaNode::new(current.clone()));

        let mut failures = 0u64;
        loop {
            let park = {
                let guard = self.nodes.guard();
                match self.nodes.put_if_absent(coordinate, Arc::clone(&node), &guard) {
                    None => {
                        return AreaLockNode {
                            lock_token: Arc::clone(&self.token),
                            node,
                            cells: vec![coordinate],
                        };
                    }
                    Some(prev) => {
                        if prev.owner.id() == current.id() {
                            // the only cell we want is already ours
                            return AreaLockNode {
                                lock_token: Arc::clone(&self.token),
                                node,
                                cells: Vec::new(),
                            };
                        }
                        Arc::clone(prev)
                    }
                }
            };

            failures += 1;
            self.back_off(&park, &current, &mut failures);
        }
    }

    /// Locks every cell within `radius` of the center, blocking until
    /// available.
    #[must_use]
    pub fn lock_radius(&self, center_x: i32, center_z: i32, radius: i32) -> AreaLockNode {
        self.lock_range(
            center_x - radius,
            center_z - radius,
            center_x + radius,
            center_z + radius,
        )
    }

    /// Locks the inclusive rectangle, blocking until every cell is
    /// available.
    ///
    /// # Panics
    ///
    /// Panics if `from > to` on either axis, or if the range partially
    /// overlaps cells already held by the calling thread: acquiring an
    /// intersecting (but not contained) area is a usage error that
    /// would self-deadlock.
    #[must_use]
    pub fn lock_range(&self, from_x: i32, from_z: i32, to_x: i32, to_z: i32) -> AreaLockNode {
        assert!(from_x <= to_x && from_z <= to_z, "invalid range");
        let shift = self.coordinate_shift;
        let from_section_x = from_x >> shift;
        let from_section_z = from_z >> shift;
        let to_section_x = to_x >> shift;
        let to_section_z = to_z >> shift;

        if from_section_x == to_section_x && from_section_z == to_section_z {
            return self.lock(from_x, from_z);
        }

        let current = thread::current();
        let node = Arc::new(AreaNode::new(current.clone()));
        let mut cells =
            Vec::with_capacity(((to_section_x - from_section_x + 1) as usize)
                * ((to_section_z - from_section_z + 1) as usize));

        let mut failures = 0u64;
        loop {
            let mut park: Option<Arc<AreaNode>> = None;
            let mut owned_some = false;

            {
                let guard = self.nodes.guard();
                'scan: for section_z in from_section_z..=to_section_z {
                    for section_x in from_section_x..=to_section_x {
                        let coordinate = pack_coordinate(section_x, section_z);
                        match self.nodes.put_if_absent(coordinate, Arc::clone(&node), &guard) {
                            None => cells.push(coordinate),
                            Some(prev) => {
                                if prev.owner.id() != current.id() {
                                    park = Some(Arc::clone(prev));
                                    break 'scan;
                                }
                                owned_some = true;
                            }
                        }
                    }
                }
            }

            let added = !cells.is_empty();
            if park.is_some() && added {
                // blocked mid-acquisition: release what we took so the
                // holder (and anyone parked on us) can make progress
                self.roll_back(&node, &mut cells);
            }

            let Some(park) = park else {
                if owned_some && added {
                    self.roll_back(&node, &mut cells);
                    panic!("improper lock usage: acquired area intersects cells already held");
                }
                return AreaLockNode {
                    lock_token: Arc::clone(&self.token),
                    node,
                    cells,
                };
            };

            failures += 1;
            self.back_off(&park, &current, &mut failures);

            if added {
                // we are about to retry the inserts; let other threads
                // park on us again
                node.waiters.allow_adds();
            }
        }
    }

    /// Contention response, escalating from busy spinning through short
    /// parks to long scaled parks, with a waiter registration on the
    /// blocking node once contention persists.
    fn back_off(&self, park: &AreaNode, current: &Thread, failures: &mut u64) {
        if *failures > SPIN_FAILURE_LIMIT && park.waiters.add(current.clone()) {
            thread::park();
        } else if *failures < SPIN_FAILURE_LIMIT {
            for _ in 0..*failures {
                std::hint::spin_loop();
            }
            *failures <<= 1;
        } else if *failures < SHORT_PARK_FAILURE_LIMIT {
            thread::park_timeout(Duration::from_micros(1));
            *failures += 1;
        } else {
            // scale 100us per failure
            thread::yield_now();
            thread::park_timeout(Duration::from_micros(100).saturating_mul(*failures as u32));
            *failures += 1;
        }
    }

    /// Removes the cells this acquisition inserted and wakes everything
    /// parked on it.
    fn roll_back(&self, node: &Arc<AreaNode>, cells: &mut Vec<i64>) {
        let guard = self.nodes.guard();
        for &cell in cells.iter() {
            let removed = self.nodes.remove(cell, &guard);
            assert!(
                removed.is_some_and(|prev| Arc::ptr_eq(prev, node)),
                "area lock cell mapped to a foreign node"
            );
        }
        cells.clear();
        node.drain_waiters();
    }

    /// Releases a held area and wakes every thread parked on it.
    ///
    /// # Panics
    ///
    /// Panics if `node` came from a different lock, or if the cell
    /// table no longer maps a released cell to `node` (an internal
    /// invariant violation).
    pub fn unlock(&self, node: AreaLockNode) {
        assert!(
            Arc::ptr_eq(&node.lock_token, &self.token),
            "unlock target lock mismatch"
        );

        if node.cells.is_empty() {
            // fully reentrant acquisition: nothing was inserted, no
            // waiters could have parked on it
            return;
        }

        let guard = self.nodes.guard();
        for &cell in &node.cells {
            let removed = self
                .nodes
                .remove_if(cell, |prev| Arc::ptr_eq(prev, &node.node), &guard);
            assert!(
                removed.is_some_and(|prev| Arc::ptr_eq(prev, &node.node)),
                "area lock cell mapped to a foreign node"
            );
        }

        node.node.drain_waiters();
    }
}

impl std::fmt::Debug for ReentrantAreaLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantAreaLock")
            .field("coordinate_shift", &self.coordinate_shift)
            .field("held_cells", &self.nodes.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn lock_then_unlock_single_cell() {
        let lock = ReentrantAreaLock::new(4);
        let node = lock.lock(10, 10);
        assert!(lock.is_held_by_current_thread(10, 10));
        // same section
        assert!(lock.is_held_by_current_thread(15, 15));
        // neighboring section
        assert!(!lock.is_held_by_current_thread(16, 10));
        lock.unlock(node);
        assert!(!lock.is_held_by_current_thread(10, 10));
    }

    #[test]
    fn try_lock_conflicts_with_other_thread() {
        let lock = Arc::new(ReentrantAreaLock::new(4));
        let node = lock.lock_range(0, 0, 31, 31);

        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            assert!(lock2.try_lock(5, 5).is_none());
            assert!(lock2.try_lock_range(16, 16, 48, 48).is_none());
            // disjoint area succeeds
            let free = lock2.try_lock_range(100, 100, 110, 110).expect("disjoint");
            lock2.unlock(free);
        });
        handle.join().unwrap();

        lock.unlock(node);
    }

    #[test]
    fn try_lock_failure_rolls_back_partial_inserts() {
        let lock = Arc::new(ReentrantAreaLock::new(4));
        // hold only the section at (32..48)
        let node = lock.lock(32, 0);

        let lock2 = Arc::clone(&lock);
        thread::spawn(move || {
            // spans free sections then the held one: must fail and
            // leave the free sections free
            assert!(lock2.try_lock_range(0, 0, 47, 15).is_none());
            let reclaim = lock2.try_lock_range(0, 0, 31, 15).expect("rolled back");
            lock2.unlock(reclaim);
        })
        .join()
        .unwrap();

        lock.unlock(node);
    }

    #[test]
    fn reentrant_subset_is_free() {
        let lock = ReentrantAreaLock::new(4);
        let outer = lock.lock_range(0, 0, 63, 63);
        let inner = lock.lock_range(16, 16, 31, 31);

        // the inner acquisition inserted nothing
        assert!(lock.is_held_by_current_thread_range(0, 0, 63, 63));
        lock.unlock(inner);
        // still held by the outer node
        assert!(lock.is_held_by_current_thread_range(16, 16, 31, 31));
        lock.unlock(outer);
        assert!(!lock.is_held_by_current_thread(16, 16));
    }

    #[test]
    fn radius_shapes_match_ranges() {
        let lock = ReentrantAreaLock::new(4);
        let node = lock.lock_radius(32, 32, 16);
        assert!(lock.is_held_by_current_thread_radius(32, 32, 16));
        assert!(lock.is_held_by_current_thread_range(16, 16, 48, 48));
        lock.unlock(node);
    }

    #[test]
    fn overlap_is_mutually_exclusive() {
        let lock = Arc::new(ReentrantAreaLock::new(4));
        let in_critical = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let iterations = 2_000;

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let in_critical = Arc::clone(&in_critical);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..iterations {
                        let node = lock.lock_range(0, 0, 20, 20);
                        let now = in_critical.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        in_critical.fetch_sub(1, Ordering::SeqCst);
                        lock.unlock(node);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "overlap admitted two holders");
    }

    #[test]
    fn disjoint_areas_run_in_parallel() {
        let lock = Arc::new(ReentrantAreaLock::new(4));
        let barrier = Arc::new(Barrier::new(2));
        let both_inside = Arc::new(AtomicBool::new(false));

        let rects = [(0, 0, 15, 15), (160, 160, 175, 175)];
        let handles: Vec<_> = rects
            .iter()
            .map(|&(fx, fz, tx, tz)| {
                let lock = Arc::clone(&lock);
                let barrier = Arc::clone(&barrier);
                let both_inside = Arc::clone(&both_inside);
                thread::spawn(move || {
                    let node = lock.lock_range(fx, fz, tx, tz);
                    // if both threads reach this barrier while holding
                    // their rectangles, neither blocked the other
                    barrier.wait();
                    both_inside.store(true, Ordering::SeqCst);
                    lock.unlock(node);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(both_inside.load(Ordering::SeqCst));
    }

    #[test]
    fn blocked_thread_wakes_on_unlock() {
        let lock = Arc::new(ReentrantAreaLock::new(4));
        let node = lock.lock(0, 0);
        let acquired = Arc::new(AtomicBool::new(false));

        let waiter = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                let node = lock.lock(0, 0);
                acquired.store(true, Ordering::SeqCst);
                lock.unlock(node);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!acquired.load(Ordering::SeqCst));
        lock.unlock(node);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "unlock target lock mismatch")]
    fn unlock_against_wrong_lock_panics() {
        let lock_a = ReentrantAreaLock::new(4);
        let lock_b = ReentrantAreaLock::new(4);
        let node = lock_a.lock(0, 0);
        lock_b.unlock(node);
    }

    #[test]
    #[should_panic(expected = "invalid range")]
    fn inverted_range_panics() {
        let lock = ReentrantAreaLock::new(4);
        let _ = lock.try_lock_range(10, 0, 0, 0);
    }

    #[test]
    #[should_panic(expected = "intersects cells already held")]
    fn partial_self_overlap_is_rejected() {
        let lock = ReentrantAreaLock::new(4);
        let _held = lock.lock_range(0, 0, 31, 31);
        // extends past the held area: mixes owned and fresh cells
        let _ = lock.lock_range(16, 16, 63, 63);
    }

    #[test]
    fn contended_handoff_cycles() {
        let lock = Arc::new(ReentrantAreaLock::new(4));
        let counter = Arc::new(AtomicUsize::new(0));
        let threads = 4;
        let iterations = 500;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..iterations {
                        let node = lock.lock(8, 8);
                        counter.fetch_add(1, Ordering::SeqCst);
                        lock.unlock(node);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), threads * iterations);
    }
}
