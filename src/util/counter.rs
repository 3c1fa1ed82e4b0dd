//! Striped counter for contended size accounting.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

std::thread_local! {
    // Each thread gets a stable stripe assignment on first use; threads
    // round-robin over the stripes so short-lived threads do not pile
    // onto cell zero.
    static STRIPE: usize = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed);
}

/// A counter sharded over cache-line-padded cells to reduce write
/// contention.
///
/// Each updating thread is pinned to one cell, so concurrent `add`
/// calls from different threads touch distinct cache lines. The total
/// is the sum of all cells and is only as accurate as any concurrent
/// counter can be: `sum` observes each cell once, at some point during
/// the call.
pub struct StripedAdder {
    cells: Box<[CachePadded<AtomicI64>]>,
}

impl StripedAdder {
    /// Creates an adder with one cell per available hardware thread.
    #[must_use]
    pub fn new() -> Self {
        let cells = std::thread::available_parallelism().map_or(4, usize::from);
        Self::with_cells(cells)
    }

    /// Creates an adder with the given number of cells.
    ///
    /// # Panics
    ///
    /// Panics if `cells` is zero.
    #[must_use]
    pub fn with_cells(cells: usize) -> Self {
        assert!(cells > 0, "cell count must be at least 1");
        Self {
            cells: (0..cells)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
        }
    }

    /// Returns the number of cells.
    #[must_use]
    pub fn cells(&self) -> usize {
        self.cells.len()
    }

    /// Adds `delta` to the counter on the calling thread's stripe.
    pub fn add(&self, delta: i64) {
        let stripe = STRIPE.with(|s| *s);
        self.cells[stripe % self.cells.len()].fetch_add(delta, Ordering::SeqCst);
    }

    /// Returns the sum of all cells.
    #[must_use]
    pub fn sum(&self) -> i64 {
        self.cells
            .iter()
            .map(|cell| cell.load(Ordering::SeqCst))
            .fold(0i64, i64::wrapping_add)
    }

    /// Returns the sum clamped to `[0, i32::MAX]`, the shape expected by
    /// size queries.
    #[must_use]
    pub fn sum_saturated(&self) -> usize {
        let sum = self.sum();
        if sum <= 0 {
            0
        } else if sum >= i64::from(i32::MAX) {
            i32::MAX as usize
        } else {
            sum as usize
        }
    }
}

impl Default for StripedAdder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StripedAdder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedAdder")
            .field("cells", &self.cells.len())
            .field("sum", &self.sum())
            .finish()
    }
}
