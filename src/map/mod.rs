//! Concurrent hash table mapping `i64` keys to values, with lock-free
//! readers and fine-grained writer locking.
//!
//! Readers pin an epoch [`Guard`] and walk bucket chains without ever
//! blocking. Writers serialise per bucket on the mutex embedded in the
//! bucket's head node; modifications use release stores so a concurrent
//! reader always observes a consistent chain.
//!
//! # Resizing
//!
//! Exactly one thread wins the threshold CAS and migrates the table.
//! Each old bucket is rebuilt into the successor table with fresh nodes
//! (readers mid-walk keep a stable snapshot of the old chain), then the
//! bucket head is replaced with a terminal *redirect* entry. Readers and
//! writers that encounter a redirect restart in the successor table.
//! Retired nodes and tables are reclaimed through the epoch collector
//! once no reader can still hold them.
//!
//! # Atomicity of the compute family
//!
//! [`compute`](ConcurrentLongMap::compute), [`compute_if_absent`],
//! [`compute_if_present`], [`merge`] and [`remove_if`] hold the bucket
//! lock across the user function: it runs at most once per call and
//! sees a consistent before-value. Calling back into the same map from
//! inside one of these functions is undefined and deadlock-prone.
//!
//! [`compute_if_absent`]: ConcurrentLongMap::compute_if_absent
//! [`compute_if_present`]: ConcurrentLongMap::compute_if_present
//! [`merge`]: ConcurrentLongMap::merge
//! [`remove_if`]: ConcurrentLongMap::remove_if

pub mod iter;

use crate::util::hash;
use crate::util::StripedAdder;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};

pub use iter::{Iter, Keys, Values};

const DEFAULT_CAPACITY: usize = 16;
const DEFAULT_LOAD_FACTOR: f32 = 0.75;
/// Largest permitted table size; at this size the threshold pins to
/// `THRESHOLD_NO_RESIZE` and the table never grows again.
pub const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Threshold state: capacity is at maximum, never resize.
const THRESHOLD_NO_RESIZE: i32 = -1;
/// Threshold state: a resize is in progress.
const THRESHOLD_RESIZING: i32 = -2;

/// One bucket slot: a chain head or a terminal redirect to the
/// successor table.
pub(crate) enum BinEntry<V> {
    Node(Node<V>),
    Redirect(Atomic<Table<V>>),
}

/// A chain node. `value` is null only while the node is a placeholder
/// for an in-flight compute; a placeholder is never observable as
/// mapped.
pub(crate) struct Node<V> {
    pub(crate) key: i64,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinEntry<V>>,
    lock: Mutex<()>,
}

impl<V> Node<V> {
    fn new(key: i64, value: Shared<'_, V>) -> Self {
        Self {
            key,
            value: Atomic::from(value),
            next: Atomic::null(),
            lock: Mutex::new(()),
        }
    }

    fn placeholder(key: i64) -> Self {
        Self {
            key,
            value: Atomic::null(),
            next: Atomic::null(),
            lock: Mutex::new(()),
        }
    }
}

pub(crate) struct Table<V> {
    pub(crate) bins: Box<[Atomic<BinEntry<V>>]>,
}

impl<V> Table<V> {
    fn new(capacity: usize) -> Self {
        Self {
            bins: (0..capacity).map(|_| Atomic::null()).collect(),
        }
    }

    fn bin_for(&self, hash: i64) -> &Atomic<BinEntry<V>> {
        &self.bins[(hash as usize) & (self.bins.len() - 1)]
    }
}

impl<V> Drop for Table<V> {
    fn drop(&mut self) {
        // A table is only dropped when nothing can reach it: retired
        // after a completed resize (every bin a redirect, chain nodes
        // already retired individually) or owned exclusively at map
        // drop (every bin a live chain).
        let guard = unsafe { epoch::unprotected() };
        for bin in self.bins.iter() {
            let entry = bin.load(Ordering::Relaxed, guard);
            if entry.is_null() {
                continue;
            }
            // safety: exclusive ownership per above; entries were
            // allocated by this map and never freed twice because a
            // retired table holds only redirects.
            let mut current = unsafe { entry.into_owned() };
            loop {
                let next = match &*current {
                    BinEntry::Redirect(_) => Shared::null(),
                    BinEntry::Node(node) => {
                        let value = node.value.load(Ordering::Relaxed, guard);
                        if !value.is_null() {
                            // safety: values are owned by their node
                            unsafe { drop(value.into_owned()) };
                        }
                        node.next.load(Ordering::Relaxed, guard)
                    }
                };
                drop(current);
                if next.is_null() {
                    break;
                }
                // safety: chain nodes are uniquely owned by their
                // predecessor
                current = unsafe { next.into_owned() };
            }
        }
    }
}

/// Dereferences a chain entry that is known to be a live node.
///
/// # Safety
///
/// `entry` must be non-null, protected by the guard that loaded it, and
/// must not be a bucket head that could be a redirect.
unsafe fn chain_node<'g, V>(entry: Shared<'g, BinEntry<V>>) -> &'g Node<V> {
    // safety: forwarded to the caller per this function's contract.
    match unsafe { entry.deref() } {
        BinEntry::Node(node) => node,
        BinEntry::Redirect(_) => unreachable!("redirect entry inside a bucket chain"),
    }
}

/// Erases a freshly-installed compute placeholder if the user function
/// does not produce a value (including by panicking).
struct PlaceholderGuard<'g, 'a, V> {
    bin: &'a Atomic<BinEntry<V>>,
    placeholder: Shared<'g, BinEntry<V>>,
    guard: &'g Guard,
    armed: bool,
}

impl<V> Drop for PlaceholderGuard<'_, '_, V> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The placeholder's lock is still held by the caller, so the
        // store below is the bucket's only mutation.
        self.bin.store(Shared::null(), Ordering::SeqCst);
        // safety: the placeholder was installed by the caller and is
        // now unreachable from the bin; pinned readers may still see it
        unsafe { self.guard.defer_destroy(self.placeholder) };
    }
}

/// Concurrent `i64 -> V` chained hash table.
///
/// Multiple writers synchronise per bucket; readers are lock-free.
/// There is a happens-before relationship between the actions of a
/// thread prior to a write into the map and the actions of a thread
/// that subsequently observes that write, exactly as a concurrent map
/// contract requires.
///
/// Read results borrow from an epoch [`Guard`]: obtain one with
/// [`guard`](Self::guard) and keep it alive for as long as the
/// references are used.
pub struct ConcurrentLongMap<V> {
    table: Atomic<Table<V>>,
    size: StripedAdder,
    load_factor: f32,
    threshold: AtomicI32,
}

impl<V> Drop for ConcurrentLongMap<V> {
    fn drop(&mut self) {
        // safety: &mut self, so no other thread can access the map; the
        // current table and everything reachable from it is ours.
        let guard = unsafe { epoch::unprotected() };
        let table = self.table.load(Ordering::Relaxed, guard);
        if !table.is_null() {
            unsafe { drop(table.into_owned()) };
        }
    }
}

fn target_threshold(capacity: usize, load_factor: f32) -> i32 {
    let target = capacity as f64 * f64::from(load_factor);
    if !target.is_finite() || target >= f64::from(i32::MAX) {
        THRESHOLD_NO_RESIZE
    } else {
        target.ceil() as i32
    }
}

fn capacity_for(capacity: usize) -> usize {
    assert!(capacity > 0, "invalid capacity: {capacity}");
    if capacity >= MAXIMUM_CAPACITY {
        MAXIMUM_CAPACITY
    } else {
        capacity.next_power_of_two()
    }
}

impl<V: Send + Sync + 'static> Default for ConcurrentLongMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Send + Sync + 'static> ConcurrentLongMap<V> {
    /// Creates a map with the default capacity and load factor.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, DEFAULT_LOAD_FACTOR)
    }

    /// Creates a map that can hold `capacity` entries before its first
    /// resize at the given load factor.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or `load_factor` is not a positive
    /// finite number.
    #[must_use]
    pub fn with_capacity(capacity: usize, load_factor: f32) -> Self {
        assert!(
            load_factor > 0.0 && load_factor.is_finite(),
            "invalid load factor: {load_factor}"
        );
        let table_size = capacity_for(capacity);
        let threshold = if table_size == MAXIMUM_CAPACITY {
            THRESHOLD_NO_RESIZE
        } else {
            target_threshold(table_size, load_factor)
        };
        Self {
            table: Atomic::new(Table::new(table_size)),
            size: StripedAdder::new(),
            load_factor,
            threshold: AtomicI32::new(threshold),
        }
    }

    /// Creates a map sized for `expected` entries without resizing.
    ///
    /// # Panics
    ///
    /// Panics if `expected` is zero or `load_factor` is not a positive
    /// finite number.
    #[must_use]
    pub fn with_expected(expected: usize, load_factor: f32) -> Self {
        assert!(
            load_factor > 0.0 && load_factor.is_finite(),
            "invalid load factor: {load_factor}"
        );
        let capacity = (expected as f64 / f64::from(load_factor)).ceil() as usize;
        Self::with_capacity(capacity.max(1), load_factor)
    }

    /// Returns the load factor this map resizes at.
    #[must_use]
    pub fn load_factor(&self) -> f32 {
        self.load_factor
    }

    /// Pins the current thread's epoch. Keep the returned guard alive
    /// while using any references obtained from this map.
    #[must_use]
    pub fn guard(&self) -> Guard {
        epoch::pin()
    }

    /// Returns the node for `key`, which may be a compute placeholder.
    fn get_node<'g>(&'g self, key: i64, guard: &'g Guard) -> Option<&'g Node<V>> {
        let hash = hash::mix(key);
        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        loop {
            // safety: the guard pins the epoch; tables are retired
            // through it and so stay valid while it is held.
            let table = unsafe { table_shared.deref() };
            let mut entry = table.bin_for(hash).load(Ordering::SeqCst, guard);
            if entry.is_null() {
                return None;
            }
            // safety: same guard protection as above.
            if let BinEntry::Redirect(next) = unsafe { entry.deref() } {
                table_shared = next.load(Ordering::SeqCst, guard);
                continue;
            }
            loop {
                // safety: head was checked for redirect; chain interiors
                // are always nodes.
                let node = unsafe { chain_node(entry) };
                if node.key == key {
                    return Some(node);
                }
                entry = node.next.load(Ordering::SeqCst, guard);
                if entry.is_null() {
                    return None;
                }
            }
        }
    }

    /// Returns the value mapped to `key`, if any.
    #[must_use]
    pub fn get<'g>(&'g self, key: i64, guard: &'g Guard) -> Option<&'g V> {
        let node = self.get_node(key, guard)?;
        let value = node.value.load(Ordering::SeqCst, guard);
        if value.is_null() {
            // compute placeholder: not observable as mapped
            return None;
        }
        // safety: values are retired through the epoch; the guard keeps
        // this one alive.
        Some(unsafe { value.deref() })
    }

    /// Returns a clone of the value mapped to `key`, if any.
    #[must_use]
    pub fn get_cloned(&self, key: i64) -> Option<V>
    where
        V: Clone,
    {
        let guard = self.guard();
        self.get(key, &guard).cloned()
    }

    /// Returns a clone of the value mapped to `key`, or `default`.
    #[must_use]
    pub fn get_or_default(&self, key: i64, default: V) -> V
    where
        V: Clone,
    {
        self.get_cloned(key).unwrap_or(default)
    }

    /// Returns whether `key` is mapped to a value.
    #[must_use]
    pub fn contains_key(&self, key: i64) -> bool {
        let guard = self.guard();
        self.get(key, &guard).is_some()
    }

    /// Returns whether some key is mapped to `value`.
    #[must_use]
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = self.guard();
        self.values(&guard).any(|candidate| candidate == value)
    }

    /// Returns the number of mappings, saturating at `i32::MAX`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size.sum_saturated()
    }

    /// Returns whether the map has no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size.sum() <= 0
    }

    /// Adds to the size counter and triggers a resize when the
    /// threshold is crossed.
    fn add_size(&self, count: i64, guard: &Guard) {
        self.size.add(count);

        let threshold = self.threshold.load(Ordering::Acquire);
        if threshold < 0 {
            // resizing, or resizing disallowed; nothing to do either way
            return;
        }
        let sum = self.size.sum();
        if sum < i64::from(threshold) {
            return;
        }
        if self
            .threshold
            .compare_exchange(
                threshold,
                THRESHOLD_RESIZING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // some other thread won the resize
            return;
        }
        self.resize(sum, guard);
    }

    fn sub_size(&self, count: i64) {
        self.size.add(-count);
    }

    /// Migrates the table to a capacity fitting `sum` mappings. Only
    /// the thread that moved the threshold to `THRESHOLD_RESIZING` may
    /// call this.
    fn resize(&self, sum: i64, guard: &Guard) {
        let target = (sum as f64 / f64::from(self.load_factor)) + 1.0;
        let capacity = if target >= MAXIMUM_CAPACITY as f64 {
            MAXIMUM_CAPACITY
        } else {
            (target.ceil() as usize)
                .next_power_of_two()
                .min(MAXIMUM_CAPACITY)
        };

        let old_shared = self.table.load(Ordering::SeqCst, guard);
        // safety: the current table is valid while the guard is held.
        let old = unsafe { old_shared.deref() };
        let old_len = old.bins.len();
        assert_ne!(capacity, old_len, "resizing to the same capacity");

        let new_shared = Owned::new(Table::new(capacity)).into_shared(guard);
        // safety: just allocated, unpublished; we own it until the
        // table store below.
        let new = unsafe { new_shared.deref() };

        let old_shift = old_len.trailing_zeros();
        // Entries from old bin i can only land in capacity/old_len new
        // bins; `work` tracks the chain tail per target bin.
        let mut work: Vec<Shared<'_, BinEntry<V>>> = vec![Shared::null(); capacity / old_len];
        let mut retired: Vec<Shared<'_, BinEntry<V>>> = Vec::new();

        for bin in old.bins.iter() {
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    // nothing to move; just install the redirect
                    let redirect = Owned::new(BinEntry::Redirect(Atomic::from(new_shared)));
                    match bin.compare_exchange(
                        Shared::null(),
                        redirect,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    ) {
                        Ok(_) => break,
                        Err(error) => {
                            head = error.current;
                            continue;
                        }
                    }
                }

                // safety: guard-protected; a redirect is impossible here
                // because only one resize runs at a time.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Node(node) => node,
                    BinEntry::Redirect(_) => unreachable!("concurrent table resize"),
                };

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                // No published writes are needed while rebuilding: the
                // new chains only become reachable once the redirect
                // below is release-stored.
                for slot in &mut work {
                    *slot = Shared::null();
                }
                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    let new_idx = (hash::mix(node.key) as usize) & (capacity - 1);
                    let work_idx = new_idx >> old_shift;

                    let value = node.value.load(Ordering::Relaxed, guard);
                    let replacement =
                        Owned::new(BinEntry::Node(Node::new(node.key, value))).into_shared(guard);

                    let tail = work[work_idx];
                    work[work_idx] = replacement;
                    if tail.is_null() {
                        new.bins[new_idx].store(replacement, Ordering::Relaxed);
                    } else {
                        // safety: `tail` is a node we allocated above.
                        unsafe { chain_node(tail) }
                            .next
                            .store(replacement, Ordering::Relaxed);
                    }

                    retired.push(entry);
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        break;
                    }
                    entry = next;
                }

                let redirect = Owned::new(BinEntry::Redirect(Atomic::from(new_shared)));
                bin.store(redirect, Ordering::Release);
                drop(lock);

                // The old chain is unreachable for new readers; pinned
                // readers keep it alive until their guards drop. Values
                // moved to the fresh nodes and are not retired here.
                for entry in retired.drain(..) {
                    // safety: we unlinked these nodes above.
                    unsafe { guard.defer_destroy(entry) };
                }
                break;
            }
        }

        let new_threshold = if capacity == MAXIMUM_CAPACITY {
            THRESHOLD_NO_RESIZE
        } else {
            target_threshold(capacity, self.load_factor)
        };

        self.table.store(new_shared, Ordering::SeqCst);
        // safety: the old table is no longer reachable from the map;
        // its bins hold only redirects, which its drop frees.
        unsafe { guard.defer_destroy(old_shared) };
        self.threshold.store(new_threshold, Ordering::SeqCst);
    }

    /// Maps `key` to `value`, returning the previous value if any.
    pub fn put<'g>(&'g self, key: i64, value: V, guard: &'g Guard) -> Option<&'g V> {
        let hash = hash::mix(key);
        let value = Owned::new(value).into_shared(guard);

        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        'table: loop {
            // safety: guard-protected table pointer.
            let table = unsafe { table_shared.deref() };
            let bin = table.bin_for(hash);
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    let node = Owned::new(BinEntry::Node(Node::new(key, value)));
                    match bin.compare_exchange(
                        Shared::null(),
                        node,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    ) {
                        Ok(_) => {
                            self.add_size(1, guard);
                            return None;
                        }
                        Err(error) => head = error.current,
                    }
                }

                // safety: guard-protected bucket head.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Redirect(next) => {
                        table_shared = next.load(Ordering::SeqCst, guard);
                        continue 'table;
                    }
                    BinEntry::Node(node) => node,
                };

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                // bucket lock held: plain reads, release publication
                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    if node.key == key {
                        let old = node.value.load(Ordering::Relaxed, guard);
                        node.value.store(value, Ordering::SeqCst);
                        // safety: the old value is unreachable once the
                        // store above is visible.
                        unsafe { guard.defer_destroy(old) };
                        // safety: guard keeps the retired value alive.
                        return Some(unsafe { old.deref() });
                    }
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        let appended = Owned::new(BinEntry::Node(Node::new(key, value)));
                        node.next.store(appended, Ordering::Release);
                        break;
                    }
                    entry = next;
                }
                drop(lock);

                self.add_size(1, guard);
                return None;
            }
        }
    }

    /// Maps `key` to `value` only if `key` is currently unmapped.
    /// Returns the existing value otherwise.
    pub fn put_if_absent<'g>(&'g self, key: i64, value: V, guard: &'g Guard) -> Option<&'g V> {
        let hash = hash::mix(key);
        let value = Owned::new(value).into_shared(guard);

        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        'table: loop {
            // safety: guard-protected table pointer.
            let table = unsafe { table_shared.deref() };
            let bin = table.bin_for(hash);
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    let node = Owned::new(BinEntry::Node(Node::new(key, value)));
                    match bin.compare_exchange(
                        Shared::null(),
                        node,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    ) {
                        Ok(_) => {
                            self.add_size(1, guard);
                            return None;
                        }
                        Err(error) => head = error.current,
                    }
                }

                // safety: guard-protected bucket head.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Redirect(next) => {
                        table_shared = next.load(Ordering::SeqCst, guard);
                        continue 'table;
                    }
                    BinEntry::Node(node) => node,
                };

                // fast path for the common hit: check the head before
                // taking the lock
                if head_node.key == key {
                    let existing = head_node.value.load(Ordering::SeqCst, guard);
                    if !existing.is_null() {
                        // safety: our unpublished allocation.
                        unsafe { drop(value.into_owned()) };
                        // safety: guard-protected value.
                        return Some(unsafe { existing.deref() });
                    }
                    // placeholder head: fall through to the lock
                }

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    if node.key == key {
                        let existing = node.value.load(Ordering::Relaxed, guard);
                        // under the lock a placeholder cannot persist:
                        // its owner resolves it before releasing
                        // safety: our unpublished allocation.
                        unsafe { drop(value.into_owned()) };
                        // safety: guard-protected value.
                        return Some(unsafe { existing.deref() });
                    }
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        let appended = Owned::new(BinEntry::Node(Node::new(key, value)));
                        node.next.store(appended, Ordering::Release);
                        break;
                    }
                    entry = next;
                }
                drop(lock);

                self.add_size(1, guard);
                return None;
            }
        }
    }

    /// Replaces the value for `key` if it is mapped, returning the
    /// previous value.
    pub fn replace<'g>(&'g self, key: i64, value: V, guard: &'g Guard) -> Option<&'g V> {
        let hash = hash::mix(key);
        let value = Owned::new(value).into_shared(guard);

        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        'table: loop {
            // safety: guard-protected table pointer.
            let table = unsafe { table_shared.deref() };
            let bin = table.bin_for(hash);
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    // safety: our unpublished allocation.
                    unsafe { drop(value.into_owned()) };
                    return None;
                }

                // safety: guard-protected bucket head.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Redirect(next) => {
                        table_shared = next.load(Ordering::SeqCst, guard);
                        continue 'table;
                    }
                    BinEntry::Node(node) => node,
                };

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    if node.key == key {
                        let old = node.value.load(Ordering::Relaxed, guard);
                        node.value.store(value, Ordering::SeqCst);
                        // safety: old value unreachable after the store.
                        unsafe { guard.defer_destroy(old) };
                        // safety: guard keeps the retired value alive.
                        return Some(unsafe { old.deref() });
                    }
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        break;
                    }
                    entry = next;
                }
                drop(lock);
                // safety: our unpublished allocation.
                unsafe { drop(value.into_owned()) };
                return None;
            }
        }
    }

    /// Replaces the value for `key` with `update` only if the current
    /// value equals `expect`. Returns the previous value (`expect` on
    /// success), or `None` when unmapped.
    pub fn replace_expect<'g>(
        &'g self,
        key: i64,
        expect: &V,
        update: V,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        V: PartialEq,
    {
        let hash = hash::mix(key);
        let update = Owned::new(update).into_shared(guard);

        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        'table: loop {
            // safety: guard-protected table pointer.
            let table = unsafe { table_shared.deref() };
            let bin = table.bin_for(hash);
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    // safety: our unpublished allocation.
                    unsafe { drop(update.into_owned()) };
                    return None;
                }

                // safety: guard-protected bucket head.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Redirect(next) => {
                        table_shared = next.load(Ordering::SeqCst, guard);
                        continue 'table;
                    }
                    BinEntry::Node(node) => node,
                };

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    if node.key == key {
                        let old = node.value.load(Ordering::Relaxed, guard);
                        // safety: guard-protected value.
                        let old_ref = unsafe { old.deref() };
                        if old_ref != expect {
                            // safety: our unpublished allocation.
                            unsafe { drop(update.into_owned()) };
                            return Some(old_ref);
                        }
                        node.value.store(update, Ordering::SeqCst);
                        // safety: old value unreachable after the store.
                        unsafe { guard.defer_destroy(old) };
                        return Some(old_ref);
                    }
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        break;
                    }
                    entry = next;
                }
                drop(lock);
                // safety: our unpublished allocation.
                unsafe { drop(update.into_owned()) };
                return None;
            }
        }
    }

    /// Removes the mapping for `key`, returning its value if present.
    pub fn remove<'g>(&'g self, key: i64, guard: &'g Guard) -> Option<&'g V> {
        self.remove_filtered(key, |_| true, guard)
    }

    /// Removes the mapping for `key` only if its value equals `expect`.
    /// Returns the previous value (`expect` on removal), or `None` when
    /// unmapped.
    pub fn remove_expect<'g>(&'g self, key: i64, expect: &V, guard: &'g Guard) -> Option<&'g V>
    where
        V: PartialEq,
    {
        self.remove_filtered(key, |value| value == expect, guard)
    }

    /// Removes the mapping for `key` only if `predicate` accepts its
    /// value. Returns the value the predicate saw, removed or not.
    pub fn remove_if<'g>(
        &'g self,
        key: i64,
        predicate: impl FnOnce(&V) -> bool,
        guard: &'g Guard,
    ) -> Option<&'g V> {
        self.remove_filtered(key, predicate, guard)
    }

    fn remove_filtered<'g>(
        &'g self,
        key: i64,
        predicate: impl FnOnce(&V) -> bool,
        guard: &'g Guard,
    ) -> Option<&'g V> {
        let hash = hash::mix(key);
        let mut predicate = Some(predicate);

        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        'table: loop {
            // safety: guard-protected table pointer.
            let table = unsafe { table_shared.deref() };
            let bin = table.bin_for(hash);
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    return None;
                }

                // safety: guard-protected bucket head.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Redirect(next) => {
                        table_shared = next.load(Ordering::SeqCst, guard);
                        continue 'table;
                    }
                    BinEntry::Node(node) => node,
                };

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                let mut prev: Option<&Node<V>> = None;
                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    if node.key == key {
                        let value = node.value.load(Ordering::Relaxed, guard);
                        // safety: guard-protected value; non-null under
                        // the lock (placeholders resolve before their
                        // owner releases it).
                        let value_ref = unsafe { value.deref() };
                        let keep = !(predicate.take().expect("predicate already consumed"))(
                            value_ref,
                        );
                        if keep {
                            return Some(value_ref);
                        }

                        let next = node.next.load(Ordering::Relaxed, guard);
                        match prev {
                            None => bin.store(next, Ordering::Release),
                            Some(prev) => prev.next.store(next, Ordering::Release),
                        }
                        // safety: node and value are unreachable once
                        // the unlink above is visible.
                        unsafe {
                            guard.defer_destroy(entry);
                            guard.defer_destroy(value);
                        }
                        drop(lock);
                        self.sub_size(1);
                        return Some(value_ref);
                    }
                    prev = Some(node);
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        return None;
                    }
                    entry = next;
                }
            }
        }
    }

    /// Atomically recomputes the mapping for `key`. The function sees
    /// the current value (or `None`) and returns the new value (or
    /// `None` to remove). Runs at most once per call.
    pub fn compute<'g, F>(&'g self, key: i64, function: F, guard: &'g Guard) -> Option<&'g V>
    where
        F: FnOnce(i64, Option<&V>) -> Option<V>,
    {
        let hash = hash::mix(key);
        let mut function = Some(function);

        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        'table: loop {
            // safety: guard-protected table pointer.
            let table = unsafe { table_shared.deref() };
            let bin = table.bin_for(hash);
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    let placeholder =
                        Owned::new(BinEntry::Node(Node::placeholder(key))).into_shared(guard);
                    // safety: just allocated and unpublished.
                    let placeholder_node = unsafe { chain_node(placeholder) };
                    // lock before publication so competing writers block
                    // until the user function resolves the placeholder
                    let lock = placeholder_node.lock.lock();
                    match bin.compare_exchange(
                        Shared::null(),
                        placeholder,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    ) {
                        Ok(_) => {
                            let mut erase = PlaceholderGuard {
                                bin,
                                placeholder,
                                guard,
                                armed: true,
                            };
                            let computed =
                                (function.take().expect("compute function already consumed"))(
                                    key, None,
                                );
                            let Some(computed) = computed else {
                                // erase guard removes the placeholder
                                return None;
                            };
                            erase.armed = false;
                            let value = Owned::new(computed).into_shared(guard);
                            placeholder_node.value.store(value, Ordering::Release);
                            drop(lock);
                            self.add_size(1, guard);
                            // safety: just published under the lock.
                            return Some(unsafe { value.deref() });
                        }
                        Err(error) => {
                            drop(lock);
                            // safety: our unpublished allocation.
                            unsafe { drop(placeholder.into_owned()) };
                            head = error.current;
                        }
                    }
                }

                // safety: guard-protected bucket head.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Redirect(next) => {
                        table_shared = next.load(Ordering::SeqCst, guard);
                        continue 'table;
                    }
                    BinEntry::Node(node) => node,
                };

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                let mut prev: Option<&Node<V>> = None;
                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    if node.key == key {
                        let old = node.value.load(Ordering::Relaxed, guard);
                        // safety: guard-protected, non-null under lock.
                        let old_ref = unsafe { old.deref() };
                        let computed = (function
                            .take()
                            .expect("compute function already consumed"))(
                            key, Some(old_ref)
                        );
                        match computed {
                            Some(computed) => {
                                let value = Owned::new(computed).into_shared(guard);
                                node.value.store(value, Ordering::SeqCst);
                                // safety: old value unreachable now.
                                unsafe { guard.defer_destroy(old) };
                                // safety: just published under the lock.
                                return Some(unsafe { value.deref() });
                            }
                            None => {
                                let next = node.next.load(Ordering::Relaxed, guard);
                                match prev {
                                    None => bin.store(next, Ordering::Release),
                                    Some(prev) => prev.next.store(next, Ordering::Release),
                                }
                                // safety: unlinked above.
                                unsafe {
                                    guard.defer_destroy(entry);
                                    guard.defer_destroy(old);
                                }
                                drop(lock);
                                self.sub_size(1);
                                return None;
                            }
                        }
                    }
                    prev = Some(node);
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        break;
                    }
                    entry = next;
                }

                // key absent: ask the function for an initial value
                let computed =
                    (function.take().expect("compute function already consumed"))(key, None);
                let Some(computed) = computed else {
                    return None;
                };
                let value = Owned::new(computed).into_shared(guard);
                let appended = Owned::new(BinEntry::Node(Node::new(key, value)));
                prev.expect("non-empty bucket with no tail")
                    .next
                    .store(appended, Ordering::Release);
                drop(lock);
                self.add_size(1, guard);
                // safety: just published under the lock.
                return Some(unsafe { value.deref() });
            }
        }
    }

    /// Atomically maps `key` if currently unmapped. The function runs
    /// at most once; returning `None` leaves the map unchanged. An
    /// existing mapping is returned untouched without invoking the
    /// function.
    pub fn compute_if_absent<'g, F>(
        &'g self,
        key: i64,
        function: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        F: FnOnce(i64) -> Option<V>,
    {
        let hash = hash::mix(key);
        let mut function = Some(function);

        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        'table: loop {
            // safety: guard-protected table pointer.
            let table = unsafe { table_shared.deref() };
            let bin = table.bin_for(hash);
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    let placeholder =
                        Owned::new(BinEntry::Node(Node::placeholder(key))).into_shared(guard);
                    // safety: just allocated and unpublished.
                    let placeholder_node = unsafe { chain_node(placeholder) };
                    let lock = placeholder_node.lock.lock();
                    match bin.compare_exchange(
                        Shared::null(),
                        placeholder,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    ) {
                        Ok(_) => {
                            let mut erase = PlaceholderGuard {
                                bin,
                                placeholder,
                                guard,
                                armed: true,
                            };
                            let computed = (function
                                .take()
                                .expect("compute function already consumed"))(
                                key
                            );
                            let Some(computed) = computed else {
                                // erase guard removes the placeholder
                                return None;
                            };
                            erase.armed = false;
                            let value = Owned::new(computed).into_shared(guard);
                            placeholder_node.value.store(value, Ordering::Release);
                            drop(lock);
                            self.add_size(1, guard);
                            // safety: just published under the lock.
                            return Some(unsafe { value.deref() });
                        }
                        Err(error) => {
                            drop(lock);
                            // safety: our unpublished allocation.
                            unsafe { drop(placeholder.into_owned()) };
                            head = error.current;
                        }
                    }
                }

                // safety: guard-protected bucket head.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Redirect(next) => {
                        table_shared = next.load(Ordering::SeqCst, guard);
                        continue 'table;
                    }
                    BinEntry::Node(node) => node,
                };

                // fast path for the common hit: check the head before
                // taking the lock
                if head_node.key == key {
                    let existing = head_node.value.load(Ordering::SeqCst, guard);
                    if !existing.is_null() {
                        // safety: guard-protected value.
                        return Some(unsafe { existing.deref() });
                    }
                    // placeholder head: fall through to the lock
                }

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    if node.key == key {
                        let existing = node.value.load(Ordering::Relaxed, guard);
                        // safety: guard-protected, non-null under lock.
                        return Some(unsafe { existing.deref() });
                    }
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        break;
                    }
                    entry = next;
                }

                // key absent: ask the function for an initial value
                let computed =
                    (function.take().expect("compute function already consumed"))(key);
                let Some(computed) = computed else {
                    return None;
                };
                let value = Owned::new(computed).into_shared(guard);
                let appended = Owned::new(BinEntry::Node(Node::new(key, value)));
                // safety: `entry` is the chain tail, held under the lock.
                unsafe { chain_node(entry) }
                    .next
                    .store(appended, Ordering::Release);
                drop(lock);
                self.add_size(1, guard);
                // safety: just published under the lock.
                return Some(unsafe { value.deref() });
            }
        }
    }

    /// Atomically recomputes the mapping for `key` only if it is
    /// mapped. Returning `None` removes the mapping.
    pub fn compute_if_present<'g, F>(
        &'g self,
        key: i64,
        function: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        F: FnOnce(i64, &V) -> Option<V>,
    {
        let hash = hash::mix(key);
        let mut function = Some(function);

        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        'table: loop {
            // safety: guard-protected table pointer.
            let table = unsafe { table_shared.deref() };
            let bin = table.bin_for(hash);
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    return None;
                }

                // safety: guard-protected bucket head.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Redirect(next) => {
                        table_shared = next.load(Ordering::SeqCst, guard);
                        continue 'table;
                    }
                    BinEntry::Node(node) => node,
                };

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                let mut prev: Option<&Node<V>> = None;
                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    if node.key == key {
                        let old = node.value.load(Ordering::Relaxed, guard);
                        // safety: guard-protected, non-null under lock.
                        let old_ref = unsafe { old.deref() };
                        let computed = (function
                            .take()
                            .expect("compute function already consumed"))(
                            key, old_ref
                        );
                        match computed {
                            Some(computed) => {
                                let value = Owned::new(computed).into_shared(guard);
                                node.value.store(value, Ordering::SeqCst);
                                // safety: old value unreachable now.
                                unsafe { guard.defer_destroy(old) };
                                // safety: just published under the lock.
                                return Some(unsafe { value.deref() });
                            }
                            None => {
                                let next = node.next.load(Ordering::Relaxed, guard);
                                match prev {
                                    None => bin.store(next, Ordering::Release),
                                    Some(prev) => prev.next.store(next, Ordering::Release),
                                }
                                // safety: unlinked above.
                                unsafe {
                                    guard.defer_destroy(entry);
                                    guard.defer_destroy(old);
                                }
                                drop(lock);
                                self.sub_size(1);
                                return None;
                            }
                        }
                    }
                    prev = Some(node);
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        return None;
                    }
                    entry = next;
                }
            }
        }
    }

    /// Atomically merges: unmapped keys take `default`; mapped keys are
    /// recombined by `function`, which may return `None` to remove.
    pub fn merge<'g, F>(
        &'g self,
        key: i64,
        default: V,
        function: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        F: FnOnce(&V, &V) -> Option<V>,
    {
        let hash = hash::mix(key);
        let mut function = Some(function);
        let default = Owned::new(default).into_shared(guard);

        let mut table_shared = self.table.load(Ordering::SeqCst, guard);
        'table: loop {
            // safety: guard-protected table pointer.
            let table = unsafe { table_shared.deref() };
            let bin = table.bin_for(hash);
            let mut head = bin.load(Ordering::SeqCst, guard);
            loop {
                if head.is_null() {
                    let node = Owned::new(BinEntry::Node(Node::new(key, default)));
                    match bin.compare_exchange(
                        Shared::null(),
                        node,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                        guard,
                    ) {
                        Ok(_) => {
                            self.add_size(1, guard);
                            // safety: just published.
                            return Some(unsafe { default.deref() });
                        }
                        Err(error) => head = error.current,
                    }
                }

                // safety: guard-protected bucket head.
                let head_node = match unsafe { head.deref() } {
                    BinEntry::Redirect(next) => {
                        table_shared = next.load(Ordering::SeqCst, guard);
                        continue 'table;
                    }
                    BinEntry::Node(node) => node,
                };

                let lock = head_node.lock.lock();
                let current = bin.load(Ordering::SeqCst, guard);
                if current != head {
                    drop(lock);
                    head = current;
                    continue;
                }

                let mut prev: Option<&Node<V>> = None;
                let mut entry = head;
                loop {
                    // safety: chain entries under the bucket lock.
                    let node = unsafe { chain_node(entry) };
                    if node.key == key {
                        let old = node.value.load(Ordering::Relaxed, guard);
                        // safety: guard-protected, non-null under lock.
                        let old_ref = unsafe { old.deref() };
                        // safety: our allocation, not yet published.
                        let default_ref = unsafe { default.deref() };
                        let computed = (function
                            .take()
                            .expect("merge function already consumed"))(
                            old_ref, default_ref
                        );
                        let ret = match computed {
                            Some(computed) => {
                                let value = Owned::new(computed).into_shared(guard);
                                node.value.store(value, Ordering::SeqCst);
                                // safety: old value unreachable now.
                                unsafe { guard.defer_destroy(old) };
                                // safety: just published under the lock.
                                Some(unsafe { value.deref() })
                            }
                            None => {
                                let next = node.next.load(Ordering::Relaxed, guard);
                                match prev {
                                    None => bin.store(next, Ordering::Release),
                                    Some(prev) => prev.next.store(next, Ordering::Release),
                                }
                                // safety: unlinked above.
                                unsafe {
                                    guard.defer_destroy(entry);
                                    guard.defer_destroy(old);
                                }
                                self.sub_size(1);
                                None
                            }
                        };
                        drop(lock);
                        // safety: the default allocation was never
                        // published.
                        unsafe { drop(default.into_owned()) };
                        return ret;
                    }
                    prev = Some(node);
                    let next = node.next.load(Ordering::Relaxed, guard);
                    if next.is_null() {
                        break;
                    }
                    entry = next;
                }

                // key absent: append the default
                let appended = Owned::new(BinEntry::Node(Node::new(key, default)));
                prev.expect("non-empty bucket with no tail")
                    .next
                    .store(appended, Ordering::Release);
                drop(lock);
                self.add_size(1, guard);
                // safety: just published.
                return Some(unsafe { default.deref() });
            }
        }
    }

    /// Removes at least every entry present at the beginning of the
    /// call. Not atomic: entries added concurrently may survive.
    pub fn clear(&self) {
        let guard = self.guard();
        let keys: Vec<i64> = self.keys(&guard).collect();
        for key in keys {
            self.remove(key, &guard);
        }
    }

    /// Iterates `(key, &value)` pairs. The iterator sees every entry
    /// present at creation and may observe concurrent insertions.
    #[must_use]
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, V> {
        Iter::new(self.table.load(Ordering::SeqCst, guard), guard)
    }

    /// Iterates keys; same visibility as [`iter`](Self::iter).
    #[must_use]
    pub fn keys<'g>(&'g self, guard: &'g Guard) -> Keys<'g, V> {
        Keys::new(self.iter(guard))
    }

    /// Iterates values; same visibility as [`iter`](Self::iter).
    #[must_use]
    pub fn values<'g>(&'g self, guard: &'g Guard) -> Values<'g, V> {
        Values::new(self.iter(guard))
    }
}

impl<V> std::fmt::Debug for ConcurrentLongMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentLongMap")
            .field("size", &self.size.sum())
            .field("load_factor", &self.load_factor)
            .finish()
    }
}

#[cfg(test)]
mod tests;
