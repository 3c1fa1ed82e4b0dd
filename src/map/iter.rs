//! Iterators over [`ConcurrentLongMap`](super::ConcurrentLongMap).
//!
//! The walker carries a stack of tables: crossing a redirect descends
//! into the successor table with the old table's length as the bin
//! increment, and exhausting a table's reachable bins pops back out.
//! Every key present at iterator creation is visited; concurrent
//! insertions may or may not be seen. Compute placeholders are skipped.

use super::{chain_node, BinEntry, Node, Table};
use crossbeam_epoch::{Guard, Shared};
use std::sync::atomic::Ordering;

struct NodeIter<'g, V> {
    guard: &'g Guard,
    current_table: Option<Shared<'g, Table<V>>>,
    /// Enclosing (older) tables; the last element is the one we pop
    /// back into when the current table is exhausted.
    outer: Vec<Shared<'g, Table<V>>>,
    last: Option<&'g Node<V>>,
    next_bin: usize,
    increment: usize,
}

impl<'g, V> NodeIter<'g, V> {
    fn new(table: Shared<'g, Table<V>>, guard: &'g Guard) -> Self {
        Self {
            guard,
            current_table: Some(table),
            outer: Vec::new(),
            last: None,
            next_bin: 0,
            increment: 1,
        }
    }

    /// Pops back into the enclosing table after exhausting the current
    /// one. Returns `false` when the walk is complete.
    fn pull(&mut self) -> bool {
        let index = self.next_bin;
        let Some(outer_shared) = self.outer.pop() else {
            self.current_table = None;
            return false;
        };
        // safety: tables on the stack are guard-protected.
        let outer = unsafe { outer_shared.deref() };

        // The increments applied while inside the successor were
        // multiples of the outer length, so masking recovers the outer
        // bin we descended from; skip past it.
        let mut index = index & (outer.bins.len() - 1);
        let increment = match self.outer.last() {
            None => 1,
            // safety: guard-protected.
            Some(table) => unsafe { table.deref() }.bins.len(),
        };
        index += increment;

        self.increment = increment;
        self.next_bin = index;
        self.current_table = Some(outer_shared);
        true
    }

    fn next_node(&mut self) -> Option<(i64, &'g V)> {
        loop {
            // continue along the current chain first
            if let Some(last) = self.last {
                let next = last.next.load(Ordering::SeqCst, self.guard);
                if !next.is_null() {
                    // safety: chain interiors are nodes, guard-protected.
                    let node = unsafe { chain_node(next) };
                    self.last = Some(node);
                    let value = node.value.load(Ordering::SeqCst, self.guard);
                    if value.is_null() {
                        // compute placeholder
                        continue;
                    }
                    // safety: guard-protected value.
                    return Some((node.key, unsafe { value.deref() }));
                }
            }

            let table_shared = self.current_table?;
            // safety: guard-protected.
            let table = unsafe { table_shared.deref() };

            loop {
                if self.next_bin >= table.bins.len() {
                    if self.pull() {
                        break; // re-enter with the popped table
                    }
                    self.last = None;
                    return None;
                }

                let entry = table.bins[self.next_bin].load(Ordering::SeqCst, self.guard);
                if entry.is_null() {
                    self.next_bin += self.increment;
                    continue;
                }

                // safety: guard-protected bucket head.
                match unsafe { entry.deref() } {
                    BinEntry::Redirect(next_table) => {
                        // descend; bins of the successor repeat with the
                        // old length as stride
                        let successor = next_table.load(Ordering::SeqCst, self.guard);
                        self.increment = table.bins.len();
                        self.outer.push(table_shared);
                        self.current_table = Some(successor);
                        break;
                    }
                    BinEntry::Node(node) => {
                        self.last = Some(node);
                        self.next_bin += self.increment;
                        let value = node.value.load(Ordering::SeqCst, self.guard);
                        if value.is_null() {
                            // placeholder head; its chain may still
                            // hold live nodes
                            break;
                        }
                        // safety: guard-protected value.
                        return Some((node.key, unsafe { value.deref() }));
                    }
                }
            }
        }
    }
}

/// Iterator over `(key, &value)` pairs.
pub struct Iter<'g, V> {
    nodes: NodeIter<'g, V>,
}

impl<'g, V> Iter<'g, V> {
    pub(super) fn new(table: Shared<'g, Table<V>>, guard: &'g Guard) -> Self {
        Self {
            nodes: NodeIter::new(table, guard),
        }
    }
}

impl<'g, V> Iterator for Iter<'g, V> {
    type Item = (i64, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        self.nodes.next_node()
    }
}

/// Iterator over keys.
pub struct Keys<'g, V> {
    entries: Iter<'g, V>,
}

impl<'g, V> Keys<'g, V> {
    pub(super) fn new(entries: Iter<'g, V>) -> Self {
        Self { entries }
    }
}

impl<V> Iterator for Keys<'_, V> {
    type Item = i64;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|(key, _)| key)
    }
}

/// Iterator over values.
pub struct Values<'g, V> {
    entries: Iter<'g, V>,
}

impl<'g, V> Values<'g, V> {
    pub(super) fn new(entries: Iter<'g, V>) -> Self {
        Self { entries }
    }
}

impl<'g, V> Iterator for Values<'g, V> {
    type Item = &'g V;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|(_, value)| value)
    }
}
