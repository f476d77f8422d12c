use crate::node::{BinEntry, Node, TreeNode};
use crate::raw::Table;
use crossbeam_epoch::{Guard, Shared};
use std::sync::atomic::Ordering;

/// An iterator over the live entries of a table.
///
/// The traversal is weakly consistent: it visits each entry that was present when it was
/// created at most once, tolerates any amount of concurrent modification, and skips entries
/// whose value observes as null (mid-insertion reservations and tombstones).
///
/// Iteration proceeds bin by bin. If a bin has been forwarded by a resize, the iterator follows
/// the forwarding marker into the newer table for that bin's entries, visiting both paired slots
/// (`index` and `index + base_size`, recursively for further resizes) before returning to where
/// it left off, which requires a small saved-state stack.
#[derive(Debug)]
pub(crate) struct NodeIter<'g, K, V> {
    /// Current table; updated when the traversal crosses a forwarding marker.
    table: Option<&'g Table<K, V>>,

    stack: Option<Box<TableStack<'g, K, V>>>,
    spare: Option<Box<TableStack<'g, K, V>>>,

    /// The last node we returned, whose chain the next call continues.
    prev: Option<&'g Node<K, V>>,

    /// Index of bin to use next.
    index: usize,

    /// Current index of the initial table.
    base_index: usize,

    /// Index bound of the initial table.
    base_limit: usize,

    /// Initial table size.
    base_size: usize,

    guard: &'g Guard,
}

impl<'g, K, V> NodeIter<'g, K, V> {
    pub(crate) fn new(table: Shared<'g, Table<K, V>>, guard: &'g Guard) -> Self {
        let (table, len) = if table.is_null() {
            (None, 0)
        } else {
            // safety: a table read under a guard is not retired while the guard is held
            let table = unsafe { table.deref() };
            (Some(table), table.len())
        };

        Self {
            table,
            stack: None,
            spare: None,
            prev: None,
            base_size: len,
            base_index: 0,
            index: 0,
            base_limit: len,
            guard,
        }
    }

    /// A traversal over only the bins `lo..hi` of the original table (in the original table's
    /// coordinate space).
    fn with_range(
        table: Option<&'g Table<K, V>>,
        base_size: usize,
        lo: usize,
        hi: usize,
        guard: &'g Guard,
    ) -> Self {
        Self {
            table,
            stack: None,
            spare: None,
            prev: None,
            base_size,
            base_index: lo,
            index: lo,
            base_limit: hi,
            guard,
        }
    }

    fn push_state(&mut self, t: &'g Table<K, V>, i: usize, n: usize) {
        let mut s = self.spare.take();
        if let Some(ref mut s) = s {
            self.spare = s.next.take();
        }

        let target = TableStack {
            table: t,
            length: n,
            index: i,
            next: self.stack.take(),
        };

        self.stack = if let Some(mut s) = s {
            *s = target;
            Some(s)
        } else {
            Some(Box::new(target))
        };
    }

    fn recover_state(&mut self, mut n: usize) {
        while let Some(ref mut s) = self.stack {
            if self.index + s.length < n {
                // we have not yet visited the higher of this bin's two halves; keep the stack
                // frame and move to that half
                self.index += s.length;
                break;
            }

            // pop the stack frame
            let mut s = self.stack.take().expect("while let Some");
            n = s.length;
            self.index = s.index;
            self.table = Some(s.table);
            self.stack = s.next.take();

            // save the frame for re-use
            s.next = self.spare.take();
            self.spare = Some(s);
        }

        if self.stack.is_none() {
            // move to the next "part" of the top-level bin in the largest table
            self.index += self.base_size;
            if self.index >= n {
                // we've gone past the last part of this top-level bin, so move to the _next_
                // top-level bin
                self.base_index += 1;
                self.index = self.base_index;
            }
        }
    }
}

/// The node following `node` on its chain, if any.
fn successor<'g, K, V>(
    node: &'g Node<K, V>,
    guard: &'g Guard,
) -> Option<&'g Node<K, V>> {
    let next = node.next.load(Ordering::SeqCst, guard);
    if next.is_null() {
        return None;
    }
    // safety: nodes reachable from a bin read under our guard are not retired while the guard
    // is held
    Some(match *unsafe { next.deref() } {
        BinEntry::Node(ref node) => node,
        BinEntry::TreeNode(ref tree_node) => &tree_node.node,
        _ => unreachable!("nodes can only point to nodes or tree nodes"),
    })
}

impl<'g, K, V> Iterator for NodeIter<'g, K, V> {
    /// The node together with its value as observed when the node was latched; the value is
    /// never null.
    type Item = (&'g Node<K, V>, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        let guard = self.guard;
        let mut e = match self.prev {
            Some(prev) => successor(prev, guard),
            None => None,
        };

        loop {
            if let Some(node) = e {
                let v = node.value.load(Ordering::SeqCst, guard);
                if !v.is_null() {
                    self.prev = Some(node);
                    // safety: the value was read under our guard and is retired at the
                    // earliest one epoch after it is replaced or unlinked
                    return Some((node, unsafe { v.deref() }));
                }
                // mid-insertion or mid-deletion; not present
                e = successor(node, guard);
                continue;
            }

            if self.base_index >= self.base_limit
                || self.table.is_none()
                || self.table.as_ref().expect("checked above").len() <= self.index
            {
                self.prev = None;
                return None;
            }

            let t = self.table.expect("is_none checked above");
            let i = self.index;
            let n = t.len();
            let bin = t.bin(i, guard);
            if !bin.is_null() {
                // safety: the bin was read under our guard
                match *unsafe { bin.deref() } {
                    BinEntry::Moved(next_table) => {
                        // descend into the forwarded table for this bin, and remember where we
                        // were so we can come back up
                        // safety: a table pointed at by a forwarding marker read under our
                        // guard is not retired while the guard is held
                        self.table =
                            Some(unsafe { Shared::<'g, Table<K, V>>::from(next_table).deref() });
                        self.prev = None;
                        self.push_state(t, i, n);
                        continue;
                    }
                    BinEntry::Node(ref node) => {
                        e = Some(node);
                    }
                    BinEntry::Tree(ref tree_bin) => {
                        // tree bins are traversed along their `first` chain, which needs no
                        // lock
                        let first = tree_bin.first.load(Ordering::SeqCst, guard);
                        if !first.is_null() {
                            // safety: as for bins above
                            e = Some(&unsafe { TreeNode::get_tree_node(first) }.node);
                        }
                    }
                    BinEntry::TreeNode(_) => {
                        unreachable!("the head of a bin cannot be a TreeNode")
                    }
                }
            }

            if self.stack.is_some() {
                self.recover_state(n);
            } else {
                self.index = i + self.base_size;
                if self.index >= n {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            }
        }
    }
}

#[derive(Debug)]
struct TableStack<'g, K, V> {
    length: usize,
    index: usize,
    table: &'g Table<K, V>,
    next: Option<Box<TableStack<'g, K, V>>>,
}

/// A thread-portable description of a sub-range of a table traversal, used to fan bulk
/// operations out across a work-stealing pool.
///
/// A cursor can be split in two for as long as it has not started iterating; turning it into a
/// [`NodeIter`] consumes it, so splitting a started traversal is not expressible. Each half
/// covers half of the remaining base-index range, in the coordinate space of the table the root
/// cursor was created from.
pub(crate) struct Cursor<K, V> {
    table: *const Table<K, V>,
    base_size: usize,
    lo: usize,
    hi: usize,
}

// safety: the cursor carries only a table pointer and indices. whoever turns it into a
// `NodeIter` must guarantee the table is still live (the bulk operations hold a guard on the
// root thread for the whole parallel call).
unsafe impl<K, V> Send for Cursor<K, V> where K: Send + Sync, V: Send + Sync {}

impl<K, V> Cursor<K, V> {
    pub(crate) fn new(table: Shared<'_, Table<K, V>>) -> Self {
        let (base_size, table) = if table.is_null() {
            (0, std::ptr::null())
        } else {
            // safety: the caller read `table` under a guard it holds for this cursor's
            // lifetime
            (unsafe { table.deref() }.len(), table.as_raw())
        };
        Self {
            table,
            base_size,
            lo: 0,
            hi: base_size,
        }
    }

    /// The number of base bins this cursor covers.
    pub(crate) fn len(&self) -> usize {
        self.hi - self.lo
    }

    /// Splits off the upper half of this cursor's range.
    pub(crate) fn split(&mut self) -> Cursor<K, V> {
        let mid = (self.lo + self.hi + 1) >> 1;
        let upper = Cursor {
            table: self.table,
            base_size: self.base_size,
            lo: mid,
            hi: self.hi,
        };
        self.hi = mid;
        upper
    }

    /// Begins iterating the cursor's range.
    ///
    /// # Safety
    ///
    /// The table this cursor was created from must still be live, and `guard` must pin an epoch
    /// that keeps every node reachable from it alive.
    pub(crate) unsafe fn into_iter<'g>(self, guard: &'g Guard) -> NodeIter<'g, K, V> {
        let table = if self.table.is_null() {
            None
        } else {
            Some(&*self.table)
        };
        NodeIter::with_range(table, self.base_size, self.lo, self.hi, guard)
    }
}

impl<K, V> std::fmt::Debug for Cursor<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("lo", &self.lo)
            .field("hi", &self.hi)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HashMap;
    use std::collections::HashSet;

    #[test]
    fn iter_new() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let iter = NodeIter::<usize, usize>::new(Shared::null(), guard);
        assert_eq!(iter.count(), 0);
    }

    #[test]
    fn iter_simple() {
        let map = HashMap::<usize, usize>::new();
        let guard = map.guard();
        map.insert(1, 42, &guard);

        let table = map.table.load(std::sync::atomic::Ordering::SeqCst, &guard);
        let mut iter = NodeIter::new(table, &guard);
        let (node, value) = iter.next().unwrap();
        assert_eq!(node.key, 1);
        assert_eq!(value, &42);
        assert!(iter.next().is_none());
    }

    #[test]
    fn iter_across_resize() {
        let map = HashMap::<usize, usize>::new();
        let guard = map.guard();
        // enough entries to force at least one resize from the default 16 bins
        for i in 0..64 {
            map.insert(i, i, &guard);
        }
        let seen: HashSet<_> = map.iter(&guard).map(|(k, _)| *k).collect();
        assert_eq!(seen.len(), 64);
        for i in 0..64 {
            assert!(seen.contains(&i));
        }
    }

    #[test]
    fn cursor_split_covers_range() {
        let map = HashMap::<usize, usize>::new();
        let guard = map.guard();
        for i in 0..128 {
            map.insert(i, i, &guard);
        }
        let table = map.table.load(std::sync::atomic::Ordering::SeqCst, &guard);
        let mut left = Cursor::new(table);
        let total = left.len();
        let right = left.split();
        assert_eq!(left.len() + right.len(), total);

        // safety: the map (and with it the table) outlives both iterations, and `guard` is
        // held throughout
        let mut seen: HashSet<usize> = unsafe { left.into_iter(&guard) }
            .map(|(node, _)| node.key)
            .collect();
        for (node, _) in unsafe { right.into_iter(&guard) } {
            // the two halves are disjoint
            assert!(seen.insert(node.key));
        }
        assert_eq!(seen.len(), 128);
    }
}
