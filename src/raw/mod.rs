use crate::node::*;
use crossbeam_epoch::{Atomic, Guard, Owned, Pointer, Shared};
use std::borrow::Borrow;
use std::fmt::Debug;
use std::sync::atomic::Ordering;

/// A flat array of bin heads, indexed by the low bits of each entry's spread hash.
#[derive(Debug)]
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<BinEntry<K, V>>]>,
    // all forwarding markers planted in this table during one resize point at the same next
    // table and look identical, so a single shared `Moved` entry is kept here and reused for
    // every transferred bin
    moved: Atomic<BinEntry<K, V>>,
}

impl<K, V> From<Vec<Atomic<BinEntry<K, V>>>> for Table<K, V> {
    fn from(bins: Vec<Atomic<BinEntry<K, V>>>) -> Self {
        Self {
            bins: bins.into_boxed_slice(),
            moved: Atomic::null(),
        }
    }
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(bins: usize) -> Self {
        Self::from(vec![Atomic::null(); bins])
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    /// Returns the shared forwarding marker for this table, creating it on first use.
    ///
    /// All calls during one resize must pass the same `for_table`; the marker directs readers
    /// and writers at the table the resize is transferring into.
    pub(crate) fn get_moved<'g>(
        &'g self,
        for_table: Shared<'g, Table<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        match self.moved.load(Ordering::SeqCst, guard) {
            s if s.is_null() => {
                self.moved.store(
                    Owned::new(BinEntry::Moved(for_table.as_raw())),
                    Ordering::SeqCst,
                );
                self.moved.load(Ordering::SeqCst, guard)
            }
            s => {
                // safety: we only drop `moved` when the table is dropped, so it remains valid
                // here
                if let BinEntry::Moved(ref table) = *unsafe { s.deref() } {
                    assert_eq!(for_table.as_raw(), *table);
                } else {
                    unreachable!("self.moved is always a Moved entry");
                }
                s
            }
        }
    }

    /// Searches the bin rooted at `bin` for the given hash and key.
    ///
    /// Dispatches on the kind of bin head: list bins are walked directly, tree bins search under
    /// the tree read lock (or fall back to a linear walk), and forwarding markers are chased
    /// into the table they point at. The returned entry, if any, is a `Node` or `TreeNode`; its
    /// value may still observe as null, which callers must treat as absent.
    pub(crate) fn find<'g, Q>(
        &'g self,
        bin: &'g BinEntry<K, V>,
        hash: u32,
        key: &Q,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        match *bin {
            BinEntry::Node(_) => {
                let mut node = Shared::from(bin as *const BinEntry<K, V>);
                loop {
                    if node.is_null() {
                        return Shared::null();
                    }
                    // safety: the caller read `bin` under their guard, and list nodes are only
                    // dropped an epoch after they are unlinked
                    let n = unsafe { node.deref() }
                        .as_node()
                        .expect("list bins contain only nodes");
                    if n.hash() == hash && n.key.borrow() == key {
                        return node;
                    }
                    node = n.next.load(Ordering::SeqCst, guard);
                }
            }
            BinEntry::Moved(next_table) => {
                // chase the forward into the next table; a reverse forwarder may briefly send
                // us back, but a deferred bin's old slot holds its live head, so the chase
                // terminates
                let mut table = Shared::<'g, Table<K, V>>::from(next_table);
                loop {
                    if table.is_null() {
                        return Shared::null();
                    }
                    // safety: a table a forwarding marker points at is only dropped an epoch
                    // after the marker becomes unreachable
                    let t = unsafe { table.deref() };
                    if t.is_empty() {
                        return Shared::null();
                    }
                    let bini = t.bini(hash);
                    let bin = t.bin(bini, guard);
                    if bin.is_null() {
                        return Shared::null();
                    }
                    // safety: as above for `bin`
                    match *unsafe { bin.deref() } {
                        BinEntry::Moved(next) => {
                            table = Shared::from(next);
                        }
                        ref entry => return t.find(entry, hash, key, guard),
                    }
                }
            }
            BinEntry::Tree(ref tree_bin) => tree_bin.find(hash, key, guard),
            BinEntry::TreeNode(_) => {
                unreachable!("`find` is only called on bin heads, which cannot be tree nodes")
            }
        }
    }

    pub(crate) fn drop_bins(&mut self) {
        // safety: we have &mut self, so no other thread can access the table, and every
        // reference we ever handed out is bound to a borrow of self
        let guard = unsafe { crossbeam_epoch::unprotected() };

        for bin in Vec::from(std::mem::replace(&mut self.bins, vec![].into_boxed_slice())) {
            if bin.load(Ordering::SeqCst, guard).is_null() {
                // bin was never used
                continue;
            }

            // safety: same as above; we own the bins
            let bin_entry = unsafe { bin.load(Ordering::SeqCst, guard).deref() };
            match *bin_entry {
                // the shared forwarding marker is dropped in `Drop`, not here
                BinEntry::Moved(_) => {}
                BinEntry::Node(_) => {
                    let mut p = unsafe { bin.into_owned() };
                    loop {
                        let node = if let BinEntry::Node(node) = *p.into_box() {
                            node
                        } else {
                            unreachable!("list bins contain only nodes");
                        };

                        // first drop the value, then move to the next node
                        let _ = unsafe { node.value.into_owned() };
                        if node.next.load(Ordering::SeqCst, guard).is_null() {
                            break;
                        }
                        p = unsafe { node.next.into_owned() };
                    }
                }
                BinEntry::Tree(_) => {
                    // TreeBin::drop tears down the tree nodes and their values
                    let _ = unsafe { bin.into_owned() };
                }
                BinEntry::TreeNode(_) => {
                    unreachable!("a bin head is never a tree node")
                }
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // safety: we have &mut self, so no other thread can access the table
        let guard = unsafe { crossbeam_epoch::unprotected() };

        // after drop_bins (or a completed transfer) the bins are all empty or hold the shared
        // forwarding marker
        for bin in &self.bins[..] {
            let bin = bin.swap(Shared::null(), Ordering::SeqCst, guard);
            if bin.is_null() {
                continue;
            }
            // safety: we have exclusive access
            if let BinEntry::Moved(_) = *unsafe { bin.deref() } {
            } else {
                unreachable!("dropped table with a non-empty bin");
            }
        }

        // the shared forwarding marker is heap allocated and owned by this table
        let moved = self.moved.swap(Shared::null(), Ordering::SeqCst, guard);
        if !moved.is_null() {
            // safety: we have exclusive access, and the marker is only stored here
            drop(unsafe { moved.into_owned() });
        }
    }
}

impl<K, V> Table<K, V> {
    #[inline]
    pub(crate) fn bini(&self, hash: u32) -> usize {
        let mask = self.bins.len() as u32 - 1;
        (hash & mask) as usize
    }

    #[inline]
    pub(crate) fn bin<'g>(&'g self, i: usize, guard: &'g Guard) -> Shared<'g, BinEntry<K, V>> {
        self.bins[i].load(Ordering::Acquire, guard)
    }

    #[inline]
    #[allow(clippy::type_complexity)]
    pub(crate) fn cas_bin<'g, P>(
        &'g self,
        i: usize,
        current: Shared<'_, BinEntry<K, V>>,
        new: P,
        guard: &'g Guard,
    ) -> Result<
        Shared<'g, BinEntry<K, V>>,
        crossbeam_epoch::CompareExchangeError<'g, BinEntry<K, V>, P>,
    >
    where
        P: Pointer<BinEntry<K, V>>,
    {
        self.bins[i].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn store_bin<P: Pointer<BinEntry<K, V>>>(&self, i: usize, new: P) {
        self.bins[i].store(new, Ordering::Release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_node(hash: u32, key: usize, value: usize) -> Node<usize, usize> {
        Node::with_next(hash, key, Atomic::new(value), Atomic::null())
    }

    #[test]
    fn find_node_no_match() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let node2 = new_node(4, 5, 6);
        let entry2 = BinEntry::Node(node2);
        let node1 = new_node(1, 2, 3);
        node1.next.store(Owned::new(entry2), Ordering::SeqCst);
        let entry1 = Owned::new(BinEntry::Node(node1)).into_shared(guard);
        let mut tab = Table::from(vec![Atomic::from(entry1)]);

        // safety: we have not yet dropped entry1
        assert!(tab
            .find(unsafe { entry1.deref() }, 1, &0usize, guard)
            .is_null());
        tab.drop_bins();
    }

    #[test]
    fn find_node_single_match() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let entry = Owned::new(BinEntry::Node(new_node(1, 2, 3))).into_shared(guard);
        let mut tab = Table::from(vec![Atomic::from(entry)]);
        assert_eq!(
            // safety: we have not yet dropped entry
            unsafe { tab.find(entry.deref(), 1, &2usize, guard).deref() }
                .as_node()
                .unwrap()
                .key,
            2
        );
        tab.drop_bins();
    }

    #[test]
    fn find_node_multi_match() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let node2 = new_node(4, 5, 6);
        let entry2 = BinEntry::Node(node2);
        let node1 = new_node(1, 2, 3);
        node1.next.store(Owned::new(entry2), Ordering::SeqCst);
        let entry1 = Owned::new(BinEntry::Node(node1)).into_shared(guard);
        let mut tab = Table::from(vec![Atomic::from(entry1)]);
        assert_eq!(
            // safety: we have not yet dropped entry1
            unsafe { tab.find(entry1.deref(), 4, &5usize, guard).deref() }
                .as_node()
                .unwrap()
                .key,
            5
        );
        tab.drop_bins();
    }

    #[test]
    fn find_moved_empty_bins_no_match() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let mut table = Table::<usize, usize>::new(1);
        let mut table2 = Owned::new(Table::new(1)).into_shared(guard);

        let entry = table.get_moved(table2, guard);
        table.store_bin(0, entry);
        // safety: entry is the shared moved node and still valid
        assert!(table
            .find(unsafe { entry.deref() }, 1, &2usize, guard)
            .is_null());
        table.drop_bins();
        // safety: table2 is still valid and not accessed by other threads
        unsafe { table2.deref_mut() }.drop_bins();
        drop(unsafe { table2.into_owned() });
    }

    #[test]
    fn find_moved_match() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let mut table = Table::<usize, usize>::new(1);
        let mut table2 = Owned::new(Table::new(1)).into_shared(guard);
        // safety: table2 is still valid
        unsafe { table2.deref() }.store_bin(0, Owned::new(BinEntry::Node(new_node(1, 2, 3))));
        let entry = table.get_moved(table2, guard);
        table.store_bin(0, entry);
        assert_eq!(
            // safety: the entry is still valid since neither table was dropped and the entry
            // was not removed
            unsafe { table.find(entry.deref(), 1, &2usize, guard).deref() }
                .as_node()
                .unwrap()
                .key,
            2
        );
        table.drop_bins();
        // safety: table2 is still valid and not accessed by other threads
        unsafe { table2.deref_mut() }.drop_bins();
        drop(unsafe { table2.into_owned() });
    }
}
