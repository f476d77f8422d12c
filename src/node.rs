use crate::raw::Table;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;
use parking_lot_core::{ParkResult, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use std::borrow::Borrow;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

/// Usable bits of a spread hash. The top two bits of every node's hash word encode the bin-head
/// lock state and must never be set by the hash itself.
pub(crate) const HASH_BITS: u32 = 0x3fff_ffff;

/// Set while a thread owns the bin whose head this node is.
const LOCKED: u32 = 0x4000_0000;

/// Both top bits: the bin is locked _and_ at least one thread is parked waiting for it.
const WAITING: u32 = 0xc000_0000;

/// Mask covering the two lock-state bits.
const LOCK_MASK: u32 = WAITING;

/// Entry in a bin.
///
/// A bin head is either a `Node` (list bin), a `Tree` (tree bin), or a `Moved` forwarding marker
/// planted by the resize engine. `TreeNode` only ever appears _inside_ a tree bin, reachable from
/// its `root` and `first` pointers.
#[derive(Debug)]
pub(crate) enum BinEntry<K, V> {
    Node(Node<K, V>),
    Tree(TreeBin<K, V>),
    TreeNode(TreeNode<K, V>),
    Moved(*const Table<K, V>),
}

unsafe impl<K, V> Send for BinEntry<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
}

unsafe impl<K, V> Sync for BinEntry<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
}

impl<K, V> BinEntry<K, V> {
    pub(crate) fn as_node(&self) -> Option<&Node<K, V>> {
        if let BinEntry::Node(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }

    pub(crate) fn as_tree_node(&self) -> Option<&TreeNode<K, V>> {
        if let BinEntry::TreeNode(ref n) = *self {
            Some(n)
        } else {
            None
        }
    }
}

/// Key-value entry.
///
/// The `hash` word holds the 30-bit spread hash in its low bits and the bin-head lock state in
/// its top two bits; the hash itself never changes after construction, so readers obtain it by
/// masking with [`HASH_BITS`]. A null `value` means the node is mid-insertion (a reservation) or
/// mid-deletion and must be treated as absent by readers.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    pub(crate) hash: AtomicU32,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinEntry<K, V>>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(hash: u32, key: K, value: Shared<'_, V>) -> Self {
        Self::with_next(hash, key, Atomic::from(value), Atomic::null())
    }

    pub(crate) fn with_next(
        hash: u32,
        key: K,
        value: Atomic<V>,
        next: Atomic<BinEntry<K, V>>,
    ) -> Self {
        debug_assert_eq!(hash & LOCK_MASK, 0);
        Self {
            hash: AtomicU32::new(hash),
            key,
            value,
            next,
        }
    }

    /// Creates a node that reserves its bin: born with the lock bit set and no value, so that
    /// concurrent readers treat the key as absent while the reserving thread runs its
    /// computation. The creator must release the lock through [`HeadLock::assume`].
    pub(crate) fn reserved(hash: u32, key: K) -> Self {
        debug_assert_eq!(hash & LOCK_MASK, 0);
        Self {
            hash: AtomicU32::new(hash | LOCKED),
            key,
            value: Atomic::null(),
            next: Atomic::null(),
        }
    }

    /// Takes the key back out of a node that was never published.
    pub(crate) fn into_key(self) -> K {
        self.key
    }

    /// The spread hash of this node, with the lock bits masked off.
    #[inline]
    pub(crate) fn hash(&self) -> u32 {
        self.hash.load(Ordering::Acquire) & HASH_BITS
    }

    /// Whether the bin-head lock bits of this node are currently set.
    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.hash.load(Ordering::SeqCst) & LOCK_MASK != 0
    }

    /// Tries to acquire this bin head's lock by setting the `LOCKED` bit.
    ///
    /// On success the returned RAII guard owns the bin: no other updater can modify the bin's
    /// links until it is dropped. Dropping the guard releases the lock and, if a waiter parked in
    /// the meantime, wakes every thread parked on this node.
    pub(crate) fn try_lock(&self) -> Option<HeadLock<'_>> {
        let h = self.hash.load(Ordering::SeqCst);
        if h & LOCK_MASK != 0 {
            return None;
        }
        if self
            .hash
            .compare_exchange(h, h | LOCKED, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            Some(HeadLock { hash: &self.hash })
        } else {
            None
        }
    }

    /// Spins for a bounded number of attempts while this node is still first in its bin, then
    /// sets the `WAITING` bits and parks (once) if the lock is still held.
    ///
    /// It is fine for this method to return even though the lock is not available; callers loop
    /// and revalidate the bin head anyway. The corresponding wakeup is performed by [`HeadLock`]:
    /// an owner whose release CAS from the plain `LOCKED` state fails knows `WAITING` was set,
    /// restores the hash, and unparks all threads parked on this node.
    pub(crate) fn await_lock<'g>(
        &self,
        entry: Shared<'g, BinEntry<K, V>>,
        tab: &'g Table<K, V>,
        i: usize,
        guard: &'g Guard,
    ) {
        let mut r: u32 = rand::random();
        let mut spins = max_spins();
        while tab.bin(i, guard) == entry {
            let h = self.hash.load(Ordering::SeqCst);
            if h & LOCK_MASK == 0 {
                // the lock was released; let the caller retry
                break;
            }
            if spins >= 0 {
                // xorshift, so that contending threads fall out of step
                r ^= r << 1;
                r ^= r >> 3;
                r ^= r << 10;
                if (r as i32) >= 0 {
                    spins -= 1;
                    if spins == 0 {
                        std::thread::yield_now();
                    }
                }
            } else if self
                .hash
                .compare_exchange(h, h | WAITING, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                let addr = &self.hash as *const AtomicU32 as usize;
                // safety: the address is that of our hash word, which outlives the park since
                // `entry` was read under `guard`; the validation callback does not park or panic.
                let _ = unsafe {
                    parking_lot_core::park(
                        addr,
                        || {
                            tab.bin(i, guard) == entry
                                && self.hash.load(Ordering::SeqCst) & LOCK_MASK == WAITING
                        },
                        || {},
                        |_, _| {},
                        DEFAULT_PARK_TOKEN,
                        None,
                    )
                };
                break;
            }
        }
    }
}

/// The number of lock-acquisition spins before parking.
fn max_spins() -> i32 {
    if crate::map::num_cpus() > 1 {
        64
    } else {
        1
    }
}

/// RAII ownership of a bin whose head node's `LOCKED` bit this guard has set.
#[derive(Debug)]
pub(crate) struct HeadLock<'g> {
    hash: &'g AtomicU32,
}

impl<'g> HeadLock<'g> {
    /// Adopts a lock that is already held, such as the pre-set lock bit of a freshly installed
    /// reservation node.
    ///
    /// # Safety
    ///
    /// The caller must be the owner of the set `LOCKED` bit in `hash`.
    pub(crate) unsafe fn assume(hash: &'g AtomicU32) -> Self {
        debug_assert_ne!(hash.load(Ordering::SeqCst) & LOCK_MASK, 0);
        Self { hash }
    }
}

impl Drop for HeadLock<'_> {
    fn drop(&mut self) {
        let h = self.hash.load(Ordering::SeqCst) & HASH_BITS;
        if self
            .hash
            .compare_exchange(h | LOCKED, h, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // a contender moved the state to locked+waiting while we held the lock; restore the
            // plain hash and wake everyone parked on this node
            self.hash.store(h, Ordering::SeqCst);
            let addr = self.hash as *const AtomicU32 as usize;
            // safety: we do not hold any parking-lot internal locks here.
            unsafe {
                parking_lot_core::unpark_all(addr, DEFAULT_UNPARK_TOKEN);
            }
        }
    }
}

/* ---------------- tree bins -------------- */

/// A node in a [`TreeBin`], wrapping an ordinary [`Node`] with red-black links.
///
/// `prev` exists so a node can be unlinked from the `next` list on deletion without a list walk.
#[derive(Debug)]
pub(crate) struct TreeNode<K, V> {
    pub(crate) node: Node<K, V>,
    pub(crate) parent: Atomic<BinEntry<K, V>>,
    pub(crate) left: Atomic<BinEntry<K, V>>,
    pub(crate) right: Atomic<BinEntry<K, V>>,
    pub(crate) prev: Atomic<BinEntry<K, V>>,
    pub(crate) red: AtomicBool,
}

impl<K, V> TreeNode<K, V> {
    pub(crate) fn new(
        hash: u32,
        key: K,
        value: Atomic<V>,
        next: Atomic<BinEntry<K, V>>,
        parent: Atomic<BinEntry<K, V>>,
    ) -> Self {
        Self {
            node: Node::with_next(hash, key, value, next),
            parent,
            left: Atomic::null(),
            right: Atomic::null(),
            prev: Atomic::null(),
            red: AtomicBool::new(false),
        }
    }

    /// Projects a `Shared<BinEntry>` that is structurally known to be a `TreeNode`.
    ///
    /// # Safety
    ///
    /// The given pointer must be non-null, protected by a guard, and point to a
    /// `BinEntry::TreeNode`.
    pub(crate) unsafe fn get_tree_node<'g>(bin: Shared<'g, BinEntry<K, V>>) -> &'g TreeNode<K, V> {
        bin.deref()
            .as_tree_node()
            .expect("tree links only ever point to tree nodes")
    }

    /// Searches the subtree rooted at `from` for the given hash and key.
    ///
    /// The tree is ordered by spread hash first and the key's total order second, so the search
    /// descends exactly one child per step.
    pub(crate) fn find_tree_node<'g, Q>(
        from: Shared<'g, BinEntry<K, V>>,
        hash: u32,
        key: &Q,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        let mut p = from;
        while !p.is_null() {
            // safety: the containing TreeBin was read under our guard, at which point the tree
            // structure was valid; the guard keeps all of its nodes alive.
            let p_deref = unsafe { TreeNode::get_tree_node(p) };
            let p_hash = p_deref.node.hash();
            let dir = match hash.cmp(&p_hash) {
                std::cmp::Ordering::Equal => {
                    match key.cmp(p_deref.node.key.borrow()) {
                        std::cmp::Ordering::Equal => return p,
                        dir => dir,
                    }
                }
                dir => dir,
            };
            p = if dir == std::cmp::Ordering::Less {
                p_deref.left.load(Ordering::SeqCst, guard)
            } else {
                p_deref.right.load(Ordering::SeqCst, guard)
            };
        }
        Shared::null()
    }
}

/// The lock state of a free tree bin.
const TREE_UNLOCKED: i32 = 0;
/// The lock state while a writer holds the root.
const TREE_WRITER: i32 = 1;

/// A red-black tree of entries sharing a bin, used once a list bin grows past the treeify
/// threshold.
///
/// The tree is ordered by spread hash and then by the key's total order. In addition to the tree
/// links, the nodes remain on an ordinary `next` list headed by `first`, so that readers which
/// cannot acquire the read lock can fall back to a linear walk instead of blocking.
///
/// The embedded lock is a specialized read/write lock: `lock` serializes writers against each
/// other, while `lock_state` tracks root ownership (positive: a writer restructuring the tree;
/// negative: the number of active readers). A writer that finds readers active parks until the
/// last reader's release wakes it. Readers never park; see [`TreeBin::find`].
#[derive(Debug)]
pub(crate) struct TreeBin<K, V> {
    pub(crate) root: Atomic<BinEntry<K, V>>,
    pub(crate) first: Atomic<BinEntry<K, V>>,
    pub(crate) lock: Mutex<()>,
    lock_state: AtomicI32,
    writer_parked: AtomicBool,
}

impl<K, V> TreeBin<K, V>
where
    K: Ord,
{
    /// Builds a tree from a list of `BinEntry::TreeNode`s linked via their `next` pointers.
    pub(crate) fn new<'g>(bin: Owned<BinEntry<K, V>>, guard: &'g Guard) -> Self {
        let first = bin.into_shared(guard);
        let mut root = Shared::null();

        let mut x = first;
        while !x.is_null() {
            // safety: we have just created the chain of tree nodes and not yet shared it.
            let x_deref = unsafe { TreeNode::get_tree_node(x) };
            let next = x_deref.node.next.load(Ordering::Relaxed, guard);
            x_deref.left.store(Shared::null(), Ordering::Relaxed);
            x_deref.right.store(Shared::null(), Ordering::Relaxed);

            if root.is_null() {
                x_deref.parent.store(Shared::null(), Ordering::Relaxed);
                x_deref.red.store(false, Ordering::Relaxed);
                root = x;
                x = next;
                continue;
            }

            let hash = x_deref.node.hash();
            let mut p = root;
            loop {
                // safety: as above; all of these nodes are ours and unshared.
                let p_deref = unsafe { TreeNode::get_tree_node(p) };
                let dir = match p_deref.node.hash().cmp(&hash) {
                    std::cmp::Ordering::Greater => std::cmp::Ordering::Less,
                    std::cmp::Ordering::Less => std::cmp::Ordering::Greater,
                    // keys on one chain are distinct, so the key order breaks the tie
                    std::cmp::Ordering::Equal => x_deref.node.key.cmp(&p_deref.node.key),
                };
                let xp = p;
                p = if dir == std::cmp::Ordering::Greater {
                    p_deref.right.load(Ordering::Relaxed, guard)
                } else {
                    p_deref.left.load(Ordering::Relaxed, guard)
                };
                if p.is_null() {
                    x_deref.parent.store(xp, Ordering::Relaxed);
                    if dir == std::cmp::Ordering::Greater {
                        p_deref.right.store(x, Ordering::Relaxed);
                    } else {
                        p_deref.left.store(x, Ordering::Relaxed);
                    }
                    root = TreeBin::balance_insertion(root, x, guard);
                    break;
                }
            }

            x = next;
        }

        Self {
            root: Atomic::from(root),
            first: Atomic::from(first),
            lock: Mutex::new(()),
            lock_state: AtomicI32::new(TREE_UNLOCKED),
            writer_parked: AtomicBool::new(false),
        }
    }
}

impl<K, V> TreeBin<K, V> {
    /// Acquires the root for writing. Must only be called while holding `self.lock`.
    fn lock_root(&self) {
        if self
            .lock_state
            .compare_exchange(
                TREE_UNLOCKED,
                TREE_WRITER,
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            self.contended_lock();
        }
    }

    /// Parks until the active readers have drained, then claims the root.
    fn contended_lock(&self) {
        let addr = &self.lock_state as *const AtomicI32 as usize;
        loop {
            if self
                .lock_state
                .compare_exchange(
                    TREE_UNLOCKED,
                    TREE_WRITER,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.writer_parked.store(false, Ordering::SeqCst);
                return;
            }
            self.writer_parked.store(true, Ordering::SeqCst);
            // safety: the address is that of our own lock state; the validation callback does
            // not park or panic.
            let _: ParkResult = unsafe {
                parking_lot_core::park(
                    addr,
                    || {
                        self.lock_state.load(Ordering::SeqCst) != TREE_UNLOCKED
                            && self.writer_parked.load(Ordering::SeqCst)
                    },
                    || {},
                    |_, _| {},
                    DEFAULT_PARK_TOKEN,
                    None,
                )
            };
        }
    }

    /// Releases the root after a write.
    fn unlock_root(&self) {
        self.lock_state.store(TREE_UNLOCKED, Ordering::SeqCst);
    }

    /// Releases one shared (reader) hold on the root and, if we were the last reader out, wakes
    /// a parked writer.
    fn unlock_shared(&self) {
        if self.lock_state.fetch_add(1, Ordering::SeqCst) == -1
            && self.writer_parked.load(Ordering::SeqCst)
        {
            let addr = &self.lock_state as *const AtomicI32 as usize;
            // safety: we do not hold any parking-lot internal locks here.
            unsafe {
                parking_lot_core::unpark_one(addr, |_| DEFAULT_UNPARK_TOKEN);
            }
        }
    }

    /// Looks up the given hash and key in this bin.
    ///
    /// If the root is free or read-held, the reader takes a shared hold and searches the tree.
    /// If a writer holds the root, the reader does _not_ wait; it steps along the `first` chain
    /// linearly instead, re-checking the lock state at each step. Lookups therefore always make
    /// progress, even against a long-running restructure.
    pub(crate) fn find<'g, Q>(
        &'g self,
        hash: u32,
        key: &Q,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        let mut element = self.first.load(Ordering::SeqCst, guard);
        while !element.is_null() {
            let state = self.lock_state.load(Ordering::SeqCst);
            if state > 0 {
                // a writer is restructuring; take one linear step instead of blocking
                // safety: `element` was read under our guard and tree nodes are only dropped an
                // epoch after they become unreachable.
                let node = &unsafe { TreeNode::get_tree_node(element) }.node;
                if node.hash() == hash && key == node.key.borrow() {
                    return element;
                }
                element = node.next.load(Ordering::SeqCst, guard);
            } else if self
                .lock_state
                .compare_exchange(state, state - 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // we hold a read lock; search the tree proper
                let root = self.root.load(Ordering::SeqCst, guard);
                let p = if root.is_null() {
                    Shared::null()
                } else {
                    TreeNode::find_tree_node(root, hash, key, guard)
                };
                self.unlock_shared();
                return p;
            }
            // the CAS failed; re-read the state and try again
        }
        Shared::null()
    }
}

impl<K, V> TreeBin<K, V>
where
    K: Ord,
{
    /// Finds the node for the given key, or inserts a new one if no such node exists.
    ///
    /// Returns the existing node, or null if `value` was inserted. The caller must hold this
    /// bin's write lock (`self.lock`).
    pub(crate) fn find_or_put_tree_val<'g>(
        &'g self,
        hash: u32,
        key: K,
        value: Shared<'g, V>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        let mut p = self.root.load(Ordering::SeqCst, guard);
        if p.is_null() {
            // the bin was drained but not yet untreeified; start a fresh tree
            let node = Owned::new(BinEntry::TreeNode(TreeNode::new(
                hash,
                key,
                Atomic::from(value),
                Atomic::null(),
                Atomic::null(),
            )))
            .into_shared(guard);
            self.root.store(node, Ordering::Release);
            self.first.store(node, Ordering::Release);
            return Shared::null();
        }
        loop {
            // safety: we hold this bin's write lock, and nodes reachable from the root were read
            // under our guard.
            let p_deref = unsafe { TreeNode::get_tree_node(p) };
            let p_hash = p_deref.node.hash();
            let dir = match p_hash.cmp(&hash) {
                std::cmp::Ordering::Greater => std::cmp::Ordering::Less,
                std::cmp::Ordering::Less => std::cmp::Ordering::Greater,
                std::cmp::Ordering::Equal => match key.cmp(&p_deref.node.key) {
                    std::cmp::Ordering::Equal => return p,
                    dir => dir,
                },
            };

            let xp = p;
            p = if dir == std::cmp::Ordering::Less {
                p_deref.left.load(Ordering::SeqCst, guard)
            } else {
                p_deref.right.load(Ordering::SeqCst, guard)
            };
            if !p.is_null() {
                continue;
            }

            let first = self.first.load(Ordering::SeqCst, guard);
            let x = Owned::new(BinEntry::TreeNode(TreeNode::new(
                hash,
                key,
                Atomic::from(value),
                Atomic::from(first),
                Atomic::from(xp),
            )))
            .into_shared(guard);
            self.first.store(x, Ordering::Release);
            if !first.is_null() {
                // safety: `first` was read under our guard and cannot have been dropped, since
                // we hold the bin's write lock.
                unsafe { TreeNode::get_tree_node(first) }
                    .prev
                    .store(x, Ordering::Release);
            }
            if dir == std::cmp::Ordering::Less {
                p_deref.left.store(x, Ordering::Release);
            } else {
                p_deref.right.store(x, Ordering::Release);
            }

            if !p_deref.red.load(Ordering::Relaxed) {
                // the parent is black: painting the new leaf red keeps the tree valid, and
                // readers may search concurrently
                unsafe { TreeNode::get_tree_node(x) }
                    .red
                    .store(true, Ordering::Relaxed);
            } else {
                // rebalancing moves nodes around, so readers must be excluded
                self.lock_root();
                let root = self.root.load(Ordering::Relaxed, guard);
                let new_root = TreeBin::balance_insertion(root, x, guard);
                self.root.store(new_root, Ordering::Release);
                self.unlock_root();
            }
            return Shared::null();
        }
    }

    /// Unlinks the given node, which must be present in this bin, and removes it from the tree.
    ///
    /// Returns `true` if the bin is now too small and should be untreeified by the caller; in
    /// that case neither `p` nor its value have been retired. Otherwise `p` (and, if
    /// `drop_value`, its value) are handed to the garbage collector here. The caller must hold
    /// this bin's write lock.
    ///
    /// # Safety
    ///
    /// `p` must be a `BinEntry::TreeNode` reachable from this bin, read under `guard`, and no
    /// longer returned to any caller after this method runs.
    pub(crate) unsafe fn remove_tree_node<'g>(
        &'g self,
        p: Shared<'g, BinEntry<K, V>>,
        drop_value: bool,
        guard: &'g Guard,
    ) -> bool {
        let p_deref = TreeNode::get_tree_node(p);
        let next = p_deref.node.next.load(Ordering::SeqCst, guard);
        let prev = p_deref.prev.load(Ordering::SeqCst, guard);

        // unlink from the `first` chain
        if prev.is_null() {
            self.first.store(next, Ordering::Release);
        } else {
            TreeNode::get_tree_node(prev)
                .node
                .next
                .store(next, Ordering::Release);
        }
        if !next.is_null() {
            TreeNode::get_tree_node(next).prev.store(prev, Ordering::Release);
        }

        if self.first.load(Ordering::SeqCst, guard).is_null() {
            self.root.store(Shared::null(), Ordering::Release);
            return true;
        }

        // if the tree is too sparse to be worth keeping (detected by a cheap structural probe
        // near the root), have the caller convert back to a list bin
        let root = self.root.load(Ordering::SeqCst, guard);
        if root.is_null() {
            return true;
        }
        {
            let r = TreeNode::get_tree_node(root);
            let rl = r.left.load(Ordering::SeqCst, guard);
            if r.right.load(Ordering::SeqCst, guard).is_null() || rl.is_null() {
                return true;
            }
            if TreeNode::get_tree_node(rl)
                .left
                .load(Ordering::SeqCst, guard)
                .is_null()
            {
                return true;
            }
        }

        self.lock_root();
        let mut root = self.root.load(Ordering::Relaxed, guard);
        let replacement;
        let pl = p_deref.left.load(Ordering::Relaxed, guard);
        let pr = p_deref.right.load(Ordering::Relaxed, guard);
        if !pl.is_null() && !pr.is_null() {
            // interior node: swap places with its in-order successor
            let mut s = pr;
            loop {
                let sl = TreeNode::get_tree_node(s).left.load(Ordering::Relaxed, guard);
                if sl.is_null() {
                    break;
                }
                s = sl;
            }
            let s_deref = TreeNode::get_tree_node(s);
            let color = s_deref.red.load(Ordering::Relaxed);
            s_deref
                .red
                .store(p_deref.red.load(Ordering::Relaxed), Ordering::Relaxed);
            p_deref.red.store(color, Ordering::Relaxed);
            let sr = s_deref.right.load(Ordering::Relaxed, guard);
            let pp = p_deref.parent.load(Ordering::Relaxed, guard);

            if s == pr {
                p_deref.parent.store(s, Ordering::Relaxed);
                s_deref.right.store(p, Ordering::Relaxed);
            } else {
                let sp = s_deref.parent.load(Ordering::Relaxed, guard);
                p_deref.parent.store(sp, Ordering::Relaxed);
                if !sp.is_null() {
                    let sp_deref = TreeNode::get_tree_node(sp);
                    if s == sp_deref.left.load(Ordering::Relaxed, guard) {
                        sp_deref.left.store(p, Ordering::Relaxed);
                    } else {
                        sp_deref.right.store(p, Ordering::Relaxed);
                    }
                }
                s_deref.right.store(pr, Ordering::Relaxed);
                TreeNode::get_tree_node(pr).parent.store(s, Ordering::Relaxed);
            }

            p_deref.left.store(Shared::null(), Ordering::Relaxed);
            p_deref.right.store(sr, Ordering::Relaxed);
            if !sr.is_null() {
                TreeNode::get_tree_node(sr).parent.store(p, Ordering::Relaxed);
            }
            s_deref.left.store(pl, Ordering::Relaxed);
            TreeNode::get_tree_node(pl).parent.store(s, Ordering::Relaxed);
            s_deref.parent.store(pp, Ordering::Relaxed);
            if pp.is_null() {
                root = s;
            } else {
                let pp_deref = TreeNode::get_tree_node(pp);
                if p == pp_deref.left.load(Ordering::Relaxed, guard) {
                    pp_deref.left.store(s, Ordering::Relaxed);
                } else {
                    pp_deref.right.store(s, Ordering::Relaxed);
                }
            }

            replacement = if !sr.is_null() { sr } else { p };
        } else if !pl.is_null() {
            replacement = pl;
        } else if !pr.is_null() {
            replacement = pr;
        } else {
            replacement = p;
        }

        if replacement != p {
            let pp = p_deref.parent.load(Ordering::Relaxed, guard);
            TreeNode::get_tree_node(replacement)
                .parent
                .store(pp, Ordering::Relaxed);
            if pp.is_null() {
                root = replacement;
            } else {
                let pp_deref = TreeNode::get_tree_node(pp);
                if p == pp_deref.left.load(Ordering::Relaxed, guard) {
                    pp_deref.left.store(replacement, Ordering::Relaxed);
                } else {
                    pp_deref.right.store(replacement, Ordering::Relaxed);
                }
            }
            p_deref.left.store(Shared::null(), Ordering::Relaxed);
            p_deref.right.store(Shared::null(), Ordering::Relaxed);
            p_deref.parent.store(Shared::null(), Ordering::Relaxed);
        }

        let new_root = if p_deref.red.load(Ordering::Relaxed) {
            root
        } else {
            TreeBin::balance_deletion(root, replacement, guard)
        };
        self.root.store(new_root, Ordering::Release);

        if p == replacement {
            // p was a leaf; detach it from its parent
            let pp = p_deref.parent.load(Ordering::Relaxed, guard);
            if !pp.is_null() {
                let pp_deref = TreeNode::get_tree_node(pp);
                if p == pp_deref.left.load(Ordering::Relaxed, guard) {
                    pp_deref.left.store(Shared::null(), Ordering::Relaxed);
                } else if p == pp_deref.right.load(Ordering::Relaxed, guard) {
                    pp_deref.right.store(Shared::null(), Ordering::Relaxed);
                }
                p_deref.parent.store(Shared::null(), Ordering::Relaxed);
            }
        }
        self.unlock_root();

        // the node is unreachable from the bin now; retire it (and possibly its value)
        if drop_value {
            let value = p_deref.node.value.load(Ordering::SeqCst, guard);
            guard.defer_destroy(value);
        }
        guard.defer_destroy(p);
        false
    }
}

impl<K, V> TreeBin<K, V> {
    /* ---------------- red-black balancing, from CLR -------------- */

    fn rotate_left<'g>(
        mut root: Shared<'g, BinEntry<K, V>>,
        p: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        if p.is_null() {
            return root;
        }
        // safety: rotations only run while the root is write-locked, and every node here was
        // read under the caller's guard.
        let p_deref = unsafe { TreeNode::get_tree_node(p) };
        let right = p_deref.right.load(Ordering::Relaxed, guard);
        if right.is_null() {
            return root;
        }
        let right_deref = unsafe { TreeNode::get_tree_node(right) };
        let right_left = right_deref.left.load(Ordering::Relaxed, guard);
        p_deref.right.store(right_left, Ordering::Relaxed);
        if !right_left.is_null() {
            unsafe { TreeNode::get_tree_node(right_left) }
                .parent
                .store(p, Ordering::Relaxed);
        }
        let p_parent = p_deref.parent.load(Ordering::Relaxed, guard);
        right_deref.parent.store(p_parent, Ordering::Relaxed);
        if p_parent.is_null() {
            root = right;
            right_deref.red.store(false, Ordering::Relaxed);
        } else {
            let p_parent_deref = unsafe { TreeNode::get_tree_node(p_parent) };
            if p_parent_deref.left.load(Ordering::Relaxed, guard) == p {
                p_parent_deref.left.store(right, Ordering::Relaxed);
            } else {
                p_parent_deref.right.store(right, Ordering::Relaxed);
            }
        }
        right_deref.left.store(p, Ordering::Relaxed);
        p_deref.parent.store(right, Ordering::Relaxed);
        root
    }

    fn rotate_right<'g>(
        mut root: Shared<'g, BinEntry<K, V>>,
        p: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        if p.is_null() {
            return root;
        }
        // safety: as in `rotate_left`.
        let p_deref = unsafe { TreeNode::get_tree_node(p) };
        let left = p_deref.left.load(Ordering::Relaxed, guard);
        if left.is_null() {
            return root;
        }
        let left_deref = unsafe { TreeNode::get_tree_node(left) };
        let left_right = left_deref.right.load(Ordering::Relaxed, guard);
        p_deref.left.store(left_right, Ordering::Relaxed);
        if !left_right.is_null() {
            unsafe { TreeNode::get_tree_node(left_right) }
                .parent
                .store(p, Ordering::Relaxed);
        }
        let p_parent = p_deref.parent.load(Ordering::Relaxed, guard);
        left_deref.parent.store(p_parent, Ordering::Relaxed);
        if p_parent.is_null() {
            root = left;
            left_deref.red.store(false, Ordering::Relaxed);
        } else {
            let p_parent_deref = unsafe { TreeNode::get_tree_node(p_parent) };
            if p_parent_deref.right.load(Ordering::Relaxed, guard) == p {
                p_parent_deref.right.store(left, Ordering::Relaxed);
            } else {
                p_parent_deref.left.store(left, Ordering::Relaxed);
            }
        }
        left_deref.right.store(p, Ordering::Relaxed);
        p_deref.parent.store(left, Ordering::Relaxed);
        root
    }

    fn balance_insertion<'g>(
        mut root: Shared<'g, BinEntry<K, V>>,
        mut x: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        // safety throughout: balancing only runs on a tree that is either freshly built and
        // unshared, or write-locked; nodes were read under the caller's guard.
        unsafe { TreeNode::get_tree_node(x) }
            .red
            .store(true, Ordering::Relaxed);

        loop {
            let x_parent = unsafe { TreeNode::get_tree_node(x) }
                .parent
                .load(Ordering::Relaxed, guard);
            if x_parent.is_null() {
                unsafe { TreeNode::get_tree_node(x) }
                    .red
                    .store(false, Ordering::Relaxed);
                return x;
            }
            let xp = unsafe { TreeNode::get_tree_node(x_parent) };
            if !xp.red.load(Ordering::Relaxed) {
                return root;
            }
            let x_parent_parent = xp.parent.load(Ordering::Relaxed, guard);
            if x_parent_parent.is_null() {
                return root;
            }
            let xpp = unsafe { TreeNode::get_tree_node(x_parent_parent) };
            let xpp_left = xpp.left.load(Ordering::Relaxed, guard);

            if x_parent == xpp_left {
                let xpp_right = xpp.right.load(Ordering::Relaxed, guard);
                if !xpp_right.is_null()
                    && unsafe { TreeNode::get_tree_node(xpp_right) }
                        .red
                        .load(Ordering::Relaxed)
                {
                    unsafe { TreeNode::get_tree_node(xpp_right) }
                        .red
                        .store(false, Ordering::Relaxed);
                    xp.red.store(false, Ordering::Relaxed);
                    xpp.red.store(true, Ordering::Relaxed);
                    x = x_parent_parent;
                } else {
                    if x == xp.right.load(Ordering::Relaxed, guard) {
                        x = x_parent;
                        root = TreeBin::rotate_left(root, x, guard);
                    }
                    let x_parent = unsafe { TreeNode::get_tree_node(x) }
                        .parent
                        .load(Ordering::Relaxed, guard);
                    if !x_parent.is_null() {
                        let xp = unsafe { TreeNode::get_tree_node(x_parent) };
                        xp.red.store(false, Ordering::Relaxed);
                        let x_parent_parent = xp.parent.load(Ordering::Relaxed, guard);
                        if !x_parent_parent.is_null() {
                            unsafe { TreeNode::get_tree_node(x_parent_parent) }
                                .red
                                .store(true, Ordering::Relaxed);
                            root = TreeBin::rotate_right(root, x_parent_parent, guard);
                        }
                    }
                }
            } else if !xpp_left.is_null()
                && unsafe { TreeNode::get_tree_node(xpp_left) }
                    .red
                    .load(Ordering::Relaxed)
            {
                unsafe { TreeNode::get_tree_node(xpp_left) }
                    .red
                    .store(false, Ordering::Relaxed);
                xp.red.store(false, Ordering::Relaxed);
                xpp.red.store(true, Ordering::Relaxed);
                x = x_parent_parent;
            } else {
                if x == xp.left.load(Ordering::Relaxed, guard) {
                    x = x_parent;
                    root = TreeBin::rotate_right(root, x, guard);
                }
                let x_parent = unsafe { TreeNode::get_tree_node(x) }
                    .parent
                    .load(Ordering::Relaxed, guard);
                if !x_parent.is_null() {
                    let xp = unsafe { TreeNode::get_tree_node(x_parent) };
                    xp.red.store(false, Ordering::Relaxed);
                    let x_parent_parent = xp.parent.load(Ordering::Relaxed, guard);
                    if !x_parent_parent.is_null() {
                        unsafe { TreeNode::get_tree_node(x_parent_parent) }
                            .red
                            .store(true, Ordering::Relaxed);
                        root = TreeBin::rotate_left(root, x_parent_parent, guard);
                    }
                }
            }
        }
    }

    fn balance_deletion<'g>(
        mut root: Shared<'g, BinEntry<K, V>>,
        mut x: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        // safety throughout: as in `balance_insertion`.
        loop {
            if x.is_null() || x == root {
                return root;
            }
            let x_parent = unsafe { TreeNode::get_tree_node(x) }
                .parent
                .load(Ordering::Relaxed, guard);
            if x_parent.is_null() {
                unsafe { TreeNode::get_tree_node(x) }
                    .red
                    .store(false, Ordering::Relaxed);
                return x;
            }
            if unsafe { TreeNode::get_tree_node(x) }.red.load(Ordering::Relaxed) {
                unsafe { TreeNode::get_tree_node(x) }
                    .red
                    .store(false, Ordering::Relaxed);
                return root;
            }
            let xp = unsafe { TreeNode::get_tree_node(x_parent) };
            let mut x_parent_left = xp.left.load(Ordering::Relaxed, guard);
            if x_parent_left == x {
                let mut x_parent_right = xp.right.load(Ordering::Relaxed, guard);
                if !x_parent_right.is_null()
                    && unsafe { TreeNode::get_tree_node(x_parent_right) }
                        .red
                        .load(Ordering::Relaxed)
                {
                    unsafe { TreeNode::get_tree_node(x_parent_right) }
                        .red
                        .store(false, Ordering::Relaxed);
                    xp.red.store(true, Ordering::Relaxed);
                    root = TreeBin::rotate_left(root, x_parent, guard);
                    x_parent_right = {
                        let xp = unsafe { TreeNode::get_tree_node(x) }
                            .parent
                            .load(Ordering::Relaxed, guard);
                        if xp.is_null() {
                            Shared::null()
                        } else {
                            unsafe { TreeNode::get_tree_node(xp) }
                                .right
                                .load(Ordering::Relaxed, guard)
                        }
                    };
                }
                if x_parent_right.is_null() {
                    x = unsafe { TreeNode::get_tree_node(x) }
                        .parent
                        .load(Ordering::Relaxed, guard);
                    continue;
                }
                let xpr = unsafe { TreeNode::get_tree_node(x_parent_right) };
                let sl = xpr.left.load(Ordering::Relaxed, guard);
                let mut sr = xpr.right.load(Ordering::Relaxed, guard);
                let sl_red = !sl.is_null()
                    && unsafe { TreeNode::get_tree_node(sl) }.red.load(Ordering::Relaxed);
                let sr_red = !sr.is_null()
                    && unsafe { TreeNode::get_tree_node(sr) }.red.load(Ordering::Relaxed);
                if !sl_red && !sr_red {
                    xpr.red.store(true, Ordering::Relaxed);
                    x = unsafe { TreeNode::get_tree_node(x) }
                        .parent
                        .load(Ordering::Relaxed, guard);
                    continue;
                }
                let mut x_parent_right = x_parent_right;
                if !sr_red {
                    if !sl.is_null() {
                        unsafe { TreeNode::get_tree_node(sl) }
                            .red
                            .store(false, Ordering::Relaxed);
                    }
                    xpr.red.store(true, Ordering::Relaxed);
                    root = TreeBin::rotate_right(root, x_parent_right, guard);
                    x_parent_right = {
                        let xp = unsafe { TreeNode::get_tree_node(x) }
                            .parent
                            .load(Ordering::Relaxed, guard);
                        if xp.is_null() {
                            Shared::null()
                        } else {
                            unsafe { TreeNode::get_tree_node(xp) }
                                .right
                                .load(Ordering::Relaxed, guard)
                        }
                    };
                }
                let x_parent = unsafe { TreeNode::get_tree_node(x) }
                    .parent
                    .load(Ordering::Relaxed, guard);
                if !x_parent_right.is_null() {
                    let xpr = unsafe { TreeNode::get_tree_node(x_parent_right) };
                    let red = if x_parent.is_null() {
                        false
                    } else {
                        unsafe { TreeNode::get_tree_node(x_parent) }
                            .red
                            .load(Ordering::Relaxed)
                    };
                    xpr.red.store(red, Ordering::Relaxed);
                    sr = xpr.right.load(Ordering::Relaxed, guard);
                    if !sr.is_null() {
                        unsafe { TreeNode::get_tree_node(sr) }
                            .red
                            .store(false, Ordering::Relaxed);
                    }
                }
                if !x_parent.is_null() {
                    unsafe { TreeNode::get_tree_node(x_parent) }
                        .red
                        .store(false, Ordering::Relaxed);
                    root = TreeBin::rotate_left(root, x_parent, guard);
                }
                x = root;
            } else {
                // symmetric
                if !x_parent_left.is_null()
                    && unsafe { TreeNode::get_tree_node(x_parent_left) }
                        .red
                        .load(Ordering::Relaxed)
                {
                    unsafe { TreeNode::get_tree_node(x_parent_left) }
                        .red
                        .store(false, Ordering::Relaxed);
                    xp.red.store(true, Ordering::Relaxed);
                    root = TreeBin::rotate_right(root, x_parent, guard);
                    x_parent_left = {
                        let xp = unsafe { TreeNode::get_tree_node(x) }
                            .parent
                            .load(Ordering::Relaxed, guard);
                        if xp.is_null() {
                            Shared::null()
                        } else {
                            unsafe { TreeNode::get_tree_node(xp) }
                                .left
                                .load(Ordering::Relaxed, guard)
                        }
                    };
                }
                if x_parent_left.is_null() {
                    x = unsafe { TreeNode::get_tree_node(x) }
                        .parent
                        .load(Ordering::Relaxed, guard);
                    continue;
                }
                let xpl = unsafe { TreeNode::get_tree_node(x_parent_left) };
                let mut sl = xpl.left.load(Ordering::Relaxed, guard);
                let sr = xpl.right.load(Ordering::Relaxed, guard);
                let sl_red = !sl.is_null()
                    && unsafe { TreeNode::get_tree_node(sl) }.red.load(Ordering::Relaxed);
                let sr_red = !sr.is_null()
                    && unsafe { TreeNode::get_tree_node(sr) }.red.load(Ordering::Relaxed);
                if !sl_red && !sr_red {
                    xpl.red.store(true, Ordering::Relaxed);
                    x = unsafe { TreeNode::get_tree_node(x) }
                        .parent
                        .load(Ordering::Relaxed, guard);
                    continue;
                }
                let mut x_parent_left = x_parent_left;
                if !sl_red {
                    if !sr.is_null() {
                        unsafe { TreeNode::get_tree_node(sr) }
                            .red
                            .store(false, Ordering::Relaxed);
                    }
                    xpl.red.store(true, Ordering::Relaxed);
                    root = TreeBin::rotate_left(root, x_parent_left, guard);
                    x_parent_left = {
                        let xp = unsafe { TreeNode::get_tree_node(x) }
                            .parent
                            .load(Ordering::Relaxed, guard);
                        if xp.is_null() {
                            Shared::null()
                        } else {
                            unsafe { TreeNode::get_tree_node(xp) }
                                .left
                                .load(Ordering::Relaxed, guard)
                        }
                    };
                }
                let x_parent = unsafe { TreeNode::get_tree_node(x) }
                    .parent
                    .load(Ordering::Relaxed, guard);
                if !x_parent_left.is_null() {
                    let xpl = unsafe { TreeNode::get_tree_node(x_parent_left) };
                    let red = if x_parent.is_null() {
                        false
                    } else {
                        unsafe { TreeNode::get_tree_node(x_parent) }
                            .red
                            .load(Ordering::Relaxed)
                    };
                    xpl.red.store(red, Ordering::Relaxed);
                    sl = xpl.left.load(Ordering::Relaxed, guard);
                    if !sl.is_null() {
                        unsafe { TreeNode::get_tree_node(sl) }
                            .red
                            .store(false, Ordering::Relaxed);
                    }
                }
                if !x_parent.is_null() {
                    unsafe { TreeNode::get_tree_node(x_parent) }
                        .red
                        .store(false, Ordering::Relaxed);
                    root = TreeBin::rotate_right(root, x_parent, guard);
                }
                x = root;
            }
        }
    }

    /// Drops the chain of tree nodes starting at `from`, optionally including their values.
    ///
    /// # Safety
    ///
    /// The nodes must be unreachable by any other thread (either never shared, or unlinked at
    /// least one epoch ago), and must not be accessed again afterwards.
    pub(crate) unsafe fn drop_tree_nodes<'g>(
        from: Shared<'g, BinEntry<K, V>>,
        drop_values: bool,
        guard: &'g Guard,
    ) {
        let mut p = from;
        while !p.is_null() {
            if let BinEntry::TreeNode(tree_node) = *p.into_owned().into_box() {
                if drop_values {
                    let _ = tree_node.node.value.into_owned();
                }
                p = tree_node.node.next.load(Ordering::SeqCst, guard);
            } else {
                unreachable!("tree chains only contain tree nodes");
            }
        }
    }

    /// Retires this bin and its tree nodes, but not the values, which live on in a replacement
    /// (linear) bin.
    ///
    /// # Safety
    ///
    /// The bin must be a `BinEntry::Tree` that has just been made unreachable from its table
    /// slot, read under `guard`.
    pub(crate) unsafe fn defer_drop_without_values<'g>(
        bin: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) {
        let bin = bin.as_raw() as usize;
        guard.defer_unchecked(move || {
            // safety: the caller guarantees the bin is an unreachable tree bin, and the
            // collector runs this at most once
            let bin = unsafe { Box::from_raw(bin as *mut BinEntry<K, V>) };
            if let BinEntry::Tree(mut tree_bin) = *bin {
                tree_bin.drop_nodes(false);
            } else {
                unreachable!("bin is a tree bin");
            }
        });
    }

    /// Tears down the node chain, optionally dropping values, and leaves `first` null so the
    /// `Drop` impl does not double-free.
    fn drop_nodes(&mut self, drop_values: bool) {
        // safety: we have exclusive access to the bin, which is unreachable by now.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let first = self.first.swap(Shared::null(), Ordering::Relaxed, guard);
        self.root.store(Shared::null(), Ordering::Relaxed);
        unsafe { TreeBin::drop_tree_nodes(first, drop_values, guard) };
    }
}

impl<K, V> Drop for TreeBin<K, V> {
    fn drop(&mut self) {
        self.drop_nodes(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tree_node(
        hash: u32,
        key: usize,
        value: usize,
        next: Atomic<BinEntry<usize, usize>>,
    ) -> BinEntry<usize, usize> {
        BinEntry::TreeNode(TreeNode::new(
            hash,
            key,
            Atomic::new(value),
            next,
            Atomic::null(),
        ))
    }

    fn tree_from_pairs(pairs: &[(u32, usize)]) -> TreeBin<usize, usize> {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let mut head = Atomic::null();
        for &(hash, key) in pairs.iter().rev() {
            head = Atomic::new(new_tree_node(hash, key, key * 10, head));
        }
        let head = head.load(Ordering::Relaxed, guard);
        // safety: we just created the chain and never shared it
        TreeBin::new(unsafe { head.into_owned() }, guard)
    }

    /// Walks the tree and checks the red-black invariants plus the search order.
    fn check_tree_invariants(bin: &TreeBin<usize, usize>) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let root = bin.root.load(Ordering::Relaxed, guard);
        if root.is_null() {
            return;
        }
        assert!(!unsafe { TreeNode::get_tree_node(root) }
            .red
            .load(Ordering::Relaxed));
        black_height(root, guard);
    }

    fn black_height(
        node: Shared<'_, BinEntry<usize, usize>>,
        guard: &Guard,
    ) -> usize {
        if node.is_null() {
            return 1;
        }
        let n = unsafe { TreeNode::get_tree_node(node) };
        let left = n.left.load(Ordering::Relaxed, guard);
        let right = n.right.load(Ordering::Relaxed, guard);
        if n.red.load(Ordering::Relaxed) {
            // a red node has no red child
            for child in [left, right].iter() {
                if !child.is_null() {
                    assert!(!unsafe { TreeNode::get_tree_node(*child) }
                        .red
                        .load(Ordering::Relaxed));
                }
            }
        }
        for (child, greater) in [(left, false), (right, true)].iter() {
            if !child.is_null() {
                let c = unsafe { TreeNode::get_tree_node(*child) };
                let ord = (c.node.hash(), &c.node.key).cmp(&(n.node.hash(), &n.node.key));
                if *greater {
                    assert_eq!(ord, std::cmp::Ordering::Greater);
                } else {
                    assert_eq!(ord, std::cmp::Ordering::Less);
                }
                assert_eq!(c.parent.load(Ordering::Relaxed, guard), node);
            }
        }
        let lh = black_height(left, guard);
        let rh = black_height(right, guard);
        assert_eq!(lh, rh, "black height must match on both sides");
        lh + if n.red.load(Ordering::Relaxed) { 0 } else { 1 }
    }

    #[test]
    fn build_and_find() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let pairs: Vec<_> = (0..64usize).map(|k| (42u32, k)).collect();
        let bin = tree_from_pairs(&pairs);
        check_tree_invariants(&bin);
        for k in 0..64usize {
            let found = bin.find(42, &k, guard);
            assert!(!found.is_null(), "key {} not found", k);
            let node = &unsafe { TreeNode::get_tree_node(found) }.node;
            assert_eq!(node.key, k);
            let v = node.value.load(Ordering::Relaxed, guard);
            assert_eq!(unsafe { *v.deref() }, k * 10);
        }
        assert!(bin.find(42, &64usize, guard).is_null());
        assert!(bin.find(7, &0usize, guard).is_null());
    }

    #[test]
    fn build_with_distinct_hashes() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let pairs: Vec<_> = (0..32usize).map(|k| ((k * 31) as u32 & HASH_BITS, k)).collect();
        let bin = tree_from_pairs(&pairs);
        check_tree_invariants(&bin);
        for &(h, k) in &pairs {
            assert!(!bin.find(h, &k, guard).is_null());
        }
    }

    #[test]
    fn insert_then_remove_keeps_invariants() {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let pairs: Vec<_> = (0..16usize).map(|k| (1u32, k)).collect();
        let bin = tree_from_pairs(&pairs);
        for k in 16..48usize {
            let value = Owned::new(k * 10).into_shared(guard);
            assert!(bin.find_or_put_tree_val(1, k, value, guard).is_null());
            check_tree_invariants(&bin);
        }
        // re-inserting an existing key returns the existing node
        let dup = Owned::new(0usize).into_shared(guard);
        let existing = bin.find_or_put_tree_val(1, 20, dup, guard);
        assert!(!existing.is_null());
        assert_eq!(unsafe { TreeNode::get_tree_node(existing) }.node.key, 20);
        unsafe { drop(dup.into_owned()) };

        for k in 0..40usize {
            let p = bin.find(1, &k, guard);
            assert!(!p.is_null());
            let untreeify = unsafe { bin.remove_tree_node(p, true, guard) };
            if untreeify {
                // too small to stay a tree; remaining nodes are still on the first chain
                break;
            }
            check_tree_invariants(&bin);
            assert!(bin.find(1, &k, guard).is_null());
        }
    }

    #[test]
    fn head_lock_state_machine() {
        let node = Node::<usize, usize>::new(3, 1, Shared::null());
        let lock = node.try_lock().expect("unlocked node must lock");
        // a second attempt must fail while the lock is held
        assert!(node.try_lock().is_none());
        assert_eq!(node.hash(), 3);
        drop(lock);
        assert_eq!(node.hash.load(Ordering::SeqCst), 3);
        let lock = node.try_lock().expect("released node must re-lock");
        drop(lock);
    }
}
