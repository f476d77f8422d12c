use crate::adder::LongAdder;
use crate::iter::*;
use crate::node::*;
use crate::raw::*;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use std::borrow::Borrow;
use std::cell::RefCell;
use std::error::Error;
use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{BuildHasher, Hash, Hasher};
use std::iter::FromIterator;
use std::sync::{
    atomic::{AtomicIsize, AtomicUsize, Ordering},
    Once,
};

/// The largest possible table capacity. Limited to 1<<30 because the top two bits of the 32-bit
/// hash field are used for lock-state control.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// The default initial table capacity. Must be a power of 2 and at most `MAXIMUM_CAPACITY`.
const DEFAULT_CAPACITY: usize = 16;

/// The bin count threshold for using a tree rather than list for a bin. Bins are converted to
/// trees when adding an element to a bin with at least this many nodes.
const TREEIFY_THRESHOLD: usize = 8;

/// The bin count threshold for converting a (split) tree bin back to a list during a resize.
/// Should be less than `TREEIFY_THRESHOLD`.
const UNTREEIFY_THRESHOLD: usize = 6;

/// The smallest table capacity for which bins may be treeified; below this the table is resized
/// instead, since growing distributes the colliding keys more cheaply than a tree does. At least
/// `4 * TREEIFY_THRESHOLD` to avoid conflicts between resizing and treeification thresholds.
const MIN_TREEIFY_CAPACITY: usize = 64;

/// How many lock-held bins the resize sweep will set aside for revisiting before it resorts to
/// blocking on a bin lock.
const TRANSFER_BUFFER_SIZE: usize = 32;

static NCPU_INITIALIZER: Once = Once::new();
static NCPU: AtomicUsize = AtomicUsize::new(0);

macro_rules! load_factor {
    ($n: expr) => {
        // ¾ n = n - n/4 = n - (n >> 2)
        $n - ($n >> 2)
    };
}

thread_local! {
    /// Maps (by address) whose compute family is currently running a user callback on this
    /// thread; used to fail loudly on re-entrant use instead of deadlocking on a bin lock.
    static COMPUTING: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

/// Marks the current thread as running a compute-family operation on the given map for the
/// scope of the value.
struct ReentrancyScope {
    map: usize,
}

impl ReentrancyScope {
    fn enter(map: usize) -> Self {
        COMPUTING.with(|stack| {
            let mut stack = stack.borrow_mut();
            assert!(
                !stack.contains(&map),
                "illegal state: compute, compute_if_absent, compute_if_present, and merge \
                 must not re-enter the same map from their callback"
            );
            stack.push(map);
        });
        Self { map }
    }
}

impl Drop for ReentrancyScope {
    fn drop(&mut self) {
        COMPUTING.with(|stack| {
            let mut stack = stack.borrow_mut();
            let popped = stack.pop();
            debug_assert_eq!(popped, Some(self.map));
        });
    }
}

/// Removes a reservation node from its bin if the computation that installed it unwinds.
struct Reservation<'t, 'g, K, V> {
    table: &'t Table<K, V>,
    bini: usize,
    node: Shared<'g, BinEntry<K, V>>,
    guard: &'g Guard,
    armed: bool,
}

impl<K, V> Reservation<'_, '_, K, V> {
    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl<K, V> Drop for Reservation<'_, '_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            self.table.store_bin(self.bini, Shared::null());
            // safety: the reservation was only ever reachable from this bin, which now reads
            // null; anyone who saw the node observed a null value and treated it as absent
            unsafe { self.guard.defer_destroy(self.node) };
        }
    }
}

/// A concurrent hash table.
///
/// See the [crate-level documentation](crate) for details. All operations take a
/// [`Guard`](epoch::Guard) obtained from [`HashMap::guard`]; [`HashMap::pin`] returns a view
/// that manages the guard for you.
pub struct HashMap<K, V, S = crate::DefaultHashBuilder> {
    /// The array of bins. Lazily initialized upon first insertion; always a power of two.
    pub(crate) table: Atomic<Table<K, V>>,

    /// Table initialization and resizing control. Positive: the element count at which the next
    /// resize triggers. Zero: use the defaults. `-1`: a thread is currently initializing or
    /// resizing the table, and everyone else continues against whatever table they find.
    size_ctl: AtomicIsize,

    /// Striped element counter; see `LongAdder`.
    count: LongAdder,

    /// Collector that all `Guard` references used with this map must be tied to. Using guards
    /// from a different collector would allow another thread's collector to free values this
    /// map still hands out, so every entry point checks the association.
    pub(crate) collector: epoch::Collector,

    build_hasher: S,
}

#[derive(Eq, PartialEq, Debug)]
enum PutResult<'a, T> {
    Inserted {
        new: &'a T,
    },
    Replaced {
        old: &'a T,
        new: &'a T,
    },
    Exists {
        current: &'a T,
        not_inserted: Box<T>,
    },
}

impl<'a, T> PutResult<'a, T> {
    fn before(&self) -> Option<&'a T> {
        match *self {
            PutResult::Inserted { .. } => None,
            PutResult::Replaced { old, .. } => Some(old),
            PutResult::Exists { current, .. } => Some(current),
        }
    }
}

/// The error type for the [`HashMap::try_insert`] method.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TryInsertError<'a, V> {
    /// A reference to the value currently mapped to the key.
    pub current: &'a V,
    /// The value that [`HashMap::try_insert`] failed to insert.
    pub not_inserted: V,
}

impl<V> Display for TryInsertError<'_, V>
where
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "insert of \"{:?}\" failed as key was already present with value \"{:?}\"",
            self.not_inserted, self.current
        )
    }
}

impl<V> Error for TryInsertError<'_, V> where V: Debug {}

// ===
// the following methods only see Ks and Vs if there have been inserts. modifications to the map
// are all guarded by thread-safety bounds (Send + Sync + 'static), but _these_ methods do not
// need to be, since they will never introduce keys or values, only give out ones that have
// already been inserted (which implies they must be thread-safe).
// ===

impl<K, V> HashMap<K, V, crate::DefaultHashBuilder> {
    /// Creates an empty `HashMap`.
    ///
    /// The hash map is initially created with a capacity of 0, so it will not allocate until it
    /// is first inserted into.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    /// let map: HashMap<&str, i32> = HashMap::new();
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty `HashMap` which can hold at least `capacity` elements without resizing.
    ///
    /// If `capacity` is 0, the call will not allocate. Note that the map resizes on key
    /// *collision* density, so a poor key distribution may still cause a resize before
    /// `capacity` elements are reached.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    /// let map: HashMap<&str, i32> = HashMap::with_capacity(10);
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, crate::DefaultHashBuilder::default())
    }
}

impl<K, V, S> Default for HashMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> HashMap<K, V, S> {
    /// Creates an empty map which will use `hash_builder` to hash keys.
    ///
    /// The created map has the default initial capacity.
    ///
    /// Warning: `hash_builder` is normally randomly generated, which makes the map resistant to
    /// attacks that cause many collisions and very poor performance. Setting it manually can
    /// expose a DoS attack vector.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::{DefaultHashBuilder, HashMap};
    ///
    /// let map = HashMap::with_hasher(DefaultHashBuilder::default());
    /// map.pin().insert(1, 2);
    /// ```
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            table: Atomic::null(),
            size_ctl: AtomicIsize::new(0),
            count: LongAdder::default(),
            collector: epoch::default_collector().clone(),
            build_hasher: hash_builder,
        }
    }

    /// Creates an empty map with the specified `capacity`, using `hash_builder` to hash the
    /// keys.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map = HashMap::with_capacity_and_hasher(10, RandomState::new());
    /// map.pin().insert(1, 2);
    /// ```
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        if capacity == 0 {
            return Self::with_hasher(hash_builder);
        }

        let map = Self::with_hasher(hash_builder);
        map.presize(capacity);
        map
    }

    /// Pin a `Guard` for use with this map.
    ///
    /// Keep in mind that for as long as you hold onto this `Guard`, you are preventing the
    /// collection of garbage generated by the map.
    pub fn guard(&self) -> epoch::Guard {
        self.collector.register().pin()
    }

    #[inline]
    pub(crate) fn check_guard(&self, guard: &Guard) {
        // guard.collector() is `None` if the guard is unprotected
        if let Some(c) = guard.collector() {
            assert_eq!(c, &self.collector);
        }
    }

    /// Returns the number of entries in the map.
    ///
    /// The returned value is a snapshot of the striped counter; under concurrent updates it may
    /// lag the instantaneous count, but it is exact whenever no update is in flight.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// map.pin().insert(1, "a");
    /// map.pin().insert(2, "b");
    /// assert!(map.len() == 2);
    /// ```
    pub fn len(&self) -> usize {
        let guard = self.collector.register().pin();
        let sum = self.count.sum(&guard);
        if sum < 0 {
            0
        } else {
            sum as usize
        }
    }

    /// Returns the number of entries in the map as a 64-bit count.
    ///
    /// Unlike [`HashMap::len`], which saturates at `usize::MAX`, this reports the counter sum
    /// directly.
    pub fn mapping_count(&self) -> u64 {
        let guard = self.collector.register().pin();
        let sum = self.count.sum(&guard);
        if sum < 0 {
            0
        } else {
            sum as u64
        }
    }

    /// Returns `true` if the map is empty. Otherwise returns `false`.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert!(map.is_empty());
    /// map.pin().insert("a", 1);
    /// assert!(!map.is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    /// Returns the capacity of the map.
    fn capacity(&self, guard: &Guard) -> usize {
        self.check_guard(guard);
        let table = self.table.load(Ordering::Relaxed, guard);

        if table.is_null() {
            0
        } else {
            // safety: we loaded `table` under the guard, so it is still valid here
            unsafe { table.deref() }.len()
        }
    }

    /// An iterator visiting all key-value pairs in arbitrary order.
    ///
    /// The iterator element type is `(&'g K, &'g V)`.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        let node_iter = NodeIter::new(table, guard);
        Iter { node_iter }
    }

    /// An iterator visiting all keys in arbitrary order.
    ///
    /// The iterator element type is `&'g K`.
    pub fn keys<'g>(&'g self, guard: &'g Guard) -> Keys<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        let node_iter = NodeIter::new(table, guard);
        Keys { node_iter }
    }

    /// An iterator visiting all values in arbitrary order.
    ///
    /// The iterator element type is `&'g V`.
    pub fn values<'g>(&'g self, guard: &'g Guard) -> Values<'g, K, V> {
        self.check_guard(guard);
        let table = self.table.load(Ordering::SeqCst, guard);
        let node_iter = NodeIter::new(table, guard);
        Values { node_iter }
    }

    fn init_table<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Table<K, V>> {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            // safety: we loaded the table under the guard; it is not dropped before the next
            // epoch at the earliest
            if !table.is_null() && !unsafe { table.deref() }.is_empty() {
                break table;
            }
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 {
                // we lost the initialization race; just spin
                std::thread::yield_now();
                continue;
            }

            if self
                .size_ctl
                .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                // we get to do it!
                let mut table = self.table.load(Ordering::SeqCst, guard);

                // safety: as above
                if table.is_null() || unsafe { table.deref() }.is_empty() {
                    let n = if sc > 0 { sc as usize } else { DEFAULT_CAPACITY };
                    let new_table = Owned::new(Table::new(n));
                    table = new_table.into_shared(guard);
                    self.table.store(table, Ordering::SeqCst);
                    self.size_ctl
                        .store(load_factor!(n as isize), Ordering::SeqCst);
                } else {
                    self.size_ctl.store(sc, Ordering::SeqCst);
                }
                break table;
            }
        }
    }

    /// Pre-sizes the table during construction, before the map is shared.
    fn presize(&self, size: usize) {
        // safety: we are creating this map, so no other thread can access it
        let guard = unsafe { epoch::unprotected() };

        let requested_capacity = if size >= MAXIMUM_CAPACITY / 2 {
            MAXIMUM_CAPACITY
        } else {
            // round 1.5 × size + 1 up to the next power of two
            let size = size + (size >> 1) + 1;
            usize::min(MAXIMUM_CAPACITY, size.next_power_of_two())
        };

        assert_eq!(self.size_ctl.load(Ordering::SeqCst), 0);
        assert!(self.table.load(Ordering::SeqCst, guard).is_null());

        let new_table = Owned::new(Table::new(requested_capacity)).into_shared(guard);
        self.table.store(new_table, Ordering::SeqCst);
        self.size_ctl
            .store(load_factor!(requested_capacity as isize), Ordering::SeqCst);
    }
}

// ===
// the following methods require Clone and Ord, since they ultimately call `rebuild`, which needs
// to be able to clone keys and work with tree bins. however, they do _not_ need thread-safety
// bounds, since if those do not hold, the map is empty and nothing gets transferred anyway.
// ===

impl<K, V, S> HashMap<K, V, S>
where
    K: Clone + Ord,
{
    /// Tries to presize the table to accommodate the given number of elements.
    fn try_presize(&self, size: usize, guard: &Guard) {
        let requested_capacity = if size >= MAXIMUM_CAPACITY / 2 {
            MAXIMUM_CAPACITY
        } else {
            let size = size + (size >> 1) + 1;
            usize::min(MAXIMUM_CAPACITY, size.next_power_of_two())
        } as isize;

        loop {
            let size_ctl = self.size_ctl.load(Ordering::SeqCst);
            if size_ctl < 0 {
                // someone else is initializing or resizing; operations continue against
                // whatever table they find, and so can we
                break;
            }

            let table = self.table.load(Ordering::SeqCst, guard);
            let current_capacity = if table.is_null() {
                0
            } else {
                // safety: read under the guard
                unsafe { table.deref() }.len()
            };

            if current_capacity == 0 {
                // the table has not yet been initialized; create it with as many bins as
                // requested (or as a pre-set initial capacity dictates, if larger)
                let new_capacity = requested_capacity.max(size_ctl) as usize;

                if self
                    .size_ctl
                    .compare_exchange(size_ctl, -1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    continue;
                }

                if self.table.load(Ordering::SeqCst, guard) != table {
                    // someone else beat us to initialization; release the "lock" unchanged
                    self.size_ctl.store(size_ctl, Ordering::SeqCst);
                    continue;
                }

                let new_table = Owned::new(Table::new(new_capacity)).into_shared(guard);
                let old_table = self.table.swap(new_table, Ordering::SeqCst, guard);
                assert!(old_table.is_null());
                self.size_ctl
                    .store(load_factor!(new_capacity as isize), Ordering::SeqCst);
            } else if requested_capacity <= size_ctl || current_capacity >= MAXIMUM_CAPACITY {
                // either the load we would resize at covers the request already, or the table
                // cannot grow further; in both cases there is nothing to do
                break;
            } else if self
                .size_ctl
                .compare_exchange(size_ctl, -1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                if self.table.load(Ordering::SeqCst, guard) == table {
                    self.rebuild(table, guard);
                    self.size_ctl.store(
                        load_factor!((current_capacity as isize) << 1),
                        Ordering::SeqCst,
                    );
                } else {
                    self.size_ctl.store(size_ctl, Ordering::SeqCst);
                }
            }
        }
    }

    /// Adjusts the striped counter by `n` and, if the caller passed a bin-length hint, checks
    /// whether the table needs resizing.
    ///
    /// `resize_hint` is `None` when the caller does not want a resize considered (removals), and
    /// `Some(len)` when it saw `len` entries in the bin it just updated.
    fn add_count(&self, n: isize, resize_hint: Option<usize>, guard: &Guard) {
        self.count.add(n, guard);
        if resize_hint.is_none() {
            return;
        }
        self.check_for_resize(guard);
    }

    /// If the table is too small and not already resizing, claims `size_ctl` and transfers the
    /// bins into a doubled table. Rechecks occupancy afterwards, since resizings can lag
    /// additions.
    fn check_for_resize(&self, guard: &Guard) {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            if table.is_null() {
                break;
            }
            // safety: read under the guard; the table is not dropped before the guard is
            let n = unsafe { table.deref() }.len();
            if n >= MAXIMUM_CAPACITY {
                // can't resize any more anyway
                break;
            }
            let sc = self.size_ctl.load(Ordering::SeqCst);
            if sc < 0 || self.count.sum(guard) < sc {
                // someone else is resizing, or we are not at the threshold yet. a thread that
                // observes an in-progress resize does not wait for it; its operation simply
                // chases forwarding markers into the new table as it finds them.
                break;
            }
            if self
                .size_ctl
                .compare_exchange(sc, -1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                if self.table.load(Ordering::SeqCst, guard) == table {
                    self.rebuild(table, guard);
                    self.size_ctl
                        .store(load_factor!((n as isize) << 1), Ordering::SeqCst);
                } else {
                    self.size_ctl.store(sc, Ordering::SeqCst);
                }
            }
        }
    }

    /// Transfers every bin of `table` into a freshly allocated table of twice the size, then
    /// publishes the new table.
    ///
    /// The caller must own the resize (it claimed `size_ctl` with `-1`) and `table` must be the
    /// map's current table. The sweep runs from the last bin down to bin zero, planting the
    /// shared forwarding marker in each transferred slot; lookups and updates keep running
    /// against the old table throughout and chase the markers as they meet them.
    ///
    /// A bin whose head lock is held by an updater is not waited for immediately: its index goes
    /// into a small revisit buffer and its two target slots in the new table receive a reverse
    /// forwarder, so that operations already in the new table can still find the entries in the
    /// old one. Only when the buffer overflows does the sweep block on a bin lock.
    fn rebuild<'g>(&'g self, table: Shared<'g, Table<K, V>>, guard: &'g Guard) {
        // safety: table was read under our guard, and the code that retires a table only runs
        // after the table is replaced and all operations that could have seen it have finished
        let t = unsafe { table.deref() };
        let n = t.len();
        let next_table = Owned::new(Table::new(n << 1)).into_shared(guard);
        // safety: we just allocated the table, and publish it below
        let next = unsafe { next_table.deref() };
        let fwd = t.get_moved(next_table, guard);

        let mut buffer: Option<Box<[usize; TRANSFER_BUFFER_SIZE]>> = None;
        let mut rev: Shared<'_, BinEntry<K, V>> = Shared::null();
        let mut nbuffered = 0;
        let mut buffer_index = 0;

        // `bin` is the next unvisited index of the downward sweep, or -1 once the sweep has
        // finished and only buffered bins remain
        let mut bin = n as isize - 1;
        let mut i = bin;
        loop {
            let idx = i as usize;
            let f = t.bin(idx, guard);
            if f.is_null() {
                if bin >= 0 {
                    if t.cas_bin(idx, Shared::null(), fwd, guard).is_err() {
                        // a concurrent insert claimed the bin; transfer it for real
                        continue;
                    }
                } else {
                    // revisit phase: the paired slots in the new table hold reverse
                    // forwarders. clear them _before_ planting the forward marker, so readers
                    // never bounce between the two tables.
                    next.store_bin(idx, Shared::<'_, BinEntry<K, V>>::null());
                    next.store_bin(idx + n, Shared::<'_, BinEntry<K, V>>::null());
                    if t.cas_bin(idx, Shared::null(), fwd, guard).is_err() {
                        continue;
                    }
                }
            } else {
                // safety: `f` was read under our guard; bins are only dropped an epoch after
                // they are replaced
                match *unsafe { f.deref() } {
                    BinEntry::Moved(_) => {
                        // only this sweep plants forwarding markers, so the bin has already
                        // been handled; advance
                    }
                    BinEntry::Tree(ref tree_bin) => {
                        let bin_lock = tree_bin.lock.lock();
                        if t.bin(idx, guard) != f {
                            drop(bin_lock);
                            continue;
                        }
                        self.split_tree_bin(next, idx, n, f, tree_bin, guard);
                        t.store_bin(idx, fwd);
                        drop(bin_lock);
                    }
                    BinEntry::Node(ref head) => {
                        match head.try_lock() {
                            Some(head_lock) => {
                                if t.bin(idx, guard) != f {
                                    drop(head_lock);
                                    continue;
                                }
                                Self::split_list_bin(next, idx, n, f, guard);
                                t.store_bin(idx, fwd);
                                drop(head_lock);
                            }
                            None => {
                                // the bin is locked by an updater. defer it rather than wait:
                                // buffer the index, mark the paired new-table slots with a
                                // reverse forwarder, and keep sweeping.
                                let buffer = buffer
                                    .get_or_insert_with(|| Box::new([0; TRANSFER_BUFFER_SIZE]));
                                if bin < 0 && buffer_index > 0 {
                                    // swap in another deferred bin; ours may still be locked
                                    buffer_index -= 1;
                                    let j = buffer[buffer_index];
                                    buffer[buffer_index] = idx;
                                    i = j as isize;
                                    continue;
                                }
                                if bin < 0 || nbuffered >= TRANSFER_BUFFER_SIZE {
                                    // no more room; nothing left but to block
                                    head.await_lock(f, t, idx, guard);
                                    continue;
                                }
                                if rev.is_null() {
                                    rev = Owned::new(BinEntry::Moved(table.as_raw()))
                                        .into_shared(guard);
                                }
                                // recheck before deferring
                                if t.bin(idx, guard) != f || !head.is_locked() {
                                    // either the head changed or the lock just freed up;
                                    // retry the bin
                                    continue;
                                }
                                buffer[nbuffered] = idx;
                                nbuffered += 1;
                                next.store_bin(idx, rev);
                                next.store_bin(idx + n, rev);
                            }
                        }
                    }
                    BinEntry::TreeNode(_) => {
                        unreachable!("the head of a bin cannot be a TreeNode")
                    }
                }
            }

            if bin > 0 {
                bin -= 1;
                i = bin;
            } else if nbuffered > 0 {
                bin = -1;
                nbuffered -= 1;
                buffer_index = nbuffered;
                i = buffer.as_ref().expect("nbuffered > 0 implies a buffer")[buffer_index]
                    as isize;
            } else {
                break;
            }
        }

        // every bin now forwards into the new table; publish it
        let now_garbage = self.table.swap(next_table, Ordering::SeqCst, guard);
        debug_assert_eq!(now_garbage, table);
        if !rev.is_null() {
            // all deferred bins were revisited, so the reverse forwarder is unreachable
            // safety: as for the table below
            unsafe { guard.defer_destroy(rev) };
        }
        // safety: the old table is no longer reachable through `self.table`, and the only
        // forwarding markers that point at it are in _previous_ tables, which are themselves
        // only reachable by threads that pinned an epoch no later than ours. any such thread
        // keeps the epoch from advancing, and the table is only freed two epochs later, by
        // which time those threads have unpinned.
        unsafe { guard.defer_destroy(now_garbage) };
    }

    /// Splits the list bin `f` (whose head lock the caller holds) into its low and high halves
    /// and installs them at `i` and `i + n` of `next`.
    ///
    /// The longest tail run whose members all land in the same half is reused as-is; only the
    /// prefix is cloned, and the cloned-over prefix nodes are retired.
    fn split_list_bin<'g>(
        next: &Table<K, V>,
        i: usize,
        n: usize,
        f: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) {
        let bit = n as u32;
        // safety throughout: the caller holds the bin lock, so the chain cannot change under
        // us, and all nodes were read under the caller's guard
        let head = unsafe { f.deref() }
            .as_node()
            .expect("split_list_bin is called on list bins");

        let mut run_bit = head.hash() & bit;
        let mut last_run = f;
        let mut p = f;
        loop {
            let node = unsafe { p.deref() }.as_node().expect("list bin");
            let next_p = node.next.load(Ordering::SeqCst, guard);
            let b = node.hash() & bit;
            if b != run_bit {
                run_bit = b;
                last_run = p;
            }
            if next_p.is_null() {
                break;
            }
            p = next_p;
        }

        let mut low_bin = Shared::null();
        let mut high_bin = Shared::null();
        if run_bit == 0 {
            // the last run stays at the low index
            low_bin = last_run;
        } else {
            // the last run moves up by the old table length
            high_bin = last_run;
        }

        p = f;
        while p != last_run {
            let node = unsafe { p.deref() }.as_node().expect("list bin");
            let link = if node.hash() & bit == 0 {
                &mut low_bin
            } else {
                &mut high_bin
            };
            *link = Owned::new(BinEntry::Node(Node::with_next(
                node.hash(),
                node.key.clone(),
                node.value.clone(),
                Atomic::from(*link),
            )))
            .into_shared(guard);
            p = node.next.load(Ordering::SeqCst, guard);
        }

        next.store_bin(i, low_bin);
        next.store_bin(i + n, high_bin);

        // the cloned prefix of the old chain is garbage once the forwarding marker is planted;
        // the values live on in the clones
        p = f;
        while p != last_run {
            let next_p = unsafe { p.deref() }
                .as_node()
                .expect("list bin")
                .next
                .load(Ordering::SeqCst, guard);
            // safety: the only way to reach `p` is through the old bin, which is about to be
            // replaced by a forwarding marker; threads holding a reference pinned an epoch no
            // later than ours
            unsafe { guard.defer_destroy(p) };
            p = next_p;
        }
    }

    /// Splits the tree bin `f` (whose write lock the caller holds) into its low and high halves
    /// and installs them at `i` and `i + n` of `next`, untreeifying halves that fall below the
    /// threshold.
    fn split_tree_bin<'g>(
        &'g self,
        next: &Table<K, V>,
        i: usize,
        n: usize,
        f: Shared<'g, BinEntry<K, V>>,
        tree_bin: &'g TreeBin<K, V>,
        guard: &'g Guard,
    ) {
        let bit = n as u32;
        let mut low = Shared::null();
        let mut low_tail: Shared<'_, BinEntry<K, V>> = Shared::null();
        let mut high = Shared::null();
        let mut high_tail: Shared<'_, BinEntry<K, V>> = Shared::null();
        let mut low_count = 0;
        let mut high_count = 0;
        let mut e = tree_bin.first.load(Ordering::Relaxed, guard);
        while !e.is_null() {
            // safety: we hold the bin's write lock, so the chain is stable, and its nodes were
            // read under our guard
            let tree_node = unsafe { TreeNode::get_tree_node(e) };
            let hash = tree_node.node.hash();
            let new_node = TreeNode::new(
                hash,
                tree_node.node.key.clone(),
                tree_node.node.value.clone(),
                Atomic::null(),
                Atomic::null(),
            );
            if hash & bit == 0 {
                new_node.prev.store(low_tail, Ordering::Relaxed);
                let new_node = Owned::new(BinEntry::TreeNode(new_node)).into_shared(guard);
                if low_tail.is_null() {
                    low = new_node;
                } else {
                    // safety: `low_tail` was created by us and never shared
                    unsafe { TreeNode::get_tree_node(low_tail) }
                        .node
                        .next
                        .store(new_node, Ordering::Relaxed);
                }
                low_tail = new_node;
                low_count += 1;
            } else {
                new_node.prev.store(high_tail, Ordering::Relaxed);
                let new_node = Owned::new(BinEntry::TreeNode(new_node)).into_shared(guard);
                if high_tail.is_null() {
                    high = new_node;
                } else {
                    // safety: `high_tail` was created by us and never shared
                    unsafe { TreeNode::get_tree_node(high_tail) }
                        .node
                        .next
                        .store(new_node, Ordering::Relaxed);
                }
                high_tail = new_node;
                high_count += 1;
            }
            e = tree_node.node.next.load(Ordering::Relaxed, guard);
        }

        let mut reused_bin = false;
        let low_bin = if low_count <= UNTREEIFY_THRESHOLD {
            // too small to stay a tree; the nodes we created get cleaned up manually
            let low_linear = Self::untreeify(low, guard);
            // safety: we just created `low` and its `next` nodes and never shared them
            unsafe { TreeBin::drop_tree_nodes(low, false, guard) };
            low_linear
        } else if high_count != 0 {
            Owned::new(BinEntry::Tree(TreeBin::new(
                // safety: we just created `low` and its `next` nodes and never shared them
                unsafe { low.into_owned() },
                guard,
            )))
            .into_shared(guard)
        } else {
            // the high half is empty, so all nodes stayed put: reuse the old bin, which is
            // swapped for a forwarding marker while we still hold its lock
            reused_bin = true;
            // safety: as above; the created low nodes go unused
            unsafe { TreeBin::drop_tree_nodes(low, false, guard) };
            f
        };
        let high_bin = if high_count <= UNTREEIFY_THRESHOLD {
            let high_linear = Self::untreeify(high, guard);
            // safety: as for the low half
            unsafe { TreeBin::drop_tree_nodes(high, false, guard) };
            high_linear
        } else if low_count != 0 {
            Owned::new(BinEntry::Tree(TreeBin::new(
                // safety: as for the low half
                unsafe { high.into_owned() },
                guard,
            )))
            .into_shared(guard)
        } else {
            reused_bin = true;
            // safety: as for the low half
            unsafe { TreeBin::drop_tree_nodes(high, false, guard) };
            f
        };

        next.store_bin(i, low_bin);
        next.store_bin(i + n, high_bin);

        // if the old bin was not reused, all of its nodes were reallocated above and the bin
        // itself is garbage; the values are shared with the new nodes and live on
        if !reused_bin {
            // safety: the old bin is replaced by a forwarding marker right after we return, so
            // no new reference to it can be obtained
            unsafe { TreeBin::defer_drop_without_values(f, guard) };
        }
    }

    /// Replaces all linked nodes in the bin at the given index unless the table is too small, in
    /// which case a resize is initiated instead.
    fn treeify_bin<'g>(&'g self, tab: &Table<K, V>, index: usize, guard: &'g Guard) {
        let n = tab.len();
        if n < MIN_TREEIFY_CAPACITY {
            self.try_presize(n << 1, guard);
            return;
        }
        loop {
            let bin = tab.bin(index, guard);
            if bin.is_null() {
                return;
            }
            // safety: read under our guard; replaced bins are not dropped before the guard is
            match *unsafe { bin.deref() } {
                BinEntry::Node(ref node) => {
                    let lock = match node.try_lock() {
                        Some(lock) => lock,
                        None => {
                            node.await_lock(bin, tab, index, guard);
                            continue;
                        }
                    };
                    if tab.bin(index, guard) != bin {
                        // the bin changed while we were waiting; whoever changed it has either
                        // treeified or moved it
                        return;
                    }
                    let mut e = bin;
                    let mut head = Shared::null();
                    let mut tail: Shared<'_, BinEntry<K, V>> = Shared::null();
                    while !e.is_null() {
                        // safety: we hold the bin lock, so the chain is stable
                        let e_deref = unsafe { e.deref() }.as_node().expect("list bin");
                        let new_tree_node = TreeNode::new(
                            e_deref.hash(),
                            e_deref.key.clone(),
                            e_deref.value.clone(),
                            Atomic::null(),
                            Atomic::null(),
                        );
                        new_tree_node.prev.store(tail, Ordering::Relaxed);
                        let new_tree_node =
                            Owned::new(BinEntry::TreeNode(new_tree_node)).into_shared(guard);
                        if tail.is_null() {
                            head = new_tree_node;
                        } else {
                            // safety: just created by us, never shared
                            unsafe { tail.deref() }
                                .as_tree_node()
                                .expect("tail is a tree node")
                                .node
                                .next
                                .store(new_tree_node, Ordering::Relaxed);
                        }
                        tail = new_tree_node;
                        e = e_deref.next.load(Ordering::SeqCst, guard);
                    }
                    tab.store_bin(
                        index,
                        Owned::new(BinEntry::Tree(TreeBin::new(
                            // safety: we just created the chain and never shared it
                            unsafe { head.into_owned() },
                            guard,
                        ))),
                    );
                    drop(lock);
                    // the old list nodes are garbage; their values moved into the tree nodes
                    e = bin;
                    while !e.is_null() {
                        // safety: the bin was just replaced, so these nodes are unreachable to
                        // new threads; old threads pinned an epoch no later than ours
                        unsafe {
                            guard.defer_destroy(e);
                            e = e
                                .deref()
                                .as_node()
                                .expect("list bin")
                                .next
                                .load(Ordering::SeqCst, guard);
                        }
                    }
                    return;
                }
                BinEntry::Moved(_) | BinEntry::Tree(_) => {
                    // the bin changed since the caller released its lock: it was either moved
                    // by a resize or already treeified by another insert. either way there is
                    // nothing left for us to do.
                    return;
                }
                BinEntry::TreeNode(_) => unreachable!("TreeNode cannot be the head of a bin"),
            }
        }
    }

    /// Returns a list of plain nodes replacing the tree nodes in the given chain. Does _not_
    /// clean up the tree nodes, as they may still be reachable.
    fn untreeify<'g>(
        bin: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        let mut head = Shared::null();
        let mut tail: Shared<'_, BinEntry<K, V>> = Shared::null();
        let mut q = bin;
        while !q.is_null() {
            // safety: untreeify is only called on chains that were either just created (resize
            // splits) or read from a bin under the caller's guard while holding its lock
            let q_deref = unsafe { q.deref() }
                .as_tree_node()
                .expect("untreeify is called on tree node chains");
            let new_node = Owned::new(BinEntry::Node(Node::with_next(
                q_deref.node.hash(),
                q_deref.node.key.clone(),
                q_deref.node.value.clone(),
                Atomic::null(),
            )))
            .into_shared(guard);
            if tail.is_null() {
                head = new_node;
            } else {
                // safety: just created by us in the previous iteration
                unsafe { tail.deref() }
                    .as_node()
                    .expect("just created")
                    .next
                    .store(new_node, Ordering::Relaxed);
            }
            tail = new_node;
            q = q_deref.node.next.load(Ordering::Relaxed, guard);
        }
        head
    }

    /// Clears the map, removing all key-value pairs.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// map.pin().insert(1, "a");
    /// map.pin().clear();
    /// assert!(map.is_empty());
    /// ```
    pub fn clear(&self, guard: &Guard) {
        self.check_guard(guard);
        let mut delta = 0;
        let mut idx = 0usize;

        let mut table = self.table.load(Ordering::SeqCst, guard);
        // safety: self.table is read under the guard throughout
        while !table.is_null() && idx < unsafe { table.deref() }.len() {
            let tab = unsafe { table.deref() };
            let raw_node = tab.bin(idx, guard);
            if raw_node.is_null() {
                idx += 1;
                continue;
            }
            // safety: read under our guard
            match *unsafe { raw_node.deref() } {
                BinEntry::Moved(next_table) => {
                    // clear the rest in the newer table
                    table = Shared::from(next_table);
                    idx = 0;
                }
                BinEntry::Node(ref node) => {
                    let head_lock = match node.try_lock() {
                        Some(lock) => lock,
                        None => {
                            node.await_lock(raw_node, tab, idx, guard);
                            continue;
                        }
                    };
                    if tab.bin(idx, guard) != raw_node {
                        continue;
                    }
                    // unlink the bin so others no longer enter it, then release the lock early;
                    // new threads and woken waiters will read the empty bin
                    tab.store_bin(idx, Shared::<'_, BinEntry<K, V>>::null());
                    drop(head_lock);

                    // walk the bin, retiring nodes and values
                    let mut p = raw_node;
                    while !p.is_null() {
                        delta -= 1;
                        p = {
                            // safety: we loaded p under the guard, so it is not retired yet
                            let node = unsafe { p.deref() }
                                .as_node()
                                .expect("entry following a node is always a node");
                            let next = node.next.load(Ordering::SeqCst, guard);
                            let value = node.value.load(Ordering::SeqCst, guard);
                            // safety: anyone who sees these pointers read the bin before we
                            // stored null into it, and therefore pinned an epoch no later than
                            // ours
                            unsafe { guard.defer_destroy(value) };
                            unsafe { guard.defer_destroy(p) };
                            next
                        };
                    }
                    idx += 1;
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if tab.bin(idx, guard) != raw_node {
                        continue;
                    }
                    tab.store_bin(idx, Shared::<'_, BinEntry<K, V>>::null());
                    drop(bin_lock);
                    // count the removed entries; the nodes and values are dropped together
                    // with the tree bin
                    let mut p = tree_bin.first.load(Ordering::SeqCst, guard);
                    while !p.is_null() {
                        delta -= 1;
                        // safety: read under our guard while the bin was still reachable
                        p = unsafe { TreeNode::get_tree_node(p) }
                            .node
                            .next
                            .load(Ordering::SeqCst, guard);
                    }
                    // safety: as for list bins above
                    unsafe { guard.defer_destroy(raw_node) };
                    idx += 1;
                }
                BinEntry::TreeNode(_) => {
                    unreachable!("the head of a bin cannot be a TreeNode")
                }
            };
        }

        if delta != 0 {
            self.add_count(delta, None, guard);
        }
        guard.flush();
    }
}

// ===
// the following methods never introduce new items (so they do not need the thread-safety
// bounds), but they _do_ perform lookups, which require hashing and ordering.
// ===

impl<K, V, S> HashMap<K, V, S>
where
    K: Hash + Ord,
    S: BuildHasher,
{
    /// Spreads the 64-bit hasher output into a well-distributed 30-bit value.
    ///
    /// Every input bit participates, and the top two bits of the result are zero so the value
    /// can never collide with the lock-state bits of a node's hash word.
    #[inline]
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u32 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        let h = hasher.finish();
        let mut h = (h ^ (h >> 32)) as u32;
        h ^= (h >> 18) ^ (h >> 12);
        (h ^ (h >> 10)) & HASH_BITS
    }

    fn get_node<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        let table = self.table.load(Ordering::SeqCst, guard);
        if table.is_null() {
            return None;
        }

        // safety: we loaded the table under our guard; tables are only retired an epoch after
        // they are replaced
        let table = unsafe { table.deref() };
        if table.is_empty() {
            return None;
        }

        let h = self.hash(key);
        let bini = table.bini(h);
        let bin = table.bin(bini, guard);
        if bin.is_null() {
            return None;
        }

        // safety: bin was read under our guard. a bin pointer is invalidated when its table is
        // retired after a resize, when a resize swaps it for a forwarding marker, or when it is
        // converted to or from a tree bin; in every case the old bin is dropped at least one
        // epoch after it becomes unreachable, and our guard pins the epoch we read it in.
        let node = table.find(unsafe { bin.deref() }, h, key, guard);
        if node.is_null() {
            return None;
        }
        // safety: as above
        let node = unsafe { node.deref() };
        Some(match *node {
            BinEntry::Node(ref n) => n,
            BinEntry::TreeNode(ref tn) => &tn.node,
            _ => panic!("`Table::find` should always return a node"),
        })
    }

    /// Returns `true` if the map contains a value for the specified key.
    ///
    /// The key may be any borrowed form of the map's key type, but [`Hash`] and [`Ord`] on the
    /// borrowed form *must* match those for the key type.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.insert(1, "a");
    /// assert!(mref.contains_key(&1));
    /// assert!(!mref.contains_key(&2));
    /// ```
    pub fn contains_key<Q>(&self, key: &Q, guard: &Guard) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.get(key, guard).is_some()
    }

    /// Returns a reference to the value corresponding to the key.
    ///
    /// The key may be any borrowed form of the map's key type, but [`Hash`] and [`Ord`] on the
    /// borrowed form *must* match those for the key type.
    ///
    /// To obtain a `Guard`, use [`HashMap::guard`].
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.insert(1, "a");
    /// assert_eq!(mref.get(&1), Some(&"a"));
    /// assert_eq!(mref.get(&2), None);
    /// ```
    #[inline]
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        let node = self.get_node(key, guard)?;

        let v = node.value.load(Ordering::SeqCst, guard);
        if v.is_null() {
            // the node is mid-insertion or mid-deletion: not present
            return None;
        }
        // safety: the reference is bound to the guard, and the value is not retired while an
        // epoch pinned no later than the retirement is held
        unsafe { v.as_ref() }
    }

    /// Returns the key-value pair corresponding to `key`, or `None` if the map contains no
    /// mapping for it.
    ///
    /// The key may be any borrowed form of the map's key type, but [`Hash`] and [`Ord`] on the
    /// borrowed form *must* match those for the key type.
    #[inline]
    pub fn get_key_value<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        let node = self.get_node(key, guard)?;

        let v = node.value.load(Ordering::SeqCst, guard);
        if v.is_null() {
            return None;
        }
        // safety: as in `get`
        unsafe { v.as_ref() }.map(|v| (&node.key, v))
    }

    pub(crate) fn guarded_eq(&self, other: &Self, our_guard: &Guard, their_guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        if self.len() != other.len() {
            return false;
        }

        self.iter(our_guard)
            .all(|(key, value)| other.get(key, their_guard).map_or(false, |v| *value == *v))
    }

    /// Returns `true` if the map maps one or more keys to the given value.
    ///
    /// This operation walks the whole table, and is therefore far more expensive than
    /// [`HashMap::contains_key`].
    pub fn contains_value(&self, value: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        self.check_guard(guard);
        for (_, v) in self.iter(guard) {
            if v == value {
                return true;
            }
        }
        false
    }
}

// ===
// the following methods _do_ introduce items into the map, and so must require that the keys and
// values are thread safe, and can be garbage collected at a later time.
// ===

impl<K, V, S> HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Ord,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    /// Inserts a key-value pair into the map.
    ///
    /// If the map did not have this key present, [`None`] is returned.
    ///
    /// If the map did have this key present, the value is updated, and the old value is
    /// returned. The key is left unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// assert_eq!(map.pin().insert(37, "a"), None);
    /// assert_eq!(map.is_empty(), false);
    ///
    /// let mref = map.pin();
    /// mref.insert(37, "b");
    /// assert_eq!(mref.insert(37, "c"), Some(&"b"));
    /// assert_eq!(mref.get(&37), Some(&"c"));
    /// ```
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.check_guard(guard);
        self.put(key, value, false, guard).before()
    }

    /// Inserts a key-value pair into the map unless the key already exists.
    ///
    /// If the map does not contain the key, the pair is inserted and this method returns `Ok`
    /// with the new value. If the map does contain the key, the map is left unchanged and an
    /// error carrying both the current and the rejected value is returned.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::{HashMap, TryInsertError};
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    ///
    /// mref.insert(37, "a");
    /// assert_eq!(
    ///     mref.try_insert(37, "b"),
    ///     Err(TryInsertError { current: &"a", not_inserted: "b" })
    /// );
    /// assert_eq!(mref.try_insert(42, "c"), Ok(&"c"));
    /// ```
    #[inline]
    pub fn try_insert<'g>(
        &'g self,
        key: K,
        value: V,
        guard: &'g Guard,
    ) -> Result<&'g V, TryInsertError<'g, V>> {
        self.check_guard(guard);
        match self.put(key, value, true, guard) {
            PutResult::Exists {
                current,
                not_inserted,
            } => Err(TryInsertError {
                current,
                not_inserted: *not_inserted,
            }),
            PutResult::Inserted { new } => Ok(new),
            PutResult::Replaced { .. } => {
                unreachable!("no-replacement put cannot result in a replacement")
            }
        }
    }

    fn put<'g>(
        &'g self,
        mut key: K,
        value: V,
        no_replacement: bool,
        guard: &'g Guard,
    ) -> PutResult<'g, V> {
        let hash = self.hash(&key);
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut bin_count;
        let value = Owned::new(value).into_shared(guard);
        let mut old_val = None;
        // set when `no_replacement` finds the key present: the rejected value is handed back to
        // the caller instead of being installed
        let mut not_inserted = None;
        loop {
            // safety: see the deref safety argument in `get_node`; it applies to every table
            // and bin deref in the update paths as well
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                table = self.init_table(guard);
                continue;
            }
            let t = unsafe { table.deref() };

            let bini = t.bini(hash);
            let mut bin = t.bin(bini, guard);
            if bin.is_null() {
                // fast path -- bin is empty so stick us at the front
                let node = Owned::new(BinEntry::Node(Node::new(hash, key, value)));
                match t.cas_bin(bini, bin, node, guard) {
                    Ok(_inserted) => {
                        self.add_count(1, Some(0), guard);
                        guard.flush();
                        // safety: the value was not shared before this method and is reachable
                        // from the map now, so it is not retired while the guard is held
                        return PutResult::Inserted {
                            new: unsafe { value.deref() },
                        };
                    }
                    Err(changed) => {
                        assert!(!changed.current.is_null());
                        bin = changed.current;
                        if let BinEntry::Node(node) = *changed.new.into_box() {
                            key = node.key;
                        } else {
                            unreachable!("we declared node and it is a BinEntry::Node");
                        }
                    }
                }
            }

            // slow path -- bin is non-empty
            if no_replacement {
                // preliminary lock-free scan: if the key is already mapped to a committed
                // value, we are done without taking any lock. since we never inserted the new
                // value, we still own it.
                // safety: as in `get_node`
                let found = t.find(unsafe { bin.deref() }, hash, &key, guard);
                if !found.is_null() {
                    // safety: as in `get_node`
                    let node = match *unsafe { found.deref() } {
                        BinEntry::Node(ref n) => n,
                        BinEntry::TreeNode(ref tn) => &tn.node,
                        _ => unreachable!("`Table::find` should always return a node"),
                    };
                    let v = node.value.load(Ordering::SeqCst, guard);
                    if !v.is_null() {
                        return PutResult::Exists {
                            // safety: the value is present and the guard was held the whole
                            // time, so it is retired no earlier than the next epoch
                            current: unsafe { v.deref() },
                            not_inserted: unsafe { value.into_owned().into_box() },
                        };
                    }
                }
            }
            // safety: as in `get_node`
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    // the bin has been transferred; continue against the newer table
                    table = Shared::from(next_table);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    // bin is non-empty, so we need to link into it, which means taking its lock
                    let head_lock = match head.try_lock() {
                        Some(lock) => lock,
                        None => {
                            head.await_lock(bin, t, bini, guard);
                            continue;
                        }
                    };

                    // need to check that this is _still_ the head
                    if t.bin(bini, guard) != bin {
                        // nope -- try again from the start
                        continue;
                    }

                    // yes, it is still the head, so we can now "own" the bin.
                    // note that there can still be readers in the bin!
                    bin_count = 1;
                    let mut p = bin;

                    old_val = loop {
                        // safety: we hold the bin lock, so the chain is stable, and it was read
                        // under our guard
                        let n = unsafe { p.deref() }.as_node().expect("list bin");
                        if n.hash() == hash && n.key == key {
                            // the key already exists in the map!
                            let current_value = n.value.load(Ordering::SeqCst, guard);
                            // safety: only lock holders null a linked node's value, and we hold
                            // the lock
                            let current_value = unsafe { current_value.deref() };
                            if no_replacement {
                                // the key is not absent, so don't update.
                                // safety: we own the new value and never shared it
                                not_inserted = Some(unsafe { value.into_owned().into_box() });
                            } else {
                                let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);
                                // safety: any thread with a reference to the old value read it
                                // before the swap and thus pinned an epoch no later than ours;
                                // the value is only freed two epochs later
                                unsafe { guard.defer_destroy(now_garbage) };
                            }
                            break Some(current_value);
                        }

                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            // we're at the end of the bin -- stick the node here!
                            let node = Owned::new(BinEntry::Node(Node::new(hash, key, value)));
                            n.next.store(node, Ordering::SeqCst);
                            break None;
                        }
                        p = next;
                        bin_count += 1;
                    };
                    drop(head_lock);
                }
                BinEntry::Tree(ref tree_bin) => {
                    // bin is a tree; its writer mutex plays the role of the bin-head lock
                    let head_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    // we don't count tree bins, just set this low enough that we don't try to
                    // treeify the bin later
                    bin_count = 2;
                    let p = tree_bin.find_or_put_tree_val(hash, key, value, guard);
                    if p.is_null() {
                        // the key was absent and has been put into the tree
                        drop(head_lock);
                        break;
                    }
                    // safety: the tree was read under our guard and we hold its write lock
                    let tree_node = unsafe { TreeNode::get_tree_node(p) };
                    old_val = {
                        let current_value = tree_node.node.value.load(Ordering::SeqCst, guard);
                        // safety: as for list bins
                        let current_value = unsafe { current_value.deref() };
                        if no_replacement {
                            // safety: we own the new value and never shared it
                            not_inserted = Some(unsafe { value.into_owned().into_box() });
                        } else {
                            let now_garbage =
                                tree_node.node.value.swap(value, Ordering::SeqCst, guard);
                            // safety: as for list bins
                            unsafe { guard.defer_destroy(now_garbage) };
                        }
                        Some(current_value)
                    };
                    drop(head_lock);
                }
                BinEntry::TreeNode(_) => {
                    unreachable!("the head of a bin cannot be a TreeNode")
                }
            }
            debug_assert_ne!(bin_count, 0);
            if bin_count >= TREEIFY_THRESHOLD {
                self.treeify_bin(t, bini, guard);
            }
            if let Some(current) = old_val {
                return match not_inserted.take() {
                    Some(not_inserted) => PutResult::Exists {
                        current,
                        not_inserted,
                    },
                    None => PutResult::Replaced {
                        old: current,
                        // safety: as for the fast path above
                        new: unsafe { value.deref() },
                    },
                };
            }
            break;
        }
        // increment the count, since we only get here on a fresh insert
        debug_assert!(old_val.is_none());
        self.add_count(1, Some(bin_count), guard);
        guard.flush();
        PutResult::Inserted {
            // safety: as for the fast path above
            new: unsafe { value.deref() },
        }
    }

    fn put_all<I: Iterator<Item = (K, V)>>(&self, iter: I, guard: &Guard) {
        for (key, value) in iter {
            self.put(key, value, false, guard);
        }
    }

    /// If the value for the specified `key` is present, attempts to compute a new mapping given
    /// the key and its current mapped value.
    ///
    /// The new mapping is computed by `remapping_function`, which may return `None` to remove
    /// the mapping entirely. The function is invoked exactly once if the key is present, else
    /// not at all, while holding the lock of the key's bin; it must complete quickly, must not
    /// block, and must not access this map (see the note on [`HashMap::compute`]).
    ///
    /// Returns the new value associated with `key`, or `None` if no mapping remains.
    ///
    /// The key may be any borrowed form of the map's key type, but [`Hash`] and [`Ord`] on the
    /// borrowed form *must* match those for the key type.
    pub fn compute_if_present<'g, Q, F>(
        &'g self,
        key: &Q,
        remapping_function: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.check_guard(guard);
        let _scope = ReentrancyScope::enter(self as *const _ as usize);
        let hash = self.hash(key);

        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut remapping_function = Some(remapping_function);
        let mut new_val = None;
        let mut removed_node = false;
        loop {
            if table.is_null() {
                break;
            }
            // safety: as in `get_node`
            let t = unsafe { table.deref() };
            if t.is_empty() {
                break;
            }

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                // fast path -- the bin is empty, so the key is not present
                break;
            }

            // safety: as in `get_node`
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = Shared::from(next_table);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = match head.try_lock() {
                        Some(lock) => lock,
                        None => {
                            head.await_lock(bin, t, bini, guard);
                            continue;
                        }
                    };
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut p = bin;
                    let mut pred: Shared<'_, BinEntry<K, V>> = Shared::null();
                    new_val = loop {
                        // safety: we hold the bin lock
                        let n = unsafe { p.deref() }.as_node().expect("list bin");
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash() == hash && n.key.borrow() == key {
                            let current_value = n.value.load(Ordering::SeqCst, guard);
                            // safety: only lock holders null a linked value; we hold the lock
                            let new_value = remapping_function
                                .take()
                                .expect("the function is only invoked once")(
                                &n.key,
                                unsafe { current_value.deref() },
                            );

                            if let Some(value) = new_value {
                                let value = Owned::new(value).into_shared(guard);
                                let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);
                                // safety: as in `put`
                                unsafe { guard.defer_destroy(now_garbage) };
                                // safety: the new value is now reachable from the map
                                break Some(unsafe { value.deref() });
                            }
                            removed_node = true;
                            // tombstone the value, then unlink the node
                            n.value.store(Shared::null(), Ordering::SeqCst);
                            if !pred.is_null() {
                                // safety: pred is still linked; we hold the lock
                                unsafe { pred.deref() }
                                    .as_node()
                                    .expect("list bin")
                                    .next
                                    .store(next, Ordering::SeqCst);
                            } else {
                                t.store_bin(bini, next);
                            }
                            // safety: the node and its value are unreachable once the bin no
                            // longer links them; concurrent readers pinned an epoch no later
                            // than ours
                            unsafe { guard.defer_destroy(p) };
                            unsafe { guard.defer_destroy(current_value) };
                            break None;
                        }

                        pred = p;
                        if next.is_null() {
                            // the key is not present
                            break None;
                        }
                        p = next;
                    };
                    drop(head_lock);
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    if root.is_null() {
                        // the bin was drained and not yet untreeified; the key is not present
                        break;
                    }
                    new_val = {
                        let p = TreeNode::find_tree_node(root, hash, key, guard);
                        if p.is_null() {
                            None
                        } else {
                            // safety: read under our guard while holding the write lock
                            let n = &unsafe { TreeNode::get_tree_node(p) }.node;
                            let current_value = n.value.load(Ordering::SeqCst, guard);
                            // safety: present values are not retired while the guard is held
                            let new_value = remapping_function
                                .take()
                                .expect("the function is only invoked once")(
                                &n.key,
                                unsafe { current_value.deref() },
                            );

                            if let Some(value) = new_value {
                                let value = Owned::new(value).into_shared(guard);
                                let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);
                                // safety: as in `put`
                                unsafe { guard.defer_destroy(now_garbage) };
                                // safety: now reachable from the map
                                Some(unsafe { value.deref() })
                            } else {
                                removed_node = true;
                                // safety: we hold the bin's write lock, p was found in this
                                // bin, and we hand it (and its value) to the collector exactly
                                // once, here or below
                                let need_to_untreeify =
                                    unsafe { tree_bin.remove_tree_node(p, true, guard) };
                                if need_to_untreeify {
                                    let linear_bin = Self::untreeify(
                                        tree_bin.first.load(Ordering::SeqCst, guard),
                                        guard,
                                    );
                                    t.store_bin(bini, linear_bin);
                                    // the old bin is garbage, but its values live on in the
                                    // linear bin
                                    // safety: the tree bin was just replaced and is no longer
                                    // reachable; `p` was unlinked from the first chain before
                                    // the replacement, so the untreeified bin does not contain
                                    // it and we still own it here
                                    unsafe {
                                        TreeBin::defer_drop_without_values(bin, guard);
                                        guard.defer_destroy(p);
                                        guard.defer_destroy(current_value);
                                    }
                                }
                                None
                            }
                        }
                    };
                    drop(bin_lock);
                }
                BinEntry::TreeNode(_) => {
                    unreachable!("the head of a bin cannot be a TreeNode")
                }
            }
            break;
        }
        if removed_node {
            self.add_count(-1, None, guard);
        }
        guard.flush();
        new_val
    }

    /// Attempts to compute a mapping for the specified key and its current value, or `None` if
    /// the key is absent.
    ///
    /// If the function returns `Some(v)`, the mapping is created or updated to `v`; if it
    /// returns `None`, the mapping is removed (or stays absent). The function is invoked
    /// exactly once, while holding the lock of the key's bin.
    ///
    /// The function must complete quickly, must not block, and must not access this map: a
    /// lookup would deadlock on the held bin lock, and re-entering the compute family of the
    /// same map panics with an illegal-state error.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.compute("poneyland", |_, v| match v {
    ///     Some(&n) => Some(n + 1),
    ///     None => Some(0),
    /// });
    /// assert_eq!(mref.get("poneyland"), Some(&0));
    /// ```
    pub fn compute<'g, F>(
        &'g self,
        mut key: K,
        remapping_function: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        self.check_guard(guard);
        let _scope = ReentrancyScope::enter(self as *const _ as usize);
        let hash = self.hash(&key);

        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut remapping_function = Some(remapping_function);
        let mut delta = 0;
        let mut bin_count = 0;
        let new_val;
        loop {
            // safety: as in `get_node`
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                table = self.init_table(guard);
                continue;
            }
            let t = unsafe { table.deref() };

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                // reserve the bin while the function runs: a locked placeholder with a null
                // value, which concurrent readers treat as absent
                let node = Owned::new(BinEntry::Node(Node::reserved(hash, key)));
                match t.cas_bin(bini, Shared::null(), node, guard) {
                    Ok(reserved) => {
                        // safety: we just inserted the reservation and hold its (pre-set) lock
                        let head = unsafe { reserved.deref() }.as_node().expect("reservation");
                        // safety: the node was created with the locked bit set by us
                        let head_lock = unsafe { HeadLock::assume(&head.hash) };
                        let mut reservation = Reservation {
                            table: t,
                            bini,
                            node: reserved,
                            guard,
                            armed: true,
                        };
                        let value = remapping_function
                            .take()
                            .expect("the function is only invoked once")(
                            &head.key, None
                        );
                        new_val = match value {
                            Some(value) => {
                                let value = Owned::new(value).into_shared(guard);
                                head.value.store(value, Ordering::SeqCst);
                                reservation.defuse();
                                delta = 1;
                                // safety: now reachable from the map
                                Some(unsafe { value.deref() })
                            }
                            None => {
                                // dropping the armed reservation empties the bin again
                                drop(reservation);
                                None
                            }
                        };
                        drop(head_lock);
                        break;
                    }
                    Err(changed) => {
                        assert!(!changed.current.is_null());
                        if let BinEntry::Node(node) = *changed.new.into_box() {
                            key = node.into_key();
                        } else {
                            unreachable!("we declared node and it is a BinEntry::Node");
                        }
                        continue;
                    }
                }
            }

            // safety: as in `get_node`
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = Shared::from(next_table);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = match head.try_lock() {
                        Some(lock) => lock,
                        None => {
                            head.await_lock(bin, t, bini, guard);
                            continue;
                        }
                    };
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    bin_count = 1;
                    let mut p = bin;
                    let mut pred: Shared<'_, BinEntry<K, V>> = Shared::null();
                    new_val = loop {
                        // safety: we hold the bin lock
                        let n = unsafe { p.deref() }.as_node().expect("list bin");
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash() == hash && n.key == key {
                            let current_value = n.value.load(Ordering::SeqCst, guard);
                            // safety: only lock holders null a linked value; we hold the lock
                            let new_value = remapping_function
                                .take()
                                .expect("the function is only invoked once")(
                                &n.key,
                                Some(unsafe { current_value.deref() }),
                            );
                            if let Some(value) = new_value {
                                let value = Owned::new(value).into_shared(guard);
                                let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);
                                // safety: as in `put`
                                unsafe { guard.defer_destroy(now_garbage) };
                                // safety: now reachable from the map
                                break Some(unsafe { value.deref() });
                            }
                            delta = -1;
                            n.value.store(Shared::null(), Ordering::SeqCst);
                            if !pred.is_null() {
                                // safety: pred is still linked; we hold the lock
                                unsafe { pred.deref() }
                                    .as_node()
                                    .expect("list bin")
                                    .next
                                    .store(next, Ordering::SeqCst);
                            } else {
                                t.store_bin(bini, next);
                            }
                            // safety: as in `compute_if_present`
                            unsafe { guard.defer_destroy(p) };
                            unsafe { guard.defer_destroy(current_value) };
                            break None;
                        }

                        pred = p;
                        if next.is_null() {
                            // the key is absent; consult the function
                            let value = remapping_function
                                .take()
                                .expect("the function is only invoked once")(
                                &key, None
                            );
                            match value {
                                Some(value) => {
                                    let value = Owned::new(value).into_shared(guard);
                                    let node = Owned::new(BinEntry::Node(Node::new(
                                        hash,
                                        key.clone(),
                                        value,
                                    )));
                                    n.next.store(node, Ordering::SeqCst);
                                    delta = 1;
                                    bin_count += 1;
                                    // safety: now reachable from the map
                                    break Some(unsafe { value.deref() });
                                }
                                None => break None,
                            }
                        }
                        p = next;
                        bin_count += 1;
                    };
                    drop(head_lock);
                    if delta > 0 && bin_count >= TREEIFY_THRESHOLD {
                        self.treeify_bin(t, bini, guard);
                    }
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    bin_count = 2;
                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let p = if root.is_null() {
                        Shared::null()
                    } else {
                        TreeNode::find_tree_node(root, hash, &key, guard)
                    };
                    if p.is_null() {
                        // absent; consult the function and insert on Some
                        let value = remapping_function
                            .take()
                            .expect("the function is only invoked once")(
                            &key, None
                        );
                        new_val = match value {
                            Some(value) => {
                                let value = Owned::new(value).into_shared(guard);
                                let inserted =
                                    tree_bin.find_or_put_tree_val(hash, key.clone(), value, guard);
                                assert!(inserted.is_null(), "the key was just absent");
                                delta = 1;
                                // safety: now reachable from the map
                                Some(unsafe { value.deref() })
                            }
                            None => None,
                        };
                    } else {
                        // safety: read under our guard while holding the write lock
                        let n = &unsafe { TreeNode::get_tree_node(p) }.node;
                        let current_value = n.value.load(Ordering::SeqCst, guard);
                        let new_value = remapping_function
                            .take()
                            .expect("the function is only invoked once")(
                            &n.key,
                            Some(unsafe { current_value.deref() }),
                        );
                        new_val = if let Some(value) = new_value {
                            let value = Owned::new(value).into_shared(guard);
                            let now_garbage = n.value.swap(value, Ordering::SeqCst, guard);
                            // safety: as in `put`
                            unsafe { guard.defer_destroy(now_garbage) };
                            // safety: now reachable from the map
                            Some(unsafe { value.deref() })
                        } else {
                            delta = -1;
                            // safety: as in `compute_if_present`
                            let need_to_untreeify =
                                unsafe { tree_bin.remove_tree_node(p, true, guard) };
                            if need_to_untreeify {
                                let linear_bin = Self::untreeify(
                                    tree_bin.first.load(Ordering::SeqCst, guard),
                                    guard,
                                );
                                t.store_bin(bini, linear_bin);
                                // safety: as in `compute_if_present`
                                unsafe {
                                    TreeBin::defer_drop_without_values(bin, guard);
                                    guard.defer_destroy(p);
                                    guard.defer_destroy(current_value);
                                }
                            }
                            None
                        };
                    }
                    drop(bin_lock);
                }
                BinEntry::TreeNode(_) => {
                    unreachable!("the head of a bin cannot be a TreeNode")
                }
            }
            break;
        }
        if delta != 0 {
            self.add_count(delta, if delta > 0 { Some(bin_count) } else { None }, guard);
        }
        guard.flush();
        new_val
    }

    /// If the given key is absent, attempts to compute a value for it and enters it into the
    /// map, unless the function returns `None`.
    ///
    /// The function is invoked at most once, while holding the lock of the key's bin (or a
    /// reservation for it, if the bin was empty); see the note on [`HashMap::compute`]. If the
    /// key is already present its current value is returned and the function is not invoked.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// assert_eq!(mref.compute_if_absent(3, |k| Some(k * 2)), Some(&6));
    /// // the key is now present, so the function does not run again
    /// assert_eq!(mref.compute_if_absent(3, |_| Some(0)), Some(&6));
    /// ```
    pub fn compute_if_absent<'g, F>(
        &'g self,
        mut key: K,
        mapping_function: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        F: FnOnce(&K) -> Option<V>,
    {
        self.check_guard(guard);
        let _scope = ReentrancyScope::enter(self as *const _ as usize);
        let hash = self.hash(&key);

        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut mapping_function = Some(mapping_function);
        let new_val;
        let mut bin_count = 0;
        loop {
            // safety: as in `get_node`
            if table.is_null() || unsafe { table.deref() }.is_empty() {
                table = self.init_table(guard);
                continue;
            }
            let t = unsafe { table.deref() };

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                // reserve the bin while the function runs
                let node = Owned::new(BinEntry::Node(Node::reserved(hash, key)));
                match t.cas_bin(bini, Shared::null(), node, guard) {
                    Ok(reserved) => {
                        // safety: we just inserted the reservation and it carries the lock
                        let head = unsafe { reserved.deref() }.as_node().expect("reservation");
                        // safety: the node was created with the locked bit set by us
                        let head_lock = unsafe { HeadLock::assume(&head.hash) };
                        let mut reservation = Reservation {
                            table: t,
                            bini,
                            node: reserved,
                            guard,
                            armed: true,
                        };
                        let value = mapping_function
                            .take()
                            .expect("the function is only invoked once")(
                            &head.key
                        );
                        new_val = match value {
                            Some(value) => {
                                let value = Owned::new(value).into_shared(guard);
                                head.value.store(value, Ordering::SeqCst);
                                reservation.defuse();
                                bin_count = 1;
                                // safety: now reachable from the map
                                Some(unsafe { value.deref() })
                            }
                            None => {
                                // no mapping is recorded and the counter stays untouched
                                drop(reservation);
                                None
                            }
                        };
                        drop(head_lock);
                        if new_val.is_some() {
                            self.add_count(1, Some(bin_count), guard);
                        }
                        guard.flush();
                        return new_val;
                    }
                    Err(changed) => {
                        assert!(!changed.current.is_null());
                        if let BinEntry::Node(node) = *changed.new.into_box() {
                            key = node.into_key();
                        } else {
                            unreachable!("we declared node and it is a BinEntry::Node");
                        }
                        continue;
                    }
                }
            }

            // lock-free prescan: if the key is already present with a committed value, return
            // it without locking
            // safety: as in `get_node`
            let found = t.find(unsafe { bin.deref() }, hash, &key, guard);
            if !found.is_null() {
                // safety: as in `get_node`
                let node = match *unsafe { found.deref() } {
                    BinEntry::Node(ref n) => n,
                    BinEntry::TreeNode(ref tn) => &tn.node,
                    _ => unreachable!("`Table::find` should always return a node"),
                };
                let v = node.value.load(Ordering::SeqCst, guard);
                if !v.is_null() {
                    // safety: present values are not retired while the guard is held
                    return Some(unsafe { v.deref() });
                }
                // a reservation for this key is mid-flight; fall through and contend for the
                // bin lock, which resolves once the reservation commits or clears
            }

            // safety: as in `get_node`
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = Shared::from(next_table);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = match head.try_lock() {
                        Some(lock) => lock,
                        None => {
                            head.await_lock(bin, t, bini, guard);
                            continue;
                        }
                    };
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    bin_count = 1;
                    let mut p = bin;
                    new_val = loop {
                        // safety: we hold the bin lock
                        let n = unsafe { p.deref() }.as_node().expect("list bin");
                        if n.hash() == hash && n.key == key {
                            let current_value = n.value.load(Ordering::SeqCst, guard);
                            // safety: only lock holders null a linked value; we hold the lock
                            break Some(unsafe { current_value.deref() });
                        }
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            // the key is absent; consult the function
                            let value = mapping_function
                                .take()
                                .expect("the function is only invoked once")(
                                &key
                            );
                            match value {
                                Some(value) => {
                                    let value = Owned::new(value).into_shared(guard);
                                    let node = Owned::new(BinEntry::Node(Node::new(
                                        hash,
                                        key.clone(),
                                        value,
                                    )));
                                    n.next.store(node, Ordering::SeqCst);
                                    bin_count += 1;
                                    // safety: now reachable from the map
                                    break Some(unsafe { value.deref() });
                                }
                                None => break None,
                            }
                        }
                        p = next;
                        bin_count += 1;
                    };
                    // the function having run means the key was absent, so a `Some` result was
                    // freshly inserted
                    let invoked = mapping_function.is_none();
                    drop(head_lock);
                    if invoked {
                        if new_val.is_some() {
                            if bin_count >= TREEIFY_THRESHOLD {
                                self.treeify_bin(t, bini, guard);
                            }
                            self.add_count(1, Some(bin_count), guard);
                        }
                        guard.flush();
                    }
                    return new_val;
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let p = if root.is_null() {
                        Shared::null()
                    } else {
                        TreeNode::find_tree_node(root, hash, &key, guard)
                    };
                    new_val = if !p.is_null() {
                        // safety: read under our guard while holding the write lock
                        let n = &unsafe { TreeNode::get_tree_node(p) }.node;
                        let v = n.value.load(Ordering::SeqCst, guard);
                        // safety: as for list bins
                        Some(unsafe { v.deref() })
                    } else {
                        let value = mapping_function
                            .take()
                            .expect("the function is only invoked once")(
                            &key
                        );
                        match value {
                            Some(value) => {
                                let value = Owned::new(value).into_shared(guard);
                                let inserted =
                                    tree_bin.find_or_put_tree_val(hash, key.clone(), value, guard);
                                assert!(inserted.is_null(), "the key was just absent");
                                // safety: now reachable from the map
                                Some(unsafe { value.deref() })
                            }
                            None => None,
                        }
                    };
                    let invoked = mapping_function.is_none();
                    drop(bin_lock);
                    if invoked {
                        if new_val.is_some() {
                            self.add_count(1, Some(2), guard);
                        }
                        guard.flush();
                    }
                    return new_val;
                }
                BinEntry::TreeNode(_) => {
                    unreachable!("the head of a bin cannot be a TreeNode")
                }
            }
        }
    }

    /// If the key is absent, associates it with the given value; otherwise replaces the current
    /// value with the result of `remapping_function(current, value)`, or removes the mapping if
    /// the function returns `None`.
    ///
    /// The function is invoked at most once, while holding the lock of the key's bin; see the
    /// note on [`HashMap::compute`].
    ///
    /// Returns the value now associated with the key, or `None` if the mapping was removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.merge("stripes", 1, |old, new| Some(old + new));
    /// mref.merge("stripes", 2, |old, new| Some(old + new));
    /// assert_eq!(mref.get("stripes"), Some(&3));
    /// ```
    pub fn merge<'g, F>(
        &'g self,
        key: K,
        value: V,
        remapping_function: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        F: FnOnce(&V, V) -> Option<V>,
    {
        self.check_guard(guard);
        let mut value = Some(value);
        let mut remapping_function = Some(remapping_function);
        // re-expressed through compute: on a miss the original value goes in, on a hit the
        // remapping function decides
        self.compute(
            key,
            |_, current| match current {
                None => Some(value.take().expect("the value is only consumed once")),
                Some(current) => remapping_function
                    .take()
                    .expect("the function is only invoked once")(
                    current,
                    value.take().expect("the value is only consumed once"),
                ),
            },
            guard,
        )
    }

    /// Removes a key-value pair from the map, and returns the removed value (if any).
    ///
    /// The key may be any borrowed form of the map's key type, but [`Hash`] and [`Ord`] on the
    /// borrowed form *must* match those for the key type.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// map.pin().insert(1, "a");
    /// assert_eq!(map.pin().remove(&1), Some(&"a"));
    /// assert_eq!(map.pin().remove(&1), None);
    /// ```
    pub fn remove<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.replace_node(key, None, |_| true, guard).map(|(_, v)| v)
    }

    /// Removes a key from the map, returning the stored key and value if the key was previously
    /// in the map.
    ///
    /// The key may be any borrowed form of the map's key type, but [`Hash`] and [`Ord`] on the
    /// borrowed form *must* match those for the key type.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// let guard = map.guard();
    /// map.insert(1, "a", &guard);
    /// assert_eq!(map.remove_entry(&1, &guard), Some((&1, &"a")));
    /// assert_eq!(map.remove(&1, &guard), None);
    /// ```
    pub fn remove_entry<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.replace_node(key, None, |_| true, guard)
    }

    /// Removes the entry for the given key only if it is currently mapped to `expected`.
    ///
    /// Returns `true` if the entry was removed.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.insert(1, "a");
    /// assert!(!mref.remove_value(&1, &"b"));
    /// assert!(mref.remove_value(&1, &"a"));
    /// assert_eq!(mref.get(&1), None);
    /// ```
    pub fn remove_value<'g, Q>(&'g self, key: &Q, expected: &V, guard: &'g Guard) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        V: PartialEq,
    {
        self.check_guard(guard);
        self.replace_node(
            key,
            None,
            // safety: the compared value was read under the guard in `replace_node` and is not
            // retired while the guard is held
            |current| unsafe { current.deref() } == expected,
            guard,
        )
        .is_some()
    }

    /// Replaces the value of the given key only if it is currently mapped to some value.
    ///
    /// Returns the previous value on success, and `None` if the key was absent (in which case
    /// the map is unchanged).
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// assert_eq!(mref.replace(&1, "a"), None);
    /// assert_eq!(mref.get(&1), None);
    /// mref.insert(1, "a");
    /// assert_eq!(mref.replace(&1, "b"), Some(&"a"));
    /// assert_eq!(mref.get(&1), Some(&"b"));
    /// ```
    pub fn replace<'g, Q>(&'g self, key: &Q, value: V, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.check_guard(guard);
        self.replace_node(key, Some(value), |_| true, guard)
            .map(|(_, v)| v)
    }

    /// Replaces the value of the given key only if it is currently mapped to `expected`.
    ///
    /// Values are compared with the value type's equality relation. Returns `true` if the value
    /// was replaced.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    /// let mref = map.pin();
    /// mref.insert(1, "a");
    /// assert!(!mref.replace_value(&1, &"x", "b"));
    /// assert!(mref.replace_value(&1, &"a", "b"));
    /// assert_eq!(mref.get(&1), Some(&"b"));
    /// ```
    pub fn replace_value<'g, Q>(
        &'g self,
        key: &Q,
        expected: &V,
        value: V,
        guard: &'g Guard,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        V: PartialEq,
    {
        self.check_guard(guard);
        self.replace_node(
            key,
            Some(value),
            // safety: as in `remove_value`
            |current| unsafe { current.deref() } == expected,
            guard,
        )
        .is_some()
    }

    /// Replaces or removes the node for the given key, provided the `observed` predicate
    /// approves of its current value.
    ///
    /// If `new_value` is `None` the entry is removed; otherwise its value is replaced. Does
    /// nothing if the key is not in the map, or if the predicate rejects the current value.
    /// Returns the previous key and value if a change was made.
    fn replace_node<'g, Q, F>(
        &'g self,
        key: &Q,
        mut new_value: Option<V>,
        observed: F,
        guard: &'g Guard,
    ) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: Fn(Shared<'g, V>) -> bool,
    {
        let hash = self.hash(key);

        let is_remove = new_value.is_none();
        let mut old_val = None;
        let mut table = self.table.load(Ordering::SeqCst, guard);
        loop {
            if table.is_null() {
                break;
            }
            // safety: as in `get_node`
            let t = unsafe { table.deref() };
            if t.is_empty() {
                break;
            }
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                break;
            }

            // safety: as in `get_node`
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = Shared::from(next_table);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = match head.try_lock() {
                        Some(lock) => lock,
                        None => {
                            head.await_lock(bin, t, bini, guard);
                            continue;
                        }
                    };
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let mut e = bin;
                    let mut pred: Shared<'_, BinEntry<K, V>> = Shared::null();
                    loop {
                        // safety: we hold the bin lock, and the chain was read under our guard
                        let n = unsafe { e.deref() }.as_node().expect("list bin");
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if n.hash() == hash && n.key.borrow() == key {
                            let ev = n.value.load(Ordering::SeqCst, guard);

                            // only replace the node if the current value passes inspection
                            if observed(ev) {
                                // safety: the value is present and our guard pins its epoch
                                old_val = Some((&n.key, ev));

                                if let Some(nv) = new_value.take() {
                                    n.value.store(Owned::new(nv), Ordering::SeqCst);
                                    break;
                                }
                                // tombstone the value, then unlink the node
                                n.value.store(Shared::null(), Ordering::SeqCst);
                                if !pred.is_null() {
                                    // safety: pred is still linked; we hold the lock
                                    unsafe { pred.deref() }
                                        .as_node()
                                        .expect("list bin")
                                        .next
                                        .store(next, Ordering::SeqCst);
                                } else {
                                    t.store_bin(bini, next);
                                }
                                // safety: the node is no longer reachable from the bin
                                unsafe { guard.defer_destroy(e) };
                            }
                            // one node per key, so we can stop here either way
                            break;
                        }
                        pred = e;
                        if next.is_null() {
                            break;
                        }
                        e = next;
                    }
                    drop(head_lock);
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    if root.is_null() {
                        // the bin was drained but not yet untreeified; nothing to replace
                        break;
                    }
                    let p = TreeNode::find_tree_node(root, hash, key, guard);
                    if p.is_null() {
                        break;
                    }
                    // safety: read under our guard while holding the write lock
                    let n = &unsafe { TreeNode::get_tree_node(p) }.node;
                    let pv = n.value.load(Ordering::SeqCst, guard);

                    if observed(pv) {
                        // safety: as for list bins
                        old_val = Some((&n.key, pv));

                        if let Some(nv) = new_value.take() {
                            n.value.store(Owned::new(nv), Ordering::SeqCst);
                        } else {
                            // drop `p` but not its value, which is retired below through
                            // `old_val`
                            // safety: we hold the write lock and hand `p` to the collector
                            // exactly once
                            let need_to_untreeify =
                                unsafe { tree_bin.remove_tree_node(p, false, guard) };
                            if need_to_untreeify {
                                let linear_bin = Self::untreeify(
                                    tree_bin.first.load(Ordering::SeqCst, guard),
                                    guard,
                                );
                                t.store_bin(bini, linear_bin);
                                // safety: as in `compute_if_present`
                                unsafe {
                                    TreeBin::defer_drop_without_values(bin, guard);
                                    guard.defer_destroy(p);
                                }
                            }
                        }
                    }
                    drop(bin_lock);
                }
                BinEntry::TreeNode(_) => {
                    unreachable!("the head of a bin cannot be a TreeNode")
                }
            }
            if let Some((key, val)) = old_val {
                if is_remove {
                    self.add_count(-1, None, guard);
                    // safety: the old value is unreachable now that the node is gone; threads
                    // with an existing reference pinned an epoch no later than ours
                    unsafe { guard.defer_destroy(val) };
                } else {
                    // safety: as above; the node lives on, but the old value was swapped out
                    unsafe { guard.defer_destroy(val) };
                }
                guard.flush();

                // safety: the reference lives no longer than the guard, and destruction was
                // deferred past it
                return unsafe { val.as_ref() }.map(move |v| (key, v));
            }
            break;
        }
        None
    }

    /// Retains only the elements specified by the predicate.
    ///
    /// In other words, removes all pairs `(k, v)` for which `f(&k, &v)` returns `false`.
    ///
    /// If `f` returns `false` for a pair whose value is concurrently replaced before the
    /// removal takes place, the entry is left in place. Use [`HashMap::retain_force`] to remove
    /// it regardless.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// for i in 0..8 {
    ///     map.pin().insert(i, i * 10);
    /// }
    /// map.pin().retain(|&k, _| k % 2 == 0);
    /// assert_eq!(map.len(), 4);
    /// ```
    pub fn retain<F>(&self, mut f: F, guard: &Guard)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.check_guard(guard);
        for (k, v) in self.iter(guard) {
            if !f(k, v) {
                let old_value: Shared<'_, V> = Shared::from(v as *const V);
                self.replace_node(k, None, |current| current == old_value, guard);
            }
        }
    }

    /// Retains only the elements specified by the predicate, removing a rejected pair even if
    /// its value has been concurrently replaced since the predicate saw it.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map = HashMap::new();
    ///
    /// for i in 0..8 {
    ///     map.pin().insert(i, i * 10);
    /// }
    /// map.pin().retain_force(|&k, _| k % 2 == 0);
    /// assert_eq!(map.len(), 4);
    /// ```
    pub fn retain_force<F>(&self, mut f: F, guard: &Guard)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.check_guard(guard);
        for (k, v) in self.iter(guard) {
            if !f(k, v) {
                self.replace_node(k, None, |_| true, guard);
            }
        }
    }

    /// Tries to reserve capacity for at least `additional` more elements.
    ///
    /// The collection may reserve more space to avoid frequent reallocations. Reserving does
    /// not panic; if the new size is invalid, no reallocation takes place.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map: HashMap<&str, i32> = HashMap::new();
    /// map.pin().reserve(10);
    /// ```
    pub fn reserve(&self, additional: usize, guard: &Guard) {
        self.check_guard(guard);
        let absolute = self.len() + additional;
        self.try_presize(absolute, guard);
    }
}

impl<K, V, S> PartialEq for HashMap<K, V, S>
where
    K: Hash + Ord,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        self.guarded_eq(other, &self.guard(), &other.guard())
    }
}

impl<K, V, S> Eq for HashMap<K, V, S>
where
    K: Hash + Ord,
    V: Eq,
    S: BuildHasher,
{
}

impl<K, V, S> fmt::Debug for HashMap<K, V, S>
where
    K: Debug,
    V: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.collector.register().pin();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> Drop for HashMap<K, V, S> {
    fn drop(&mut self) {
        // safety: we have &mut self, and all references we have handed out are bound to the
        // lifetime of their borrow of self, so there are no outstanding references into the map
        let guard = unsafe { epoch::unprotected() };

        let table = self.table.swap(Shared::null(), Ordering::SeqCst, guard);
        if table.is_null() {
            // the table was never allocated
            return;
        }

        // safety: as above, and we own the table
        let mut table = unsafe { table.into_owned() }.into_box();
        table.drop_bins();
    }
}

impl<K, V, S> Extend<(K, V)> for &HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Ord,
    V: 'static + Sync + Send,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        // keys may already be present or show up multiple times in the iterator, so reserve
        // the full hint only when the map is empty, and half of it (rounded up) otherwise;
        // this way the map resizes at most twice in the worst case
        let iter = iter.into_iter();
        let reserve = if self.is_empty() {
            iter.size_hint().0
        } else {
            (iter.size_hint().0 + 1) / 2
        };

        let guard = self.collector.register().pin();
        self.reserve(reserve, &guard);
        (*self).put_all(iter, &guard);
    }
}

impl<'a, K, V, S> Extend<(&'a K, &'a V)> for &HashMap<K, V, S>
where
    K: 'static + Sync + Send + Copy + Hash + Ord,
    V: 'static + Sync + Send + Copy,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (&'a K, &'a V)>>(&mut self, iter: T) {
        self.extend(iter.into_iter().map(|(&key, &value)| (key, value)));
    }
}

impl<K, V, S> FromIterator<(K, V)> for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Ord,
    V: 'static + Sync + Send,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut iter = iter.into_iter();

        if let Some((key, value)) = iter.next() {
            // safety: we own the map, so it is not concurrently accessed by anyone else yet
            let guard = unsafe { epoch::unprotected() };

            let (lower, _) = iter.size_hint();
            let map = HashMap::with_capacity_and_hasher(lower.saturating_add(1), S::default());

            map.put(key, value, false, guard);
            map.put_all(iter, guard);
            map
        } else {
            Self::default()
        }
    }
}

impl<'a, K, V, S> FromIterator<(&'a K, &'a V)> for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Copy + Hash + Ord,
    V: 'static + Sync + Send + Copy,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (&'a K, &'a V)>>(iter: T) -> Self {
        Self::from_iter(iter.into_iter().map(|(&k, &v)| (k, v)))
    }
}

impl<'a, K, V, S> FromIterator<&'a (K, V)> for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Copy + Hash + Ord,
    V: 'static + Sync + Send + Copy,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = &'a (K, V)>>(iter: T) -> Self {
        Self::from_iter(iter.into_iter().map(|&(k, v)| (k, v)))
    }
}

impl<K, V, S> Clone for HashMap<K, V, S>
where
    K: 'static + Sync + Send + Clone + Hash + Ord,
    V: 'static + Sync + Send + Clone,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> HashMap<K, V, S> {
        let cloned_map = Self::with_capacity_and_hasher(self.len(), self.build_hasher.clone());
        {
            let guard = self.collector.register().pin();
            for (k, v) in self.iter(&guard) {
                cloned_map.insert(k.clone(), v.clone(), &guard);
            }
        }
        cloned_map
    }
}

#[cfg(not(miri))]
#[inline]
/// Returns the number of physical CPUs in the machine (_O(1)_).
pub(crate) fn num_cpus() -> usize {
    NCPU_INITIALIZER.call_once(|| NCPU.store(num_cpus::get_physical(), Ordering::Relaxed));
    NCPU.load(Ordering::Relaxed)
}

#[cfg(miri)]
#[inline]
pub(crate) const fn num_cpus() -> usize {
    1
}

/// The borrow-checker half of the test suite. These are lifetime contracts that hold only if
/// the snippets below *refuse* to build, and a plain `#[test]` cannot assert that. Rustdoc can:
/// every snippet is a `compile_fail` doctest, so the suite goes red the day one of them starts
/// compiling.
///
/// # A reference into the map dies with the map.
///
/// ```compile_fail
/// let guard = crossbeam_epoch::pin();
/// let map = squall::HashMap::default();
/// let r = map.insert(1u8, 2u8, &guard);
/// drop(map);
/// drop(r);
/// ```
/// ```compile_fail
/// let guard = crossbeam_epoch::pin();
/// let map = squall::HashMap::default();
/// let r = map.get(&1u8, &guard);
/// drop(map);
/// drop(r);
/// ```
///
/// # A reference into the map dies with the guard it was read under.
///
/// ```compile_fail
/// let guard = crossbeam_epoch::pin();
/// let map = squall::HashMap::default();
/// let r = map.insert(1u8, 2u8, &guard);
/// drop(guard);
/// drop(r);
/// ```
/// ```compile_fail
/// let guard = crossbeam_epoch::pin();
/// let map = squall::HashMap::default();
/// let r = map.get(&1u8, &guard);
/// drop(guard);
/// drop(r);
/// ```
///
/// # Stored keys and values must own their data.
///
/// Reclamation can be deferred past any stack frame, so borrowed keys or values must be
/// rejected at insertion:
///
/// ```compile_fail
/// let short_lived = String::from("gust");
/// let map: squall::HashMap<_, _> = std::iter::once((&short_lived, &short_lived)).collect();
/// ```
///
/// # Lookup keys may borrow, though.
///
/// ```no_run
/// let short_lived = String::from("gust");
/// let map: squall::HashMap<String, u8> = squall::HashMap::new();
/// map.insert(short_lived.clone(), 1, &map.guard());
/// map.get(&short_lived, &map.guard());
/// ```
#[allow(dead_code)]
struct CompileFailTests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_growth_stages() {
        // the bin array starts out unallocated, appears at the default size on first insert,
        // and doubles as soon as the counter crosses its 3/4 threshold
        let map = HashMap::<u32, &'static str>::new();
        let guard = map.guard();
        assert_eq!(map.capacity(&guard), 0);

        map.insert(0, "seed", &guard);
        let initial = map.capacity(&guard);
        assert_eq!(initial, DEFAULT_CAPACITY);

        let threshold = load_factor!(initial);
        for k in 1..=threshold as u32 {
            map.insert(k, "filler", &guard);
        }
        assert_eq!(map.capacity(&guard), initial * 2);
    }

    #[test]
    fn reserve_grows_an_existing_table() {
        let map = HashMap::<usize, usize>::new();
        let guard = map.guard();
        for i in 0..8 {
            map.insert(i, i, &guard);
        }
        let before = map.capacity(&guard);
        map.reserve(500, &guard);
        // 508 entries at 3/4 density do not fit in 512 bins, so we expect the next power of
        // two beyond that
        let after = map.capacity(&guard);
        assert!(after >= 1024, "capacity only reached {}", after);
        assert!(after >= before);
        for i in 0..8 {
            assert_eq!(map.get(&i, &guard), Some(&i));
        }
    }

    #[test]
    fn reserve_before_first_insert() {
        let map = HashMap::<usize, usize>::new();
        let guard = map.guard();
        map.reserve(100, &guard);
        // 100 entries ask for 151 slots, which rounds up to 256 bins
        assert_eq!(map.capacity(&guard), 256);
        // the pre-sized table is used as-is by the first insert
        map.insert(7, 7, &guard);
        assert_eq!(map.capacity(&guard), 256);
    }

    #[test]
    fn resize_holds_all_entries() {
        let map = HashMap::<usize, usize>::new();
        let guard = map.guard();
        for i in 0..10_000 {
            map.insert(i, i * i, &guard);
        }
        assert_eq!(map.len(), 10_000);
        assert!(map.capacity(&guard) >= 16_384);
        for i in 0..10_000 {
            assert_eq!(map.get(&i, &guard), Some(&(i * i)));
        }
    }

    #[test]
    fn replace_node_on_missing_key_is_a_noop() {
        let map = HashMap::<&'static str, u8>::new();
        let guard = map.guard();
        map.insert("kept", 1, &guard);
        let old = map.replace_node("gone", None, |_| true, &guard);
        assert!(old.is_none());
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("kept", &guard), Some(&1));
    }

    #[test]
    fn replace_node_swaps_value_in_place() {
        let map = HashMap::<&'static str, u8>::new();
        let guard = map.guard();
        map.insert("gauge", 3, &guard);
        let old = map.replace_node("gauge", Some(9), |_| true, &guard);
        assert_eq!(old, Some((&"gauge", &3)));
        assert_eq!(map.get("gauge", &guard), Some(&9));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn replace_node_respects_the_observed_predicate() {
        let map = HashMap::<&'static str, u8>::new();
        let guard = map.guard();
        map.insert("gauge", 3, &guard);
        // a rejecting predicate must leave both the value and the length untouched
        let old = map.replace_node("gauge", Some(9), |_| false, &guard);
        assert!(old.is_none());
        assert_eq!(map.get("gauge", &guard), Some(&3));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn rejected_put_hands_the_value_back() {
        // when a no-replacement put loses, the caller's allocation must come back out in the
        // `Exists` result rather than being installed or dropped on the floor
        let map = HashMap::<u8, String>::new();
        let guard = map.guard();
        map.insert(7, String::from("first"), &guard);
        assert_eq!(
            map.put(7, String::from("second"), true, &guard),
            PutResult::Exists {
                current: &String::from("first"),
                not_inserted: Box::new(String::from("second")),
            }
        );
        assert_eq!(map.get(&7, &guard), Some(&String::from("first")));
    }

    #[test]
    #[should_panic]
    fn compute_reentrancy_fails_loudly() {
        let map = std::sync::Arc::new(HashMap::<usize, usize>::new());
        let guard = map.guard();
        let inner = std::sync::Arc::clone(&map);
        map.compute(
            1,
            |_, _| {
                let guard = inner.guard();
                inner.compute(2, |_, _| Some(0), &guard).copied()
            },
            &guard,
        );
    }

    #[cfg(test)]
    mod tree_bins {
        use super::*;

        // tests for the tree bin optimization: that bins are actually treeified and
        // untreeified, and that values survive untreeification

        #[derive(Default)]
        struct ZeroHasher;
        struct ZeroHashBuilder;
        impl Hasher for ZeroHasher {
            fn finish(&self) -> u64 {
                0
            }
            fn write(&mut self, _: &[u8]) {}
        }
        impl BuildHasher for ZeroHashBuilder {
            type Hasher = ZeroHasher;
            fn build_hasher(&self) -> ZeroHasher {
                ZeroHasher
            }
        }

        fn assert_tree_bin(map: &HashMap<usize, usize, ZeroHashBuilder>, expect_tree: bool) {
            let guard = map.guard();
            let t = map.table.load(Ordering::Relaxed, &guard);
            let t = unsafe { t.deref() };
            let bini = t.bini(0);
            let bin = t.bin(bini, &guard);
            match (unsafe { bin.deref() }, expect_tree) {
                (BinEntry::Tree(_), true) | (BinEntry::Node(_), false) => {}
                (entry, _) => panic!(
                    "expected {} bin, got {:?}",
                    if expect_tree { "tree" } else { "list" },
                    std::mem::discriminant(entry)
                ),
            }
        }

        #[test]
        fn treeify_on_collisions() {
            let map = HashMap::<usize, usize, _>::with_hasher(ZeroHashBuilder);
            let guard = map.guard();
            // collide every key into one bin; pushing past the threshold must treeify it
            const N: usize = 12;
            for key in 0..N {
                map.insert(key, key + 1000, &guard);
            }
            assert_tree_bin(&map, true);
            for key in 0..N {
                assert_eq!(map.get(&key, &guard), Some(&(key + 1000)));
            }
            assert_eq!(map.len(), N);
        }

        #[test]
        fn shrinking_tree_reverts_to_list_on_remove() {
            drain_tree_down_to_a_list(|key, map, guard| {
                assert_eq!(map.remove(&key, guard), Some(&(key * 7)));
            });
        }

        #[test]
        fn shrinking_tree_reverts_to_list_on_compute_removal() {
            drain_tree_down_to_a_list(|key, map, guard| {
                assert_eq!(map.compute_if_present(&key, |_, _| None, guard), None);
            });
        }

        /// Grows one colliding bin into a tree, drains it through `remove_one` until only a
        /// few survivors remain, and checks that the bin reverted to a list without losing the
        /// survivors' values.
        fn drain_tree_down_to_a_list<F>(remove_one: F)
        where
            F: Fn(usize, &HashMap<usize, usize, ZeroHashBuilder>, &Guard),
        {
            const TOTAL: usize = 14;
            const SURVIVORS: usize = 3;

            let map = HashMap::<usize, usize, _>::with_hasher(ZeroHashBuilder);
            {
                let guard = map.guard();
                for key in 0..TOTAL {
                    map.insert(key, key * 7, &guard);
                }
                assert_tree_bin(&map, true);

                for key in SURVIVORS..TOTAL {
                    remove_one(key, &map, &guard);
                }
                guard.flush();
            }
            assert_eq!(map.len(), SURVIVORS);
            assert_tree_bin(&map, false);

            // cycle a few guards so deferred collection gets a chance to run before we read
            for _ in 0..4 {
                drop(map.guard());
            }

            let guard = map.guard();
            for key in 0..SURVIVORS {
                assert_eq!(map.get(&key, &guard), Some(&(key * 7)));
            }
        }

        #[test]
        fn compute_family_works_inside_a_tree_bin() {
            let map = HashMap::<usize, usize, _>::with_hasher(ZeroHashBuilder);
            let guard = map.guard();
            for key in 0..12 {
                map.insert(key, key * 2, &guard);
            }
            assert_tree_bin(&map, true);
            // update an entry that lives in the tree
            assert_eq!(map.compute(5, |_, v| v.map(|v| v + 3), &guard), Some(&13));
            // materialize a brand-new key straight into the tree
            assert_eq!(map.compute_if_absent(77, |k| Some(*k), &guard), Some(&77));
            assert_eq!(map.get(&77, &guard), Some(&77));
            // and fold a value into an existing one
            assert_eq!(map.merge(5, 7, |old, new| Some(old + new), &guard), Some(&20));
        }
    }

    #[test]
    #[should_panic]
    fn foreign_collector_guards_are_rejected() {
        // a guard pinned against an unrelated collector does nothing to hold this map's
        // epoch back, so a reference handed out under it could be freed while still in use.
        // the guard-association check has to refuse such a guard before any lookup happens.
        let map: HashMap<u8, u8> = HashMap::default();
        map.pin().insert(1, 1);

        let foreign = crossbeam_epoch::Collector::new();
        let handle = foreign.register();
        let bad_guard = handle.pin();
        let _ = map.get(&1, &bad_guard);
    }
}
