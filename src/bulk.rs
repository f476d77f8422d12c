//! Parallel bulk operations: `for_each`, `search`, and `reduce` over entries, keys, and values.
//!
//! The operations fan out by recursively splitting a [`Cursor`] over the table's bins and
//! handing the halves to [`rayon::join`], down to a granularity of roughly eight leaves per
//! CPU. Each leaf pins its own guard from the map's collector and walks its share of the bins
//! sequentially; results are combined on the way back up the join tree. The root call's guard
//! keeps the table it captured alive until every leaf has finished, since `join` only returns
//! once both halves complete.
//!
//! Visit order is unspecified, and the traversal is weakly consistent: entries inserted while a
//! bulk operation runs may or may not be visited, and no entry is visited twice.

use crate::iter::Cursor;
use crate::HashMap;
use crossbeam_epoch::Guard;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// How many base bins a single leaf processes: the range is split until roughly
/// `num_cpus × 8` leaves exist.
fn leaf_stride(len: usize) -> usize {
    let leaves = crate::map::num_cpus() * 8;
    std::cmp::max(1, len / std::cmp::max(1, leaves))
}

impl<K, V, S> HashMap<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
{
    /// Applies `action` to every live entry, in parallel.
    ///
    /// Runs on the ambient [rayon] pool; call from inside `rayon::ThreadPool::install` to use
    /// a dedicated pool.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let map: HashMap<usize, usize> = (0..100).map(|i| (i, i)).collect();
    /// let sum = AtomicUsize::new(0);
    /// map.par_for_each(|_, v| { sum.fetch_add(*v, Ordering::Relaxed); }, &map.guard());
    /// assert_eq!(sum.into_inner(), (0..100).sum());
    /// ```
    pub fn par_for_each<F>(&self, action: F, guard: &Guard)
    where
        F: Fn(&K, &V) + Sync,
    {
        self.check_guard(guard);
        let cursor = Cursor::new(self.table.load(Ordering::SeqCst, guard));
        let stride = leaf_stride(cursor.len());
        for_each_recurse(self, cursor, stride, &action);
    }

    /// Applies `action` to every key, in parallel.
    pub fn par_for_each_key<F>(&self, action: F, guard: &Guard)
    where
        F: Fn(&K) + Sync,
    {
        self.par_for_each(|k, _| action(k), guard);
    }

    /// Applies `action` to every value, in parallel.
    pub fn par_for_each_value<F>(&self, action: F, guard: &Guard)
    where
        F: Fn(&V) + Sync,
    {
        self.par_for_each(|_, v| action(v), guard);
    }

    /// Searches the entries in parallel and returns the first non-`None` result produced by
    /// `search`.
    ///
    /// Once any task produces a result the search stops globally; leaves that are already
    /// running finish their current entry and bail out. Which result is returned when several
    /// entries match is unspecified.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map: HashMap<usize, usize> = (0..100).map(|i| (i, i * 2)).collect();
    /// let found = map.par_search(
    ///     |_, v| if *v == 64 { Some(*v) } else { None },
    ///     &map.guard(),
    /// );
    /// assert_eq!(found, Some(64));
    /// ```
    pub fn par_search<F, R>(&self, search: F, guard: &Guard) -> Option<R>
    where
        F: Fn(&K, &V) -> Option<R> + Sync,
        R: Send,
    {
        self.check_guard(guard);
        let cursor = Cursor::new(self.table.load(Ordering::SeqCst, guard));
        let stride = leaf_stride(cursor.len());
        let stop = AtomicBool::new(false);
        let result = Mutex::new(None);
        search_recurse(self, cursor, stride, &search, &stop, &result);
        result.into_inner()
    }

    /// Searches the keys in parallel; see [`HashMap::par_search`].
    pub fn par_search_keys<F, R>(&self, search: F, guard: &Guard) -> Option<R>
    where
        F: Fn(&K) -> Option<R> + Sync,
        R: Send,
    {
        self.par_search(|k, _| search(k), guard)
    }

    /// Searches the values in parallel; see [`HashMap::par_search`].
    pub fn par_search_values<F, R>(&self, search: F, guard: &Guard) -> Option<R>
    where
        F: Fn(&V) -> Option<R> + Sync,
        R: Send,
    {
        self.par_search(|_, v| search(v), guard)
    }

    /// Reduces the entries in parallel: `transform` maps each entry to `Option<T>` (entries
    /// mapped to `None` are skipped), and `combine` merges the transformed values.
    ///
    /// `combine` must be associative and commutative, since the visit and combination order is
    /// unspecified. Returns `None` if no entry produced a value.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map: HashMap<usize, usize> = (1..=100).map(|i| (i, i)).collect();
    /// let sum = map.par_reduce(|_, v| Some(*v), |a, b| a + b, &map.guard());
    /// assert_eq!(sum, Some(5050));
    /// ```
    pub fn par_reduce<F, C, T>(&self, transform: F, combine: C, guard: &Guard) -> Option<T>
    where
        F: Fn(&K, &V) -> Option<T> + Sync,
        C: Fn(T, T) -> T + Sync,
        T: Send,
    {
        self.check_guard(guard);
        let cursor = Cursor::new(self.table.load(Ordering::SeqCst, guard));
        let stride = leaf_stride(cursor.len());
        reduce_recurse(self, cursor, stride, &transform, &combine)
    }

    /// Reduces the keys in parallel; see [`HashMap::par_reduce`].
    pub fn par_reduce_keys<F, C, T>(&self, transform: F, combine: C, guard: &Guard) -> Option<T>
    where
        F: Fn(&K) -> Option<T> + Sync,
        C: Fn(T, T) -> T + Sync,
        T: Send,
    {
        self.par_reduce(|k, _| transform(k), combine, guard)
    }

    /// Reduces the values in parallel; see [`HashMap::par_reduce`].
    pub fn par_reduce_values<F, C, T>(&self, transform: F, combine: C, guard: &Guard) -> Option<T>
    where
        F: Fn(&V) -> Option<T> + Sync,
        C: Fn(T, T) -> T + Sync,
        T: Send,
    {
        self.par_reduce(|_, v| transform(v), combine, guard)
    }

    /// Folds the entries in parallel from an explicit identity: every leaf starts from a clone
    /// of `identity`, maps each of its entries with `transform`, and merges with `combine`.
    ///
    /// This is the explicit-identity counterpart of [`HashMap::par_reduce`], covering sums and
    /// other numeric accumulations. `identity` must be an identity for `combine`, and `combine`
    /// must be associative and commutative.
    ///
    /// # Examples
    ///
    /// ```
    /// use squall::HashMap;
    ///
    /// let map: HashMap<usize, i64> = (0..100).map(|i| (i, i as i64)).collect();
    /// let sum = map.par_fold(0i64, |_, v| *v, |a, b| a + b, &map.guard());
    /// assert_eq!(sum, 4950);
    /// ```
    pub fn par_fold<T, F, C>(&self, identity: T, transform: F, combine: C, guard: &Guard) -> T
    where
        F: Fn(&K, &V) -> T + Sync,
        C: Fn(T, T) -> T + Sync,
        T: Clone + Send + Sync,
    {
        self.check_guard(guard);
        let cursor = Cursor::new(self.table.load(Ordering::SeqCst, guard));
        let stride = leaf_stride(cursor.len());
        fold_recurse(self, cursor, stride, &identity, &transform, &combine)
    }
}

fn for_each_recurse<K, V, S, F>(
    map: &HashMap<K, V, S>,
    mut cursor: Cursor<K, V>,
    stride: usize,
    action: &F,
) where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
    F: Fn(&K, &V) + Sync,
{
    if cursor.len() > stride {
        let upper = cursor.split();
        rayon::join(
            || for_each_recurse(map, cursor, stride, action),
            || for_each_recurse(map, upper, stride, action),
        );
        return;
    }
    let guard = map.collector.register().pin();
    // safety: the root bulk call loaded the table under a guard it holds until every leaf has
    // returned, so the table and the nodes reachable from it stay live
    for (node, value) in unsafe { cursor.into_iter(&guard) } {
        action(&node.key, value);
    }
}

fn search_recurse<K, V, S, F, R>(
    map: &HashMap<K, V, S>,
    mut cursor: Cursor<K, V>,
    stride: usize,
    search: &F,
    stop: &AtomicBool,
    result: &Mutex<Option<R>>,
) where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
    F: Fn(&K, &V) -> Option<R> + Sync,
    R: Send,
{
    if stop.load(Ordering::Relaxed) {
        return;
    }
    if cursor.len() > stride {
        let upper = cursor.split();
        rayon::join(
            || search_recurse(map, cursor, stride, search, stop, result),
            || search_recurse(map, upper, stride, search, stop, result),
        );
        return;
    }
    let guard = map.collector.register().pin();
    // safety: as in `for_each_recurse`
    for (node, value) in unsafe { cursor.into_iter(&guard) } {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        if let Some(r) = search(&node.key, value) {
            stop.store(true, Ordering::Relaxed);
            let mut slot = result.lock();
            if slot.is_none() {
                *slot = Some(r);
            }
            return;
        }
    }
}

fn reduce_recurse<K, V, S, F, C, T>(
    map: &HashMap<K, V, S>,
    mut cursor: Cursor<K, V>,
    stride: usize,
    transform: &F,
    combine: &C,
) -> Option<T>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
    F: Fn(&K, &V) -> Option<T> + Sync,
    C: Fn(T, T) -> T + Sync,
    T: Send,
{
    if cursor.len() > stride {
        let upper = cursor.split();
        let (left, right) = rayon::join(
            || reduce_recurse(map, cursor, stride, transform, combine),
            || reduce_recurse(map, upper, stride, transform, combine),
        );
        return match (left, right) {
            (Some(l), Some(r)) => Some(combine(l, r)),
            (l, None) => l,
            (None, r) => r,
        };
    }
    let guard = map.collector.register().pin();
    let mut acc = None;
    // safety: as in `for_each_recurse`
    for (node, value) in unsafe { cursor.into_iter(&guard) } {
        if let Some(t) = transform(&node.key, value) {
            acc = Some(match acc {
                None => t,
                Some(a) => combine(a, t),
            });
        }
    }
    acc
}

fn fold_recurse<K, V, S, F, C, T>(
    map: &HashMap<K, V, S>,
    mut cursor: Cursor<K, V>,
    stride: usize,
    identity: &T,
    transform: &F,
    combine: &C,
) -> T
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
    F: Fn(&K, &V) -> T + Sync,
    C: Fn(T, T) -> T + Sync,
    T: Clone + Send + Sync,
{
    if cursor.len() > stride {
        let upper = cursor.split();
        let (left, right) = rayon::join(
            || fold_recurse(map, cursor, stride, identity, transform, combine),
            || fold_recurse(map, upper, stride, identity, transform, combine),
        );
        return combine(left, right);
    }
    let guard = map.collector.register().pin();
    let mut acc = identity.clone();
    // safety: as in `for_each_recurse`
    for (node, value) in unsafe { cursor.into_iter(&guard) } {
        acc = combine(acc, transform(&node.key, value));
    }
    acc
}

#[cfg(test)]
mod tests {
    use crate::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn par_for_each_visits_everything() {
        let map: HashMap<usize, usize> = (0..1000).map(|i| (i, 1)).collect();
        let count = AtomicUsize::new(0);
        map.par_for_each(
            |_, v| {
                count.fetch_add(*v, Ordering::Relaxed);
            },
            &map.guard(),
        );
        assert_eq!(count.into_inner(), 1000);
    }

    #[test]
    fn par_search_finds_match() {
        let map: HashMap<usize, usize> = (0..1000).map(|i| (i, i)).collect();
        let guard = map.guard();
        assert_eq!(
            map.par_search(|k, _| if *k == 999 { Some(999) } else { None }, &guard),
            Some(999)
        );
        assert_eq!(
            map.par_search(|k, _| if *k == 1000 { Some(1000) } else { None }, &guard),
            None,
        );
    }

    #[test]
    fn par_reduce_sums() {
        let map: HashMap<usize, usize> = (0..1000).map(|i| (i, i)).collect();
        let sum = map.par_reduce(|_, v| Some(*v), |a, b| a + b, &map.guard());
        assert_eq!(sum, Some((0..1000).sum()));
    }

    #[test]
    fn par_reduce_empty_is_none() {
        let map: HashMap<usize, usize> = HashMap::new();
        let sum = map.par_reduce(|_, v| Some(*v), |a, b| a + b, &map.guard());
        assert_eq!(sum, None);
    }

    #[test]
    fn par_fold_with_identity() {
        let map: HashMap<usize, usize> = (0..100).map(|i| (i, 2)).collect();
        let product_free_sum = map.par_fold(0usize, |_, v| *v, |a, b| a + b, &map.guard());
        assert_eq!(product_free_sum, 200);
    }

    #[test]
    fn par_variants_over_keys_and_values() {
        let map: HashMap<usize, usize> = (0..100).map(|i| (i, i * 2)).collect();
        let guard = map.guard();
        let key_sum = map.par_reduce_keys(|k| Some(*k), |a, b| a + b, &guard);
        assert_eq!(key_sum, Some(4950));
        let value_sum = map.par_reduce_values(|v| Some(*v), |a, b| a + b, &guard);
        assert_eq!(value_sum, Some(9900));
        assert_eq!(
            map.par_search_keys(|k| if *k == 7 { Some(*k) } else { None }, &guard),
            Some(7)
        );
        let touched = AtomicUsize::new(0);
        map.par_for_each_value(
            |_| {
                touched.fetch_add(1, Ordering::Relaxed);
            },
            &guard,
        );
        assert_eq!(touched.into_inner(), 100);
    }
}
