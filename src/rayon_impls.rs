use crate::{HashMap, HashMapRef};
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};
use std::hash::{BuildHasher, Hash};

impl<K, V, S> FromParallelIterator<(K, V)> for HashMap<K, V, S>
where
    K: 'static + Clone + Hash + Ord + Send + Sync,
    V: 'static + Send + Sync,
    S: BuildHasher + Default + Sync,
{
    fn from_par_iter<I>(par_iter: I) -> Self
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        let mut created_map = HashMap::with_hasher(S::default());
        created_map.par_extend(par_iter);
        created_map
    }
}

impl<K, V, S> ParallelExtend<(K, V)> for HashMap<K, V, S>
where
    K: 'static + Clone + Hash + Ord + Send + Sync,
    V: 'static + Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        (&*self).par_extend(par_iter);
    }
}

impl<K, V, S> ParallelExtend<(K, V)> for &HashMap<K, V, S>
where
    K: 'static + Clone + Hash + Ord + Send + Sync,
    V: 'static + Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        par_iter.into_par_iter().for_each_init(
            || self.guard(),
            |guard, (k, v)| {
                self.insert(k, v, guard);
            },
        );
    }
}

impl<K, V, S> ParallelExtend<(K, V)> for HashMapRef<'_, K, V, S>
where
    K: 'static + Clone + Hash + Ord + Send + Sync,
    V: 'static + Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, par_iter: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        self.map.par_extend(par_iter);
    }
}

#[cfg(test)]
mod test {
    use crate::HashMap;
    use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

    #[test]
    fn collect_from_empty_parallel_iter() {
        let source: Vec<(u32, u32)> = Vec::new();
        let map = HashMap::<u32, u32>::from_par_iter(source.into_par_iter());
        assert!(map.is_empty());
    }

    #[test]
    fn collect_a_range_in_parallel() {
        let map: HashMap<u32, u32> =
            HashMap::from_par_iter((0..512u32).into_par_iter().map(|k| (k, k.rotate_left(3))));
        assert_eq!(map.len(), 512);

        let guard = map.guard();
        for k in 0..512u32 {
            assert_eq!(map.get(&k, &guard), Some(&k.rotate_left(3)));
        }
    }

    #[test]
    fn par_extend_merges_into_existing_entries() {
        let mut map: HashMap<u32, &'static str> = HashMap::new();
        {
            let guard = map.guard();
            map.insert(1, "old", &guard);
            map.insert(2, "old", &guard);
        }

        // an empty extension changes nothing...
        map.par_extend(Vec::<(u32, &'static str)>::new().into_par_iter());
        assert_eq!(map.len(), 2);

        // ...and a real one overwrites the overlap and adds the rest
        map.par_extend((2..64u32).into_par_iter().map(|k| (k, "new")));
        assert_eq!(map.len(), 63);

        let guard = map.guard();
        assert_eq!(map.get(&1, &guard), Some(&"old"));
        assert_eq!(map.get(&2, &guard), Some(&"new"));
        assert_eq!(map.get(&63, &guard), Some(&"new"));
    }

    #[test]
    fn par_extend_through_a_pinned_ref() {
        let map: HashMap<u64, u64> = HashMap::new();
        map.pin()
            .par_extend((0..128u64).into_par_iter().map(|k| (k, k + k)));
        assert_eq!(map.len(), 128);

        let pinned = map.pin();
        assert_eq!(pinned.get(&10), Some(&20));
        assert_eq!(pinned.get(&127), Some(&254));
    }
}
