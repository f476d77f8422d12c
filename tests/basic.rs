use squall::*;
use std::sync::Arc;

#[test]
fn construction_does_not_allocate_a_table() {
    let _map = HashMap::<u64, &'static str>::new();
}

#[test]
fn lookups_on_a_fresh_map_miss() {
    let map = HashMap::<u64, &'static str>::new();
    let guard = map.guard();
    assert_eq!(map.get(&11, &guard), None);
    assert_eq!(map.remove(&11, &guard), None);
    assert!(!map.contains_key(&11, &guard));
}

#[test]
fn first_insert_returns_no_previous_value() {
    let map = HashMap::<u64, &'static str>::new();
    let guard = map.guard();
    assert_eq!(map.insert(11, "eleven", &guard), None);
}

#[test]
fn insert_then_get_then_remove() {
    let map = HashMap::<u64, &'static str>::new();
    let guard = map.guard();
    map.insert(11, "eleven", &guard);
    assert_eq!(map.get(&11, &guard), Some(&"eleven"));
    assert_eq!(map.remove(&11, &guard), Some(&"eleven"));
    assert_eq!(map.get(&11, &guard), None);
}

#[test]
fn get_key_value_returns_the_stored_key() {
    let map = HashMap::<String, u32>::new();
    let guard = map.guard();
    map.insert("meter".to_string(), 110, &guard);
    let (k, v) = map.get_key_value("meter", &guard).unwrap();
    assert_eq!(k, "meter");
    assert_eq!(v, &110);
}

#[test]
fn overwrite_returns_the_old_value() {
    let map = HashMap::<u64, &'static str>::new();
    let guard = map.guard();
    map.insert(11, "eleven", &guard);
    assert_eq!(map.insert(11, "twelve", &guard), Some(&"eleven"));
    assert_eq!(map.get(&11, &guard), Some(&"twelve"));
}

#[test]
fn overwrites_do_not_change_len() {
    let map = HashMap::<u64, u64>::new();
    let guard = map.guard();
    map.insert(5, 50, &guard);
    map.insert(5, 51, &guard);
    map.insert(5, 52, &guard);
    assert_eq!(map.len(), 1);
    map.insert(6, 60, &guard);
    assert_eq!(map.len(), 2);
}

#[test]
fn try_insert_keeps_the_incumbent() {
    let map = HashMap::<u64, &'static str>::new();
    let guard = map.guard();
    assert_eq!(map.try_insert(11, "eleven", &guard), Ok(&"eleven"));
    assert_eq!(
        map.try_insert(11, "usurper", &guard),
        Err(TryInsertError {
            current: &"eleven",
            not_inserted: "usurper"
        })
    );
    assert_eq!(map.get(&11, &guard), Some(&"eleven"));
}

#[test]
fn two_distinct_keys() {
    // two inserts of distinct keys must both be visible afterwards
    let map = Arc::new(HashMap::<String, usize>::new());

    let map1 = Arc::clone(&map);
    let t1 = std::thread::spawn(move || {
        map1.insert("hello".to_string(), 1, &map1.guard());
    });
    let map2 = Arc::clone(&map);
    let t2 = std::thread::spawn(move || {
        map2.insert("world".to_string(), 2, &map2.guard());
    });
    t1.join().unwrap();
    t2.join().unwrap();

    let guard = map.guard();
    assert_eq!(map.len(), 2);
    assert_eq!(map.get("hello", &guard), Some(&1));
    assert_eq!(map.get("world", &guard), Some(&2));
    assert_eq!(map.get("absent", &guard), None);
}

#[test]
fn contains_value() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(42, 1337, &guard);
    assert!(map.contains_value(&1337, &guard));
    assert!(!map.contains_value(&1336, &guard));
}

#[test]
fn mapping_count() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.mapping_count(), 0);
    for i in 0..100 {
        map.insert(i, i, &guard);
    }
    assert_eq!(map.mapping_count(), 100);
    assert_eq!(map.len(), 100);
}

#[test]
fn clear() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..100 {
        map.insert(i, i, &guard);
    }
    assert_eq!(map.len(), 100);
    map.clear(&guard);
    assert!(map.is_empty());
    assert_eq!(map.get(&3, &guard), None);
    // the map stays usable after a clear
    map.insert(3, 4, &guard);
    assert_eq!(map.get(&3, &guard), Some(&4));
}

#[test]
fn compute_if_present_updates() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(42, 0, &guard);
    let new = map.compute_if_present(&42, |_, v| Some(v + 1), &guard);
    assert_eq!(new, Some(&1));
    assert_eq!(map.get(&42, &guard), Some(&1));
}

#[test]
fn compute_if_present_removes() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(42, 0, &guard);
    assert_eq!(map.compute_if_present(&42, |_, _| None, &guard), None);
    assert_eq!(map.get(&42, &guard), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn compute_if_present_absent_key_does_not_run() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    let new = map.compute_if_present(&42, |_, _| panic!("must not run"), &guard);
    assert_eq!(new, None);
}

#[test]
fn compute_inserts_when_absent() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.compute(42, |_, v| { assert!(v.is_none()); Some(1) }, &guard), Some(&1));
    assert_eq!(map.get(&42, &guard), Some(&1));
    assert_eq!(map.len(), 1);
}

#[test]
fn compute_none_on_empty_bin_leaves_no_entry() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.compute(42, |_, _| None, &guard), None);
    assert_eq!(map.get(&42, &guard), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn compute_updates_and_removes() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(42, 1, &guard);
    assert_eq!(map.compute(42, |_, v| v.map(|v| v * 2), &guard), Some(&2));
    assert_eq!(map.compute(42, |_, _| None, &guard), None);
    assert_eq!(map.get(&42, &guard), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn compute_if_absent_inserts_once() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.compute_if_absent(42, |k| Some(k + 1), &guard), Some(&43));
    // present now; the function must not run again
    assert_eq!(
        map.compute_if_absent(42, |_| panic!("must not run"), &guard),
        Some(&43)
    );
    assert_eq!(map.len(), 1);
}

#[test]
fn compute_if_absent_none_inserts_nothing() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.compute_if_absent(42, |_| None, &guard), None);
    assert_eq!(map.get(&42, &guard), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn merge_inserts_then_merges() {
    let map = HashMap::<&'static str, usize>::new();
    let guard = map.guard();
    assert_eq!(map.merge("k", 1, |old, new| Some(old + new), &guard), Some(&1));
    assert_eq!(map.merge("k", 2, |old, new| Some(old + new), &guard), Some(&3));
    assert_eq!(map.len(), 1);
}

#[test]
fn merge_remove_on_none() {
    let map = HashMap::<&'static str, usize>::new();
    let guard = map.guard();
    map.insert("k", 1, &guard);
    assert_eq!(map.merge("k", 1, |_, _| None, &guard), None);
    assert_eq!(map.get("k", &guard), None);
    assert_eq!(map.len(), 0);
}

#[test]
fn replace_present_only() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    assert_eq!(map.replace(&42, 1, &guard), None);
    assert_eq!(map.get(&42, &guard), None);
    map.insert(42, 1, &guard);
    assert_eq!(map.replace(&42, 2, &guard), Some(&1));
    assert_eq!(map.get(&42, &guard), Some(&2));
}

#[test]
fn replace_value_compares() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(42, 1, &guard);
    assert!(!map.replace_value(&42, &0, 2, &guard));
    assert_eq!(map.get(&42, &guard), Some(&1));
    assert!(map.replace_value(&42, &1, 2, &guard));
    assert_eq!(map.get(&42, &guard), Some(&2));
}

#[test]
fn remove_value_compares() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(42, 1, &guard);
    assert!(!map.remove_value(&42, &0, &guard));
    assert_eq!(map.len(), 1);
    assert!(map.remove_value(&42, &1, &guard));
    assert_eq!(map.len(), 0);
}

#[test]
fn remove_entry_returns_key() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(1, 10, &guard);
    assert_eq!(map.remove_entry(&1, &guard), Some((&1, &10)));
    assert_eq!(map.remove_entry(&1, &guard), None);
}

#[test]
fn round_trip_insert_remove_get() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    map.insert(1, 2, &guard);
    assert_eq!(map.get(&1, &guard), Some(&2));
    map.remove(&1, &guard);
    assert_eq!(map.get(&1, &guard), None);
}

#[test]
fn retain() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..8 {
        map.insert(i, i * 10, &guard);
    }
    map.retain(|&k, _| k % 2 == 0, &guard);
    assert_eq!(map.len(), 4);
    for i in 0..8 {
        assert_eq!(map.get(&i, &guard).is_some(), i % 2 == 0);
    }
}

#[test]
fn retain_force() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..8 {
        map.insert(i, i * 10, &guard);
    }
    map.retain_force(|_, &v| v >= 40, &guard);
    assert_eq!(map.len(), 4);
}

#[test]
fn extend_and_from_iter() {
    let pairs: Vec<(usize, usize)> = (0..100).map(|i| (i, i + 1)).collect();
    let map: HashMap<usize, usize> = pairs.iter().collect();
    assert_eq!(map.len(), 100);

    let mut map_ref = &map;
    map_ref.extend((100..200).map(|i| (i, i + 1)));
    assert_eq!(map.len(), 200);

    let guard = map.guard();
    for i in 0..200 {
        assert_eq!(map.get(&i, &guard), Some(&(i + 1)));
    }
}

#[test]
fn clone_map() {
    let map: HashMap<usize, usize> = (0..64).map(|i| (i, i)).collect();
    let cloned = map.clone();
    assert_eq!(map, cloned);
    // the clone is independent
    cloned.pin().insert(1000, 1000);
    assert_eq!(map.len(), 64);
    assert_eq!(cloned.len(), 65);
}

#[test]
fn eq_compares_contents_not_history() {
    // two maps built in different insertion orders with an overwrite along the way still
    // compare equal; any divergence in content breaks the equality
    let left = HashMap::new();
    {
        let guard = left.guard();
        for (k, v) in [(10, "gale"), (20, "squall"), (30, "gust")].iter() {
            left.insert(*k, *v, &guard);
        }
    }
    let right = HashMap::new();
    {
        let guard = right.guard();
        right.insert(30, "breeze", &guard);
        right.insert(20, "squall", &guard);
        right.insert(10, "gale", &guard);
        // fix up the one divergent value
        right.insert(30, "gust", &guard);
    }
    assert_eq!(left, right);

    right.pin().remove(&20);
    assert_ne!(left, right);
}

#[test]
fn debug_format() {
    let map = HashMap::<usize, usize>::new();
    map.pin().insert(1, 2);
    assert_eq!(format!("{:?}", map), "{1: 2}");
}

#[test]
fn pinned_ref_surface() {
    let map = HashMap::<usize, usize>::new();
    let pinned = map.pin();
    pinned.insert(1, 10);
    assert_eq!(pinned.get(&1), Some(&10));
    assert!(pinned.contains_key(&1));
    assert_eq!(pinned.compute_if_present(&1, |_, v| Some(v + 1)), Some(&11));
    assert_eq!(pinned.remove(&1), Some(&11));
    assert!(pinned.is_empty());
}

#[test]
fn many_keys_survive_resizes() {
    let map = HashMap::<usize, usize>::new();
    let guard = map.guard();
    for i in 0..10_000 {
        map.insert(i, i * i, &guard);
    }
    assert_eq!(map.len(), 10_000);
    for i in 0..10_000 {
        assert_eq!(map.get(&i, &guard), Some(&(i * i)), "key {} lost", i);
    }
}

mod collisions {
    use super::*;
    use std::hash::{BuildHasher, Hasher};

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

    #[test]
    fn fully_colliding_keys_form_a_working_tree() {
        // every key hashes identically, so they all land in one bin, which must degrade
        // gracefully into a tree and still answer every lookup
        let map = HashMap::<usize, usize, _>::with_hasher(ZeroHashBuilder);
        let guard = map.guard();
        const N: usize = 2_000;
        for i in 0..N {
            map.insert(i, i + 1, &guard);
        }
        assert_eq!(map.len(), N);
        for i in 0..N {
            assert_eq!(map.get(&i, &guard), Some(&(i + 1)), "key {} lost", i);
        }
        // removal out of a tree bin works too
        for i in (0..N).step_by(2) {
            assert_eq!(map.remove(&i, &guard), Some(&(i + 1)));
        }
        assert_eq!(map.len(), N / 2);
        for i in (1..N).step_by(2) {
            assert_eq!(map.get(&i, &guard), Some(&(i + 1)));
        }
    }
}
