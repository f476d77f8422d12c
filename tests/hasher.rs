use squall::{DefaultHashBuilder, HashMap};
use std::hash::{BuildHasher, BuildHasherDefault, Hasher};

#[test]
fn default_hasher() {
    let map: HashMap<u32, i32> = HashMap::default();
    let guard = map.guard();
    map.insert(1, 1, &guard);
    assert_eq!(map.get(&1, &guard), Some(&1));
}

#[test]
fn explicit_default_hash_builder() {
    let map: HashMap<u32, i32, DefaultHashBuilder> =
        HashMap::with_hasher(DefaultHashBuilder::default());
    let guard = map.guard();
    map.insert(1, 1, &guard);
    assert_eq!(map.get(&1, &guard), Some(&1));
}

#[test]
fn std_random_state() {
    let map: HashMap<u32, i32, std::collections::hash_map::RandomState> = HashMap::default();
    let guard = map.guard();
    map.insert(1, 1, &guard);
    assert_eq!(map.get(&1, &guard), Some(&1));
}

#[derive(Default)]
struct OneAtATime(u64);

impl Hasher for OneAtATime {
    fn finish(&self) -> u64 {
        self.0
    }
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = self.0.wrapping_add(u64::from(b));
            self.0 = self.0.wrapping_mul(0x100_0000_01b3);
        }
    }
}

#[test]
fn custom_hasher_via_default() {
    let map: HashMap<u32, i32, BuildHasherDefault<OneAtATime>> = HashMap::default();
    let guard = map.guard();
    for i in 0..100 {
        map.insert(i, i as i32, &guard);
    }
    for i in 0..100 {
        assert_eq!(map.get(&i, &guard), Some(&(i as i32)));
    }
}

#[test]
fn hasher_is_consulted() {
    struct CountingBuilder(std::sync::Arc<std::sync::atomic::AtomicUsize>);
    impl BuildHasher for CountingBuilder {
        type Hasher = OneAtATime;
        fn build_hasher(&self) -> OneAtATime {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            OneAtATime::default()
        }
    }

    let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let map: HashMap<u32, u32, _> = HashMap::with_hasher(CountingBuilder(calls.clone()));
    let guard = map.guard();
    map.insert(1, 1, &guard);
    map.get(&1, &guard);
    assert!(calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
}
