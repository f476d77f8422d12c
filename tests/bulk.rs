use squall::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn parallel_reduce_matches_sequential_sum() {
    let map: HashMap<usize, i64> = (0..10_000).map(|i| (i, i as i64)).collect();
    let guard = map.guard();
    let expected: i64 = (0..10_000).sum();
    assert_eq!(
        map.par_reduce(|_, v| Some(*v), |a, b| a + b, &guard),
        Some(expected)
    );
    assert_eq!(map.par_fold(0i64, |_, v| *v, |a, b| a + b, &guard), expected);
}

#[test]
fn parallel_reduce_with_concurrent_writer_never_errs() {
    // a put racing a reduce may or may not be included, but the reduce must neither fail nor
    // double-count: every observed value is counted exactly once
    let map: Arc<HashMap<usize, i64>> = Arc::new((0..10_000).map(|i| (i, 1i64)).collect());

    let writer = {
        let map = Arc::clone(&map);
        std::thread::spawn(move || {
            let guard = map.guard();
            for i in 10_000..20_000 {
                map.insert(i, 1, &guard);
            }
        })
    };

    for _ in 0..8 {
        let guard = map.guard();
        let sum = map.par_reduce(|_, v| Some(*v), |a, b| a + b, &guard).unwrap();
        // everything initially present is included; concurrent inserts may or may not be
        assert!(sum >= 10_000 && sum <= 20_000, "sum was {}", sum);
    }

    writer.join().unwrap();

    let guard = map.guard();
    assert_eq!(
        map.par_reduce(|_, v| Some(*v), |a, b| a + b, &guard),
        Some(20_000)
    );
}

#[test]
fn parallel_for_each_sees_every_entry() {
    let map: HashMap<usize, usize> = (0..5_000).map(|i| (i, i)).collect();
    let count = AtomicUsize::new(0);
    let sum = AtomicUsize::new(0);
    map.par_for_each(
        |_, v| {
            count.fetch_add(1, Ordering::Relaxed);
            sum.fetch_add(*v, Ordering::Relaxed);
        },
        &map.guard(),
    );
    assert_eq!(count.into_inner(), 5_000);
    assert_eq!(sum.into_inner(), (0..5_000).sum());
}

#[test]
fn parallel_search_finds_and_misses() {
    let map: HashMap<usize, usize> = (0..100_000).map(|i| (i, i)).collect();
    let guard = map.guard();
    let found = map.par_search(
        |k, _| if *k == 50_000 { Some(*k) } else { None },
        &guard,
    );
    assert_eq!(found, Some(50_000));
    let missed = map.par_search(
        |k, _| if *k == 200_000 { Some(*k) } else { None },
        &guard,
    );
    assert_eq!(missed, None);
}

#[test]
fn parallel_ops_on_dedicated_pool() {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(2)
        .build()
        .unwrap();
    let map: HashMap<usize, usize> = (0..1_000).map(|i| (i, 1)).collect();
    let sum = pool.install(|| {
        let guard = map.guard();
        map.par_reduce(|_, v| Some(*v), |a, b| a + b, &guard)
    });
    assert_eq!(sum, Some(1_000));
}

#[test]
fn parallel_reduce_keys_and_values() {
    let map: HashMap<usize, usize> = (0..1_000).map(|i| (i, i * 3)).collect();
    let guard = map.guard();
    assert_eq!(
        map.par_reduce_keys(|k| Some(*k), |a, b| a + b, &guard),
        Some((0..1_000).sum())
    );
    assert_eq!(
        map.par_reduce_values(|v| Some(*v), |a, b| a + b, &guard),
        Some((0..1_000).map(|i| i * 3).sum())
    );
}
