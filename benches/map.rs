use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rayon::prelude::*;
use squall::HashMap;
use std::sync::Arc;

const ITER: u64 = 32 * 1024;

fn task_insert_u64_u64(threads: usize) -> HashMap<u64, u64> {
    let map = Arc::new(HashMap::with_capacity(ITER as usize));
    let inc = ITER / (threads as u64);

    rayon::scope(|s| {
        for t in 1..=(threads as u64) {
            let m = Arc::clone(&map);
            s.spawn(move |_| {
                let guard = m.guard();
                let start = (t - 1) * inc;
                for i in start..(start + inc) {
                    m.insert(i, i + 7, &guard);
                }
            });
        }
    });
    Arc::try_unwrap(map).unwrap_or_else(|_| panic!("all workers joined"))
}

fn insert_u64_u64(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_u64_u64");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get();

    for threads in 1..=max {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .unwrap();
                pool.install(|| b.iter(|| task_insert_u64_u64(threads)));
            },
        );
    }

    group.finish();
}

fn task_get_u64_u64(threads: usize, map: &HashMap<u64, u64>) {
    let inc = ITER / (threads as u64);

    rayon::scope(|s| {
        for t in 1..=(threads as u64) {
            s.spawn(move |_| {
                let guard = map.guard();
                let start = (t - 1) * inc;
                for i in start..(start + inc) {
                    if let Some(v) = map.get(&i, &guard) {
                        black_box(v);
                    }
                }
            });
        }
    });
}

fn get_u64_u64(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_u64_u64");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get();

    for threads in 1..=max {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                let map = HashMap::with_capacity(ITER as usize);
                {
                    let guard = map.guard();
                    for i in 0..ITER {
                        map.insert(i, i + 7, &guard);
                    }
                }
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .build()
                    .unwrap();
                pool.install(|| b.iter(|| task_get_u64_u64(threads, &map)));
            },
        );
    }

    group.finish();
}

fn par_reduce_sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("par_reduce_sum");
    group.throughput(Throughput::Elements(ITER));

    let map: HashMap<u64, u64> = (0..ITER).map(|i| (i, i)).collect();
    group.bench_function("sum", |b| {
        b.iter(|| {
            let guard = map.guard();
            black_box(map.par_reduce(|_, v| Some(*v), |a, b| a + b, &guard))
        })
    });

    group.finish();
}

criterion_group!(benches, insert_u64_u64, get_u64_u64, par_reduce_sum);
criterion_main!(benches);
