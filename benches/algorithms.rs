//! Benchmarks for the parallel algorithms against their sequential
//! counterparts.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use millrace::{algorithms, TaskScheduler};

// -----------------------------------------------------------------------------
// Workload

const LEN: usize = 4_000_000;

fn random_input(seed: u64) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..LEN).map(|_| rng.gen()).collect()
}

/// Honours `RUST_LOG` so scheduler traces can be inspected during a bench.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

// -----------------------------------------------------------------------------
// Benchmarks

fn bench_reduce(c: &mut Criterion) {
    init_tracing();
    let threads = std::thread::available_parallelism().map_or(4, |n| n.get());
    let scheduler = TaskScheduler::new(threads, true);
    scheduler.start();
    let items = random_input(3);

    let mut group = c.benchmark_group("reduce");
    group.bench_function("sequential", |b| {
        b.iter(|| items.iter().fold(0u64, |a, &x| a.wrapping_add(x)))
    });
    group.bench_function("parallel", |b| {
        b.iter(|| algorithms::reduce_with(&scheduler, &items, 0u64, |a, x| a.wrapping_add(x)))
    });
    group.finish();
    scheduler.stop(true);
}

fn bench_sort(c: &mut Criterion) {
    init_tracing();
    let threads = std::thread::available_parallelism().map_or(4, |n| n.get());
    let scheduler = TaskScheduler::new(threads, true);
    scheduler.start();
    let items = random_input(5);

    let mut group = c.benchmark_group("sort");
    group.sample_size(10);
    group.bench_function("sequential", |b| {
        b.iter_batched(
            || items.clone(),
            |mut items| items.sort_unstable(),
            BatchSize::LargeInput,
        )
    });
    group.bench_function("parallel", |b| {
        b.iter_batched(
            || items.clone(),
            |mut items| algorithms::sort_with(&scheduler, &mut items),
            BatchSize::LargeInput,
        )
    });
    group.finish();
    scheduler.stop(true);
}

criterion_group!(benches, bench_reduce, bench_sort);
criterion_main!(benches);
