//! Throughput benchmarks: Linger vs Moka.
//!
//! Both caches are pre-filled so the hot loops measure steady-state hit
//! paths; moka's time-to-idle configuration is the closest analogue to
//! linger's lease-plus-idle-TTL retention.
//!
//! Run with:
//!     cargo bench --bench throughput

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use linger::{FlightMap, Lease, LeaseMap};
use moka::sync::Cache as MokaCache;
use std::time::Duration;

/// Number of entries each cache is pre-filled with.
const CAP: u64 = 10_000;

/// Operations executed per criterion iteration (hot-loop size).
const OPS: u64 = 1_000;

/// Long enough that nothing is reclaimed mid-benchmark.
const IDLE: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// Group 1: acquire_hit
// ---------------------------------------------------------------------------
// All keys are present and leased → measures the pure read path: one table
// lookup plus the per-entry acquire/release protocol.

fn bench_acquire_hit(c: &mut Criterion) {
    let linger: LeaseMap<u64, u64> = LeaseMap::new(IDLE);
    // Keep one lease per key so entries stay resident for the whole run.
    let mut pins: Vec<Lease> = Vec::with_capacity(CAP as usize);
    for i in 0..CAP {
        let (_, _, lease) = linger.acquire_or_store(i, |_| i * 2);
        pins.push(lease);
    }

    let moka: MokaCache<u64, u64> = MokaCache::builder()
        .max_capacity(CAP)
        .time_to_idle(IDLE)
        .build();
    for i in 0..CAP {
        moka.insert(i, i * 2);
    }

    let mut group = c.benchmark_group("acquire_hit");
    group.throughput(Throughput::Elements(OPS));

    group.bench_function("linger", |b| {
        b.iter(|| {
            for i in 0..OPS {
                black_box(linger.acquire(black_box(&i)));
            }
        })
    });

    group.bench_function("moka", |b| {
        b.iter(|| {
            for i in 0..OPS {
                black_box(moka.get(black_box(&i)));
            }
        })
    });

    group.finish();
    drop(pins);
}

// ---------------------------------------------------------------------------
// Group 2: build_once_hit
// ---------------------------------------------------------------------------
// Repeated deduplicated construction on already-built keys — linger's
// `FlightMap::acquire_or_store` against moka's `get_with`, both of which
// coalesce concurrent builders and serve later callers from cache.

fn bench_build_once_hit(c: &mut Criterion) {
    let linger: FlightMap<u64, u64> = FlightMap::new(IDLE);
    let mut pins: Vec<Lease> = Vec::with_capacity(CAP as usize);
    for i in 0..CAP {
        let (_, _, lease) = linger.acquire_or_store(i, || Ok(i * 2));
        pins.push(lease);
    }

    let moka: MokaCache<u64, u64> = MokaCache::builder()
        .max_capacity(CAP)
        .time_to_idle(IDLE)
        .build();
    for i in 0..CAP {
        moka.insert(i, i * 2);
    }

    let mut group = c.benchmark_group("build_once_hit");
    group.throughput(Throughput::Elements(OPS));

    group.bench_function("linger", |b| {
        b.iter(|| {
            for i in 0..OPS {
                let (result, _, lease) = linger.acquire_or_store(black_box(i), || Ok(i * 2));
                black_box(result.value());
                lease.release();
            }
        })
    });

    group.bench_function("moka", |b| {
        b.iter(|| {
            for i in 0..OPS {
                black_box(moka.get_with(black_box(i), || i * 2));
            }
        })
    });

    group.finish();
    drop(pins);
}

criterion_group!(benches, bench_acquire_hit, bench_build_once_hit);
criterion_main!(benches);
