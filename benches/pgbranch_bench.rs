//! Performance benchmarks for pgbranch
//!
//! Tracks the hot read paths: name validation, port scanning, and the
//! dependency-graph queries that back `list`/`info`.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pgbranch::{
    naming, Config, DatasetBackend, MemoryBackend, PortAllocator, PortProbe, SnapshotManager,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

struct FreeProbe;

impl PortProbe for FreeProbe {
    fn is_free(&self, _port: u16) -> bool {
        true
    }
}

struct BusyBelowProbe(u16);

impl PortProbe for BusyBelowProbe {
    fn is_free(&self, port: u16) -> bool {
        port >= self.0
    }
}

fn bench_name_validation(c: &mut Criterion) {
    let symbols = ['-', '_', '/'];
    c.bench_function("validate_branch_name", |b| {
        b.iter(|| naming::validate_branch_name(black_box("team/alice/feature-login_v2"), &symbols))
    });
    c.bench_function("validate_snapshot_name", |b| {
        b.iter(|| naming::validate_snapshot_name(black_box("pre-migration_2024")))
    });
}

fn bench_port_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("port_allocation");
    group.measurement_time(Duration::from_secs(2));

    for busy in [0u16, 50, 99] {
        group.bench_with_input(BenchmarkId::from_parameter(busy), &busy, |b, &busy| {
            let config = Config {
                port_range_start: 6000,
                port_range_end: 6099,
                ..Config::default()
            };
            let allocator = PortAllocator::new(&config, Arc::new(BusyBelowProbe(6000 + busy)));
            b.iter(|| {
                let port = allocator.allocate(None).unwrap();
                allocator.release(port);
                port
            })
        });
    }
    group.finish();
}

fn bench_dependency_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_scan");
    group.measurement_time(Duration::from_secs(2));
    group.sample_size(20);

    for clones in [10usize, 100, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(clones), &clones, |b, &clones| {
            let config = Config::default();
            let backend = Arc::new(MemoryBackend::seeded(&config));
            backend.create("dbpool/data@base").unwrap();
            for i in 0..clones {
                backend
                    .clone_from("dbpool/data@base", &format!("dbpool/branches/clone-{}", i))
                    .unwrap();
            }
            let snapshots = SnapshotManager::new(config, backend);
            b.iter(|| snapshots.dependents_of(black_box("dbpool/data@base")).unwrap().len())
        });
    }
    group.finish();
}

fn bench_allocator_with_free_range(c: &mut Criterion) {
    let config = Config::default();
    let allocator = PortAllocator::new(&config, Arc::new(FreeProbe));
    c.bench_function("allocate_first_free", |b| {
        b.iter(|| {
            let port = allocator.allocate(None).unwrap();
            allocator.release(port);
            port
        })
    });
}

criterion_group!(
    benches,
    bench_name_validation,
    bench_port_allocation,
    bench_dependency_scan,
    bench_allocator_with_free_range
);
criterion_main!(benches);
