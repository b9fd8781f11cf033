//! Throughput benchmarks for the collab core.
//!
//! These benchmarks measure the raw packet throughput of the queue and the
//! fan-out path.

use collab_bench::{drain, populate, sample_payload};
use collab_core::{dispatch, ClientId, DispatchQueue, Packet, ProjectMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Benchmark queue operations.
fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    group.bench_function("enqueue_dequeue", |b| {
        let queue = DispatchQueue::new(0, usize::MAX);
        let payload = sample_payload(4);
        b.iter(|| {
            queue
                .enqueue_with(|id| Packet::from_parts(ClientId(1), 1, "rename", payload.clone(), id))
                .unwrap();
            black_box(queue.try_dequeue())
        });
    });

    // Producers running ahead of the consumer
    group.throughput(Throughput::Elements(1000));
    group.bench_function("burst_1000", |b| {
        let queue = DispatchQueue::new(0, usize::MAX);
        let payload = sample_payload(4);
        b.iter(|| {
            for _ in 0..1000 {
                queue
                    .enqueue_with(|id| {
                        Packet::from_parts(ClientId(1), 1, "rename", payload.clone(), id)
                    })
                    .unwrap();
            }
            while let Some(packet) = queue.try_dequeue() {
                black_box(packet);
            }
        });
    });

    group.finish();
}

/// Benchmark fan-out to projects of increasing size.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let map = ProjectMap::new();
            let mut members = populate(&map, 1, size);
            let origin = members[0].0.clone();
            let payload = sample_payload(16);

            b.iter(|| {
                let packet = Packet::new(origin.as_ref(), "rename", payload.clone(), 0);
                black_box(dispatch(&map, packet));
                drain(&mut members);
            });
        });
    }

    group.finish();
}

/// Benchmark dispatch when other projects share the directory.
fn bench_busy_directory(c: &mut Criterion) {
    let mut group = c.benchmark_group("busy_directory");

    let map = ProjectMap::new();
    let mut others: Vec<_> = (2..200).flat_map(|project| populate(&map, project, 10)).collect();
    let mut members = populate(&map, 1, 10);
    let origin = members[0].0.clone();
    let payload = sample_payload(16);

    group.bench_function("dispatch_10_of_2000", |b| {
        b.iter(|| {
            let packet = Packet::new(origin.as_ref(), "rename", payload.clone(), 0);
            black_box(dispatch(&map, packet));
            drain(&mut members);
        });
    });
    assert_eq!(drain(&mut others), 0);

    group.finish();
}

criterion_group!(benches, bench_queue, bench_fanout, bench_busy_directory);
criterion_main!(benches);
