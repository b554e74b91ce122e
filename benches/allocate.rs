//! Benchmarks for the allocation hot path.
//!
//! Each iteration allocates a run of blocks, completes the write, retires
//! any stripe that filled up and invalidates the run again, so segments
//! and write-buffer stripes are recycled and the benchmark can run
//! indefinitely.
//!
//! Run with: cargo bench --bench allocate

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pos_allocator::{
    Allocator, AllocatorConfig, GeometryConfig, MemFile, MemMapper, RecordingFlusher, VolumeId,
};
use std::sync::Arc;
use std::thread;

fn build(volumes: u32) -> (Allocator, Arc<RecordingFlusher>) {
    let config = AllocatorConfig::new()
        .geometry(
            GeometryConfig::default()
                .blocks_per_stripe(128)
                .stripes_per_segment(64)
                .chunks_per_stripe(4)
                .chunk_size(512)
                .write_buffer_stripes(256)
                .user_segments(64)
                .max_volumes(volumes),
        )
        .gc_thresholds(0, 0);
    let flusher = Arc::new(RecordingFlusher::new());
    let allocator = Allocator::new(
        config,
        Arc::new(MemFile::new("meta")),
        Arc::new(MemFile::new("rebuild")),
        Arc::new(MemMapper::new(128)),
        flusher.clone(),
    )
    .unwrap();
    (allocator, flusher)
}

fn write_and_retire(allocator: &Allocator, flusher: &RecordingFlusher, volume: VolumeId, n: u32) {
    let blks = allocator
        .allocate_write_buffer_blks(volume, black_box(n))
        .unwrap();
    allocator.complete_write(blks).unwrap();
    for wb_lsid in flusher.drain() {
        allocator.stripe_flushed(wb_lsid).unwrap();
    }
    allocator.invalidate_blks(blks).unwrap();
}

/// Single volume, varying run length.
fn bench_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate/write_buffer");

    for run in [1u32, 8, 32, 128] {
        let (allocator, flusher) = build(1);
        group.throughput(Throughput::Elements(run as u64));
        group.bench_with_input(BenchmarkId::new("run", run), &run, |b, &run| {
            b.iter(|| write_and_retire(&allocator, &flusher, 0, run));
        });
    }

    group.finish();
}

/// Several volumes allocating in parallel, one thread per volume.
fn bench_allocate_parallel(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate/parallel");

    for volumes in [2u32, 4] {
        let (allocator, flusher) = build(volumes);
        group.throughput(Throughput::Elements(volumes as u64 * 8));
        group.bench_with_input(
            BenchmarkId::new("volumes", volumes),
            &volumes,
            |b, &volumes| {
                b.iter(|| {
                    thread::scope(|s| {
                        for volume in 0..volumes {
                            let allocator = &allocator;
                            let flusher = &flusher;
                            s.spawn(move || write_and_retire(allocator, flusher, volume, 8));
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_allocate, bench_allocate_parallel);
criterion_main!(benches);
