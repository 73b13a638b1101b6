//! Basic benchmarks for the `chunk_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use alloc_tracker::Allocator;
use chunk_pool::ChunkAllocator;
use criterion::{Criterion, criterion_group, criterion_main};
use new_zealand::nz;

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

type TestItem = [u64; 4];
const TEST_VALUE: TestItem = [1, 2, 3, 4];

fn new_allocator() -> ChunkAllocator {
    ChunkAllocator::builder()
        .layout_of::<TestItem>()
        .initial_capacity(nz!(128))
        .build()
        .unwrap()
}

fn entrypoint(c: &mut Criterion) {
    let allocs = alloc_tracker::Session::new();

    let mut group = c.benchmark_group("chunk_basic");

    let allocs_op = allocs.operation("create");
    group.bench_function("create", |b| {
        b.iter_custom(|iters| {
            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(new_allocator()));
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("acquire_one");
    group.bench_function("acquire_one", |b| {
        b.iter_custom(|iters| {
            let mut allocators = iter::repeat_with(new_allocator)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for allocator in &mut allocators {
                _ = black_box(allocator.acquire());
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("release_acquire_cycle");
    group.bench_function("release_acquire_cycle", |b| {
        b.iter_custom(|iters| {
            let mut allocator = new_allocator();
            let mut chunk = allocator.acquire().unwrap();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                // SAFETY: The chunk came from this allocator and is not used after release.
                unsafe { allocator.release(black_box(chunk)) };
                chunk = black_box(allocator.acquire().unwrap());
            }

            start.elapsed()
        });
    });

    group.finish();

    let mut group = c.benchmark_group("chunk_slow");

    let allocs_op = allocs.operation("acquire_10k");
    group.bench_function("acquire_10k", |b| {
        // Crosses several slab boundaries, so this includes the cost of growth.
        b.iter_custom(|iters| {
            let mut allocators = iter::repeat_with(new_allocator)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for allocator in &mut allocators {
                for _ in 0..10_000 {
                    let chunk = allocator.acquire().unwrap().cast::<TestItem>();

                    // SAFETY: The chunk is sized and aligned for TestItem and exclusively ours.
                    unsafe { chunk.write(black_box(TEST_VALUE)) };
                }
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("forward_10_back_5_times_1000");
    group.bench_function("forward_10_back_5_times_1000", |b| {
        // We acquire 10 chunks, release the first 5 and repeat this 1000 times.
        // This stresses the scanning of the chain for a slab with room.
        b.iter_custom(|iters| {
            let mut allocators = iter::repeat_with(new_allocator)
                .take(usize::try_from(iters).unwrap())
                .collect::<Vec<_>>();

            let mut to_release = Vec::with_capacity(5);

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for allocator in &mut allocators {
                for _ in 0..1000 {
                    to_release.clear();

                    for _ in 0..5 {
                        to_release.push(allocator.acquire().unwrap());
                    }

                    for _ in 0..5 {
                        _ = black_box(allocator.acquire());
                    }

                    #[expect(clippy::iter_with_drain, reason = "to avoid moving the vector")]
                    for chunk in to_release.drain(..) {
                        // SAFETY: The chunk came from this allocator and is not used again.
                        unsafe { allocator.release(chunk) };
                    }
                }
            }

            start.elapsed()
        });
    });

    let allocs_op = allocs.operation("reset_after_10k");
    group.bench_function("reset_after_10k", |b| {
        b.iter_custom(|iters| {
            let mut allocators = iter::repeat_with(|| {
                let mut allocator = new_allocator();
                for _ in 0..10_000 {
                    _ = allocator.acquire();
                }
                allocator
            })
            .take(usize::try_from(iters).unwrap())
            .collect::<Vec<_>>();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for allocator in &mut allocators {
                allocator.reset();
            }

            start.elapsed()
        });
    });

    group.finish();

    allocs.print_to_stdout();
}
