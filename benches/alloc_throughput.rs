use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use segalloc::{Allocator, HeapAllocator, MallocAllocator};

const OPS: u64 = 100_000;

/// Heap allocator alloc/release throughput.
fn heap_alloc_release(heap: &mut HeapAllocator, size: usize) {
    for _ in 0..OPS {
        unsafe {
            let ptr = heap.allocate(size).unwrap();
            black_box(ptr);
            heap.release(ptr);
        }
    }
}

/// System malloc alloc/release throughput through the wrapper.
fn malloc_alloc_release(malloc: &mut MallocAllocator, size: usize) {
    for _ in 0..OPS {
        unsafe {
            let ptr = malloc.allocate(size, 8, 0).unwrap();
            black_box(ptr);
            malloc.release(ptr);
        }
    }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_throughput");

    for size in [16, 64, 256, 1024, 4096] {
        group.throughput(Throughput::Elements(OPS));

        group.bench_with_input(BenchmarkId::new("heap", size), &size, |b, &size| {
            let mut heap = HeapAllocator::new();
            b.iter(|| heap_alloc_release(&mut heap, size))
        });

        group.bench_with_input(BenchmarkId::new("malloc", size), &size, |b, &size| {
            let mut malloc = MallocAllocator::new();
            b.iter(|| malloc_alloc_release(&mut malloc, size))
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
