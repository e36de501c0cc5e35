#[macro_use]
extern crate criterion;
extern crate cacheismo;
extern crate rand;

use cacheismo::chunkpool::ChunkPool;
use criterion::black_box;
use criterion::Criterion;
use rand::prelude::*;

/// Repeated alloc/free across a spread of size classes, the pattern that
/// exercises the buddy-coalescing free list the hardest.
fn alloc_free_cycle(c: &mut Criterion) {
    c.bench_function("chunkpool alloc/free mixed sizes", |b| {
        let mut pool = ChunkPool::new(1024);
        let mut rng = StdRng::seed_from_u64(42);
        b.iter(|| {
            let mut handles = Vec::with_capacity(256);
            for _ in 0..256 {
                let size = rng.gen_range(16, 2048);
                if let Ok(handle) = pool.malloc(size) {
                    handles.push(handle);
                }
            }
            for handle in handles {
                pool.free(black_box(handle));
            }
        })
    });
}

/// Allocation pattern that leaves the pool fragmented, forcing the GC pass
/// on the next allocation that needs a larger class than any free list
/// currently holds (§4.1).
fn fragmentation_and_gc(c: &mut Criterion) {
    c.bench_function("chunkpool fragment then gc", |b| {
        let mut pool = ChunkPool::new(256);
        b.iter(|| {
            let mut handles = Vec::with_capacity(128);
            for _ in 0..128 {
                handles.push(pool.malloc(32).unwrap());
            }
            for handle in handles.iter().step_by(2) {
                pool.free(*handle);
            }
            if pool.needs_gc() {
                pool.gc();
            }
            black_box(pool.free_memory());
            for handle in handles.into_iter().skip(1).step_by(2) {
                pool.free(handle);
            }
        })
    });
}

criterion_group!(benches, alloc_free_cycle, fragmentation_and_gc);
criterion_main!(benches);
