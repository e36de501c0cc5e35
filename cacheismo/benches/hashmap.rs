#[macro_use]
extern crate criterion;
extern crate cacheismo;
extern crate rand;

use cacheismo::chunkpool::ChunkPool;
use cacheismo::clock::Clock;
use cacheismo::command::{Command, CommandKind};
use cacheismo::datastream::{DataStream, SegmentTable};
use cacheismo::fallocator::{Arena, PageCache};
use cacheismo::hashmap::HashMap;
use cacheismo::item::CacheItem;
use criterion::black_box;
use criterion::Criterion;
use rand::prelude::*;
use std::cell::RefCell;
use std::rc::Rc;

fn make_item(table: &mut SegmentTable, chunkpool: &mut ChunkPool, arena: &mut Arena, clock: &Clock, key: &[u8], value: &[u8], cas: u64) -> CacheItem {
    let mut payload = DataStream::new_ephemeral();
    payload.append_new_ephemeral(table, arena, value).unwrap();
    let mut cmd = Command::new(CommandKind::Set);
    cmd.key = key.to_vec();
    cmd.data_length = value.len() as u32;
    CacheItem::create(table, chunkpool, Some(arena), clock, &cmd, &payload, cas).unwrap()
}

/// `put` throughput across a key space wide enough to force several
/// bucket splits and at least one table doubling (§4.5).
fn put_triggers_split_and_double(c: &mut Criterion) {
    c.bench_function("hashmap put with splits", |b| {
        b.iter(|| {
            let mut table = SegmentTable::new();
            let mut chunkpool = ChunkPool::new(4096);
            let page_cache = Rc::new(RefCell::new(PageCache::new(256)));
            let mut arena = Arena::new(page_cache);
            let clock = Clock::new();
            let mut map: HashMap<CacheItem> = HashMap::new();
            for i in 0..20_000u32 {
                let key = format!("key-{}", i);
                let item = make_item(&mut table, &mut chunkpool, &mut arena, &clock, key.as_bytes(), b"benchmark-value", i as u64);
                map.put(item);
            }
            black_box(map.len());
        })
    });
}

/// `get` latency on a populated table with a realistic hit/miss mix,
/// mirroring the workload §8's LRU-pressure scenario exercises.
fn get_hit_and_miss_mix(c: &mut Criterion) {
    let mut table = SegmentTable::new();
    let mut chunkpool = ChunkPool::new(4096);
    let page_cache = Rc::new(RefCell::new(PageCache::new(256)));
    let mut arena = Arena::new(page_cache);
    let clock = Clock::new();
    let mut map: HashMap<CacheItem> = HashMap::new();
    for i in 0..10_000u32 {
        let key = format!("key-{}", i);
        let item = make_item(&mut table, &mut chunkpool, &mut arena, &clock, key.as_bytes(), b"benchmark-value", i as u64);
        map.put(item);
    }

    c.bench_function("hashmap get hit/miss mix", |b| {
        let mut rng = StdRng::seed_from_u64(7);
        b.iter(|| {
            let i = rng.gen_range(0, 20_000u32);
            let key = format!("key-{}", i);
            let now = clock.now_secs();
            if let Some(found) = map.get(key.as_bytes(), now) {
                found.release();
            }
        })
    });
}

criterion_group!(benches, put_triggers_split_and_double, get_hit_and_miss_mix);
criterion_main!(benches);
