//! Process-wide collaborators threaded through every callback (§9: "Global
//! mutable state... Reinterpret as a single `CoreContext` value threaded
//! through every callback; the binding layer holds one reference").
//!
//! The source's `global_t ENV` in `driver/driver.c` holds the chunk
//! allocator, hash map, and event base as a file-scope static; `CoreContext`
//! is the same bundle of state minus the event base (owned by
//! `server::Server` instead, since it also owns the mio poller) and minus
//! the Lua `runnable` (the built-in runtime is stateless w.r.t. scripts).

use crate::chunkpool::ChunkPool;
use crate::clock::Clock;
use crate::datastream::SegmentTable;
use crate::fallocator::PageCache;
use crate::hashmap::HashMap;
use crate::item::CacheItem;
use std::cell::RefCell;
use std::rc::Rc;

/// Static configuration the core needs once at startup and never mutates
/// afterward; kept apart from the mutable collaborators below.
pub struct CoreConfig {
    pub virtual_keys: bool,
    pub idle_timeout_secs: Option<u64>,
}

pub struct CoreContext {
    pub chunkpool: ChunkPool,
    pub segments: SegmentTable,
    pub page_cache: Rc<RefCell<PageCache>>,
    pub map: HashMap<CacheItem>,
    pub clock: Clock,
    pub config: CoreConfig,
    next_cas: u64,
}

impl CoreContext {
    pub fn new(page_count: usize, io_page_cache_cap: usize, config: CoreConfig) -> Self {
        CoreContext {
            chunkpool: ChunkPool::new(page_count),
            segments: SegmentTable::new(),
            page_cache: Rc::new(RefCell::new(PageCache::new(io_page_cache_cap))),
            map: HashMap::new(),
            clock: Clock::new(),
            config,
            next_cas: 1,
        }
    }

    /// Mirrors the built-in runtime's private CAS sequence (§9 decision):
    /// the source never wires a CAS id into the item at all, so this
    /// crate-internal monotonic counter stands in for it.
    pub fn next_cas(&mut self) -> u64 {
        let cas = self.next_cas;
        self.next_cas = self.next_cas.wrapping_add(1);
        cas
    }

    /// Mirrors memcached's `flush_all`: every live entry is dropped
    /// regardless of expiry. Reuses `HashMap::delete_expired`'s walk by
    /// passing the `NEVER` sentinel as `now`, since every finite expiry
    /// (and `NEVER` itself) compares `<=` to it.
    pub fn flush_all(&mut self) -> u64 {
        let segments = &mut self.segments;
        let chunkpool = &mut self.chunkpool;
        self.map.delete_expired(crate::clock::NEVER, |item| {
            let data = item.take_data();
            data.delete(segments, chunkpool, None);
        })
    }

    /// Mirrors `chunkpoolGC`'s housekeeping-timer gate in `cacheismo.c`:
    /// free bytes > region/8 and mean free-chunk size < 256 bytes.
    pub fn housekeeping(&mut self) {
        let now = self.clock.now_secs();
        let segments = &mut self.segments;
        let chunkpool = &mut self.chunkpool;
        self.map.delete_expired(now, |item| {
            let data = item.take_data();
            data.delete(segments, chunkpool, None);
        });
        if self.chunkpool.needs_gc() {
            self.chunkpool.gc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_cas_is_monotonic() {
        let mut ctx = CoreContext::new(4, 16, CoreConfig { virtual_keys: false, idle_timeout_secs: None });
        assert_eq!(ctx.next_cas(), 1);
        assert_eq!(ctx.next_cas(), 2);
        assert_eq!(ctx.next_cas(), 3);
    }

    #[test]
    fn housekeeping_runs_without_panicking_on_empty_map() {
        let mut ctx = CoreContext::new(4, 16, CoreConfig { virtual_keys: false, idle_timeout_secs: None });
        ctx.housekeeping();
        assert_eq!(ctx.map.len(), 0);
    }
}
