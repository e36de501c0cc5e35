//! Cache item: key + flags + expiry + refcount + value data stream (§3,
//! §4.6).
//!
//! Grounded on `original_source/src/cacheitem/cacheitem.c`:
//! `cacheItemCreate`/`cacheItemDelete`/refcount semantics, and
//! `cacheItemGetHashEntryAPI`'s function-pointer vtable, reinterpreted as
//! an implementation of `crate::hashmap::HashEntry` (§9: a vtable of
//! function pointers becomes a Rust trait).
//!
//! The source stores the value directly as a `dataStream_t` "because
//! refcount is maintained both at item level and buffers inside the
//! dataStream... I wanted the data to have a separate lifetime from the
//! item itself" (see the source's own comment) — the Rust port keeps this
//! exactly: an item's `DataStream` is deleted independently of the item
//! (by whoever holds the `DataStream` last), not implicitly by the item's
//! own `Drop`, since `DataStream::delete` needs `&mut ChunkPool` in hand.

use crate::chunkpool::ChunkPool;
use crate::command::Command;
use crate::datastream::{DataStream, SegmentTable};
use crate::hashmap::HashEntry;
use std::cell::Cell;

/// Cache item refcount is tracked with interior mutability because
/// `HashEntry::add_reference` (called from inside `HashMap::get`, which
/// only has `&self` on the stored value once the lookup succeeds) must be
/// able to bump it without a `&mut` borrow into the map's entry arena.
pub struct CacheItem {
    key: Vec<u8>,
    flags: u32,
    expiry: u32,
    data_length: u32,
    data: DataStream,
    refcount: Cell<u32>,
    cas: Cell<u64>,
}

impl CacheItem {
    /// Mirrors `cacheItemCreate`: packs the command's payload into the
    /// chunk allocator as a persistent stream. Fails with
    /// `ChunkPoolError::TooLarge`/`OutOfMemory` bubbled up through
    /// `DataStream::clone_into_chunkpool`/`SegmentTable::new_chunk_segment`.
    ///
    /// `cas` is a value the caller draws from its own monotonic counter
    /// (§9 open question: the source never wires a CAS id into the item,
    /// so the built-in runtime maintains one itself).
    pub fn create(
        table: &mut SegmentTable,
        chunkpool: &mut ChunkPool,
        arena: Option<&crate::fallocator::Arena>,
        clock: &crate::clock::Clock,
        command: &Command,
        payload: &DataStream,
        cas: u64,
    ) -> crate::error::Result<CacheItem> {
        let data = payload.clone_into_chunkpool(table, chunkpool, arena)?;
        let expiry = crate::clock::expiry_from_ttl(clock, command.exptime);
        Ok(CacheItem {
            key: command.key.clone(),
            flags: command.flags,
            expiry,
            data_length: payload.total_size() as u32,
            data,
            refcount: Cell::new(1),
            cas: Cell::new(cas),
        })
    }

    pub fn cas(&self) -> u64 {
        self.cas.get()
    }

    /// Builds an item directly from already-packed persistent data, for
    /// verbs that mutate an existing item's value without going through a
    /// freshly parsed `Command` (`append`, `prepend`, `incr`, `decr`).
    pub fn with_data(key: Vec<u8>, flags: u32, expiry: u32, data: DataStream, cas: u64) -> CacheItem {
        let data_length = data.total_size() as u32;
        CacheItem { key, flags, expiry, data_length, data, refcount: Cell::new(1), cas: Cell::new(cas) }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn expiry(&self) -> u32 {
        self.expiry
    }

    pub fn data_length(&self) -> u32 {
        self.data_length
    }

    pub fn data(&self) -> &DataStream {
        &self.data
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.get()
    }

    /// Mirrors `cacheItemGetTotalSize`: the estimated memory footprint used
    /// by LRU/eviction accounting, not the wire `dataLength`.
    pub fn total_size(&self) -> usize {
        std::mem::size_of::<CacheItem>() + self.key.len() + 1 + self.data.total_size()
    }

    /// Mirrors `cacheItemDelete`'s refcount decrement. Returns `true` once
    /// the refcount reaches zero, at which point the caller must reclaim
    /// `self.data` via `DataStream::delete` (and drop `self`) since neither
    /// can free itself without `&mut ChunkPool` in hand.
    pub fn release(&self) -> bool {
        let next = self.refcount.get() - 1;
        self.refcount.set(next);
        next == 0
    }

    pub fn take_data(self) -> DataStream {
        self.data
    }
}

impl HashEntry for CacheItem {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn expiry(&self) -> u32 {
        self.expiry
    }

    fn total_size(&self) -> usize {
        self.total_size()
    }

    fn add_reference(&self) {
        self.refcount.set(self.refcount.get() + 1);
    }
}

/// Estimate the memory an item built from `command` would occupy, used by
/// the admission retry loop (§4.6) before the item actually exists.
/// Mirrors `cacheItemEstimateSize`.
pub fn estimate_size(command: &Command, payload_len: usize) -> usize {
    std::mem::size_of::<CacheItem>() + command.key.len() + 1 + payload_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandKind};
    use crate::fallocator::{Arena, PageCache};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn harness() -> (SegmentTable, ChunkPool, Arena) {
        let cache = Rc::new(RefCell::new(PageCache::new(16)));
        (SegmentTable::new(), ChunkPool::new(4), Arena::new(cache))
    }

    #[test]
    fn create_packs_payload_into_chunkpool() {
        let (mut table, mut chunkpool, mut arena) = harness();
        let mut payload = DataStream::new_ephemeral();
        payload.append_new_ephemeral(&mut table, &mut arena, b"hello").unwrap();

        let mut command = Command::new(CommandKind::Set);
        command.key = b"foo".to_vec();
        command.flags = 7;
        command.exptime = 0;

        let clock = crate::clock::Clock::new();
        let item = CacheItem::create(&mut table, &mut chunkpool, Some(&arena), &clock, &command, &payload, 1).unwrap();
        assert_eq!(item.key(), b"foo");
        assert_eq!(item.flags(), 7);
        assert_eq!(item.expiry(), crate::clock::NEVER);
        assert!(item.data().is_persistent());
        assert_eq!(item.data().total_size(), 5);
        assert_eq!(item.cas(), 1);
    }

    #[test]
    fn release_reaches_zero_after_matching_add_reference() {
        let (mut table, mut chunkpool, arena) = harness();
        let mut payload = DataStream::new_ephemeral();
        let mut arena = arena;
        payload.append_new_ephemeral(&mut table, &mut arena, b"x").unwrap();
        let mut command = Command::new(CommandKind::Set);
        command.key = b"k".to_vec();
        let clock = crate::clock::Clock::new();
        let item = CacheItem::create(&mut table, &mut chunkpool, Some(&arena), &clock, &command, &payload, 1).unwrap();

        item.add_reference();
        assert_eq!(item.refcount(), 2);
        assert!(!item.release());
        assert!(item.release());
    }
}
