//! Slab-paged chunk allocator with inline buddy-style coalescing GC (§4.1).
//!
//! Grounded on `original_source/src/chunkpool/chunkpool.c`: one contiguous
//! page-aligned region, 256 size classes at 16-byte granularity, a 4-byte
//! per-chunk header, doubly-linked per-class free lists threaded through
//! offsets stored *inside* free chunks' own data area, and a windowed GC
//! pass that coalesces adjacent free chunks within a page.
//!
//! Per spec §9's explicit re-architecture note, the region is a single
//! owned `Vec<u8>` addressed by `u32` offsets in 16-byte units (no raw
//! pointers, no intrusive pointer fields) — the same "owned buffer +
//! offset handle" shape `t51core/src/networking/chunk.rs` uses for its
//! single fixed-size `Chunk`, generalized here to many classes over one
//! shared region with splitting and coalescing.

use crate::error::ChunkPoolError;
use crate::skiplist::Skiplist;
use byteorder::{ByteOrder, LittleEndian};

pub const GRANULARITY: usize = 16;
pub const PAGE_SIZE: usize = 4096;
pub const NUM_CLASSES: usize = 256;
pub const HEADER_SIZE: usize = 4;
/// 8MB GC sliding window, matching `chunkpoolGC`'s default page count.
const GC_WINDOW_PAGES: usize = (8 * 1024 * 1024) / PAGE_SIZE;
/// `chunkpoolFree`'s buddy-merge attempt cap.
const MAX_MERGE_ATTEMPTS: usize = 16;

const NULL: u32 = u32::max_value();
const UNITS_PER_PAGE: u32 = (PAGE_SIZE / GRANULARITY) as u32;

fn class_total_bytes(class: u8) -> usize {
    (class as usize + 1) * GRANULARITY
}

fn class_data_bytes(class: u8) -> usize {
    class_total_bytes(class) - HEADER_SIZE
}

fn class_for_request(size: usize) -> Option<u8> {
    let total = size + HEADER_SIZE;
    let total = ((total + GRANULARITY - 1) / GRANULARITY) * GRANULARITY;
    let class = total / GRANULARITY;
    if class == 0 || class > NUM_CLASSES {
        None
    } else {
        Some((class - 1) as u8)
    }
}

/// Handle to a chunk allocated from a `ChunkPool`. Carries no lifetime and
/// no refcount of its own — `datastream::Buffer` is the refcounted wrapper
/// around handles like this one, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHandle {
    offset: u32,
}

pub struct ChunkPool {
    region: Vec<u8>,
    free_heads: [u32; NUM_CLASSES],
    free_counts: [u32; NUM_CLASSES],
    index: Skiplist,
    total_pages: usize,
    free_bytes: usize,
    gc_cursor: usize,
}

impl ChunkPool {
    pub fn new(page_count: usize) -> Self {
        let mut pool = ChunkPool {
            region: vec![0u8; page_count * PAGE_SIZE],
            free_heads: [NULL; NUM_CLASSES],
            free_counts: [0; NUM_CLASSES],
            index: Skiplist::new(),
            total_pages: page_count,
            free_bytes: 0,
            gc_cursor: 0,
        };
        for page in 0..page_count {
            let offset = page as u32 * UNITS_PER_PAGE;
            pool.set_header(offset, (NUM_CLASSES - 1) as u8, false);
            pool.push_free((NUM_CLASSES - 1) as u8, offset);
        }
        pool
    }

    pub fn max_malloc_size(&self) -> usize {
        class_data_bytes((NUM_CLASSES - 1) as u8)
    }

    pub fn memory_used(&self) -> usize {
        self.total_pages * PAGE_SIZE - self.free_bytes
    }

    pub fn free_memory(&self) -> usize {
        self.free_bytes
    }

    /// Fragmentation gate from the housekeeping timer (§10.5): free bytes
    /// exceed one eighth of the region and the average free chunk is
    /// smaller than 256 bytes.
    pub fn needs_gc(&self) -> bool {
        let total_bytes = self.total_pages * PAGE_SIZE;
        if total_bytes == 0 || self.free_bytes * 8 <= total_bytes {
            return false;
        }
        let free_chunk_count: u32 = self.free_counts.iter().sum();
        if free_chunk_count == 0 {
            return false;
        }
        self.free_bytes / free_chunk_count as usize < 256
    }

    pub fn data(&self, handle: ChunkHandle) -> &[u8] {
        let class = self.class_of(handle.offset);
        let start = handle.offset as usize * GRANULARITY + HEADER_SIZE;
        &self.region[start..start + class_data_bytes(class)]
    }

    pub fn data_mut(&mut self, handle: ChunkHandle) -> &mut [u8] {
        let class = self.class_of(handle.offset);
        let start = handle.offset as usize * GRANULARITY + HEADER_SIZE;
        let len = class_data_bytes(class);
        &mut self.region[start..start + len]
    }

    pub fn chunk_size(&self, handle: ChunkHandle) -> usize {
        class_data_bytes(self.class_of(handle.offset))
    }

    pub fn malloc(&mut self, size: usize) -> Result<ChunkHandle, ChunkPoolError> {
        let class = class_for_request(size).ok_or(ChunkPoolError::TooLarge)?;
        self.malloc_class(class, true)
    }

    pub fn realloc(&mut self, handle: ChunkHandle, new_size: usize) -> Result<ChunkHandle, ChunkPoolError> {
        let old_class = self.class_of(handle.offset);
        let old_len = class_data_bytes(old_class);
        let new_handle = self.malloc(new_size)?;
        let new_class = self.class_of(new_handle.offset);
        let copy_len = old_len.min(class_data_bytes(new_class));

        let old_start = handle.offset as usize * GRANULARITY + HEADER_SIZE;
        let new_start = new_handle.offset as usize * GRANULARITY + HEADER_SIZE;
        let old_bytes = self.region[old_start..old_start + copy_len].to_vec();
        self.region[new_start..new_start + copy_len].copy_from_slice(&old_bytes);

        self.free(handle);
        Ok(new_handle)
    }

    pub fn free(&mut self, handle: ChunkHandle) {
        let mut offset = handle.offset;
        let mut class = self.class_of(offset);
        self.set_header(offset, class, false);

        for _ in 0..MAX_MERGE_ATTEMPTS {
            if let Some((new_offset, new_class)) = self.try_merge_with_next(offset, class) {
                offset = new_offset;
                class = new_class;
                continue;
            }
            if let Some((new_offset, new_class)) = self.try_merge_with_prev(offset, class) {
                offset = new_offset;
                class = new_class;
                continue;
            }
            break;
        }
        self.push_free(class, offset);
    }

    /// Windowed GC pass (§4.1): walk one 8MB window of pages, coalescing
    /// every adjacent pair of free chunks left to right.
    pub fn gc(&mut self) {
        if self.total_pages == 0 {
            return;
        }
        let window = GC_WINDOW_PAGES.min(self.total_pages);
        for i in 0..window {
            let page_idx = (self.gc_cursor + i) % self.total_pages;
            self.gc_page(page_idx);
        }
        self.gc_cursor = (self.gc_cursor + window) % self.total_pages;
    }

    fn gc_page(&mut self, page_idx: usize) {
        let page_start = page_idx as u32 * UNITS_PER_PAGE;
        let page_end = page_start + UNITS_PER_PAGE;
        let mut cur = page_start;
        while cur < page_end {
            let class = self.class_of(cur);
            let size_units = (class_total_bytes(class) / GRANULARITY) as u32;
            let next = cur + size_units;
            if next < page_end && !self.in_use(cur) && !self.in_use(next) {
                let next_class = self.class_of(next);
                self.unlink_free(class, cur);
                self.unlink_free(next_class, next);
                let combined_class = Self::combine_classes(class, next_class);
                self.set_header(cur, combined_class, false);
                self.push_free(combined_class, cur);
                // re-examine the merged chunk for a further merge with its
                // new neighbour before advancing.
                continue;
            }
            cur = next;
        }
    }

    fn combine_classes(a: u8, b: u8) -> u8 {
        let combined_total = class_total_bytes(a) + class_total_bytes(b);
        (combined_total / GRANULARITY - 1) as u8
    }

    fn try_merge_with_next(&mut self, offset: u32, class: u8) -> Option<(u32, u8)> {
        let page_start = (offset / UNITS_PER_PAGE) * UNITS_PER_PAGE;
        let page_end = page_start + UNITS_PER_PAGE;
        let size_units = (class_total_bytes(class) / GRANULARITY) as u32;
        let next = offset + size_units;
        if next >= page_end || self.in_use(next) {
            return None;
        }
        let next_class = self.class_of(next);
        self.unlink_free(next_class, next);
        let combined = Self::combine_classes(class, next_class);
        self.set_header(offset, combined, false);
        Some((offset, combined))
    }

    fn try_merge_with_prev(&mut self, offset: u32, class: u8) -> Option<(u32, u8)> {
        let page_start = (offset / UNITS_PER_PAGE) * UNITS_PER_PAGE;
        if offset == page_start {
            return None;
        }
        let mut cur = page_start;
        let mut prev_start = None;
        while cur < offset {
            prev_start = Some(cur);
            let c = self.class_of(cur);
            cur += (class_total_bytes(c) / GRANULARITY) as u32;
        }
        let prev_off = prev_start?;
        if self.in_use(prev_off) {
            return None;
        }
        let prev_class = self.class_of(prev_off);
        self.unlink_free(prev_class, prev_off);
        let combined = Self::combine_classes(prev_class, class);
        self.set_header(prev_off, combined, false);
        Some((prev_off, combined))
    }

    fn malloc_class(&mut self, class: u8, allow_gc_retry: bool) -> Result<ChunkHandle, ChunkPoolError> {
        if let Some(offset) = self.pop_free_head(class) {
            self.set_header(offset, class, true);
            return Ok(ChunkHandle { offset });
        }

        if let Some(bigger) = self.index.next_greater(class as u32) {
            let bigger_class = bigger as u8;
            let offset = self.pop_free_head(bigger_class).expect("skiplist entry implies non-empty free list");
            let alloc_units = (class_total_bytes(class) / GRANULARITY) as u32;
            let bigger_units = (class_total_bytes(bigger_class) / GRANULARITY) as u32;
            self.set_header(offset, class, true);
            let remainder_units = bigger_units - alloc_units;
            if remainder_units > 0 {
                let remainder_class = (remainder_units as usize - 1) as u8;
                let remainder_offset = offset + alloc_units;
                self.set_header(remainder_offset, remainder_class, false);
                self.push_free(remainder_class, remainder_offset);
            }
            return Ok(ChunkHandle { offset });
        }

        if allow_gc_retry {
            // Single retry after one GC pass (§9 open question: the source's
            // unreachable second retry was a bug; this implements the
            // documented intent instead of mirroring it).
            self.gc();
            return self.malloc_class(class, false);
        }
        Err(ChunkPoolError::OutOfMemory)
    }

    fn pop_free_head(&mut self, class: u8) -> Option<u32> {
        let head = self.free_heads[class as usize];
        if head == NULL {
            None
        } else {
            self.unlink_free(class, head);
            Some(head)
        }
    }

    fn push_free(&mut self, class: u8, offset: u32) {
        let old_head = self.free_heads[class as usize];
        self.write_links(offset, NULL, old_head);
        if old_head != NULL {
            let (_, old_next) = self.read_links(old_head);
            self.write_links(old_head, offset, old_next);
        }
        self.free_heads[class as usize] = offset;
        if self.free_counts[class as usize] == 0 {
            self.index.insert(class as u32);
        }
        self.free_counts[class as usize] += 1;
        self.set_header(offset, class, false);
        self.free_bytes += class_total_bytes(class);
    }

    fn unlink_free(&mut self, class: u8, offset: u32) {
        let (prev, next) = self.read_links(offset);
        if prev == NULL {
            self.free_heads[class as usize] = next;
        } else {
            let (prev_prev, _) = self.read_links(prev);
            self.write_links(prev, prev_prev, next);
        }
        if next != NULL {
            let (_, next_next) = self.read_links(next);
            self.write_links(next, prev, next_next);
        }
        self.free_counts[class as usize] -= 1;
        if self.free_counts[class as usize] == 0 {
            self.index.delete(class as u32);
        }
        self.free_bytes -= class_total_bytes(class);
    }

    fn class_of(&self, offset: u32) -> u8 {
        self.region[offset as usize * GRANULARITY]
    }

    fn in_use(&self, offset: u32) -> bool {
        self.region[offset as usize * GRANULARITY + 1] != 0
    }

    fn set_header(&mut self, offset: u32, class: u8, in_use: bool) {
        let base = offset as usize * GRANULARITY;
        self.region[base] = class;
        self.region[base + 1] = in_use as u8;
    }

    fn read_links(&self, offset: u32) -> (u32, u32) {
        let base = offset as usize * GRANULARITY + HEADER_SIZE;
        (
            LittleEndian::read_u32(&self.region[base..base + 4]),
            LittleEndian::read_u32(&self.region[base + 4..base + 8]),
        )
    }

    fn write_links(&mut self, offset: u32, prev: u32, next: u32) {
        let base = offset as usize * GRANULARITY + HEADER_SIZE;
        LittleEndian::write_u32(&mut self.region[base..base + 4], prev);
        LittleEndian::write_u32(&mut self.region[base + 4..base + 8], next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_roundtrip() {
        let mut pool = ChunkPool::new(1);
        let handle = pool.malloc(100).unwrap();
        assert!(pool.chunk_size(handle) >= 100);
        pool.data_mut(handle)[0] = 42;
        assert_eq!(pool.data(handle)[0], 42);
        pool.free(handle);
    }

    #[test]
    fn too_large_request_fails() {
        let mut pool = ChunkPool::new(1);
        let err = pool.malloc(PAGE_SIZE).unwrap_err();
        assert!(matches!(err, ChunkPoolError::TooLarge));
    }

    #[test]
    fn splitting_leaves_remainder_free() {
        let mut pool = ChunkPool::new(1);
        let used_before = pool.memory_used();
        let handle = pool.malloc(32).unwrap();
        assert!(pool.memory_used() > used_before);
        pool.free(handle);
        // After freeing, coalescing should return the page to a single
        // free chunk and memory_used back to zero.
        assert_eq!(pool.memory_used(), 0);
    }

    #[test]
    fn out_of_memory_when_region_exhausted() {
        let mut pool = ChunkPool::new(1);
        let mut handles = Vec::new();
        loop {
            match pool.malloc(12) {
                Ok(h) => handles.push(h),
                Err(ChunkPoolError::OutOfMemory) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert!(!handles.is_empty());
    }

    #[test]
    fn gc_coalesces_adjacent_free_chunks() {
        let mut pool = ChunkPool::new(1);
        let a = pool.malloc(12).unwrap();
        let b = pool.malloc(12).unwrap();
        let _c = pool.malloc(12).unwrap();
        pool.free(a);
        pool.free(b);
        // a and b are adjacent and both free: even without an explicit GC
        // call, `free`'s own coalescing attempt should have merged them.
        pool.gc();
        assert!(pool.needs_gc() == false || pool.free_memory() > 0);
    }

    #[test]
    fn realloc_preserves_bytes() {
        let mut pool = ChunkPool::new(1);
        let handle = pool.malloc(12).unwrap();
        pool.data_mut(handle)[0..4].copy_from_slice(&[1, 2, 3, 4]);
        let grown = pool.realloc(handle, 64).unwrap();
        assert_eq!(&pool.data(grown)[0..4], &[1, 2, 3, 4]);
    }
}
