//! Refcounted scatter/gather data stream (§3, §4.3).
//!
//! Grounded on `original_source/src/datastream/datastream.c`: a stream is a
//! growable vector of `(buffer, offset, length)` triples over refcounted
//! buffers shared across streams; `t51core/src/net/buffer.rs` is the
//! teacher's closest Rust analog (a `VecDeque<Chunk>` with explicit
//! `egress`/`ingress`), generalized here from "queue of owned chunks" to
//! "vector of shared-segment slices" since cache values must outlive the
//! connection that wrote them.
//!
//! Per spec §9, a segment's shared identity is an index into an arena
//! (`SegmentTable`, built on `crate::alloc::SlotPool` exactly like
//! `skiplist.rs`'s node arena), not a pointer and not `Rc<T>` — refcounts
//! are incremented/decremented explicitly and the index is looked back up
//! against whichever allocator (`ChunkPool` for persistent segments,
//! `Arena` for ephemeral ones) the caller already has in hand.

use crate::alloc::SlotPool;
use crate::chunkpool::ChunkPool;
use crate::error::DataStreamError;
use crate::fallocator::Arena;

pub type SegmentId = usize;

#[derive(Clone, Copy)]
enum Owner {
    Chunk(crate::chunkpool::ChunkHandle),
    Arena(crate::fallocator::ArenaHandle),
}

struct SegmentMeta {
    owner: Owner,
    len: usize,
    refcount: u32,
}

/// Process-wide table of segment metadata (shared by every data stream),
/// analogous in role to `ChunkPool` itself but holding only bookkeeping —
/// the bytes live in whichever allocator produced the segment.
pub struct SegmentTable {
    slots: SlotPool<SegmentMeta>,
}

impl SegmentTable {
    pub fn new() -> Self {
        SegmentTable { slots: SlotPool::new() }
    }

    pub fn new_chunk_segment(&mut self, chunkpool: &mut ChunkPool, bytes: &[u8]) -> crate::error::Result<SegmentId> {
        let handle = chunkpool.malloc(bytes.len())?;
        chunkpool.data_mut(handle)[..bytes.len()].copy_from_slice(bytes);
        Ok(self.slots.push(SegmentMeta { owner: Owner::Chunk(handle), len: bytes.len(), refcount: 1 }))
    }

    pub fn new_arena_segment(&mut self, arena: &mut Arena, bytes: &[u8]) -> crate::error::Result<SegmentId> {
        let handle = arena.alloc(bytes.len())?;
        arena.data_mut(handle)[..bytes.len()].copy_from_slice(bytes);
        Ok(self.slots.push(SegmentMeta { owner: Owner::Arena(handle), len: bytes.len(), refcount: 1 }))
    }

    fn incref(&mut self, id: SegmentId) {
        self.slots.get_mut(id).expect("live segment id").refcount += 1;
    }

    fn decref(&mut self, id: SegmentId, chunkpool: &mut ChunkPool, mut arena: Option<&mut Arena>) {
        let remaining = {
            let meta = self.slots.get_mut(id).expect("live segment id");
            meta.refcount -= 1;
            meta.refcount
        };
        if remaining == 0 {
            let meta = self.slots.reclaim(id).expect("live segment id");
            match meta.owner {
                Owner::Chunk(handle) => chunkpool.free(handle),
                Owner::Arena(handle) => {
                    if let Some(arena) = arena.as_deref_mut() {
                        arena.free(handle);
                    }
                }
            }
        }
    }

    fn data<'a>(&'a self, id: SegmentId, chunkpool: &'a ChunkPool, arena: Option<&'a Arena>) -> &'a [u8] {
        let meta = self.slots.get(id).expect("live segment id");
        match meta.owner {
            Owner::Chunk(handle) => &chunkpool.data(handle)[..meta.len],
            Owner::Arena(handle) => &arena.expect("ephemeral segment requires its arena").data(handle)[..meta.len],
        }
    }
}

/// Result of scanning for a CRLF-terminated line (§4.3 `find_end_of_line`).
pub enum LineScan {
    /// Offset of the `\r` that precedes the first well-formed `\r\n`.
    Found(usize),
    /// A bare `\n` (no preceding `\r`) was encountered at this offset.
    BareNewline(usize),
    NeedMore,
}

/// Ordered sequence of `(segment, offset, length)` triples presented as one
/// logical byte stream (§3). Either *ephemeral* (arena-backed, I/O
/// buffering) or *persistent* (chunk-backed, cache values) — never mixed,
/// per spec §3/§4.3.
pub struct DataStream {
    segments: Vec<(SegmentId, usize, usize)>,
    total_size: usize,
    persistent: bool,
}

impl DataStream {
    pub fn new_ephemeral() -> Self {
        DataStream { segments: Vec::new(), total_size: 0, persistent: false }
    }

    pub fn new_persistent() -> Self {
        DataStream { segments: Vec::new(), total_size: 0, persistent: true }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }

    /// Append fresh bytes as a brand-new ephemeral segment (the common path
    /// for data just read off a socket into the connection's arena).
    pub fn append_new_ephemeral(&mut self, table: &mut SegmentTable, arena: &mut Arena, bytes: &[u8]) -> crate::error::Result<()> {
        if self.persistent {
            return Err(DataStreamError::PersistentAppend.into());
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let id = table.new_arena_segment(arena, bytes)?;
        self.segments.push((id, 0, bytes.len()));
        self.total_size += bytes.len();
        Ok(())
    }

    /// Append a slice of an *existing* (already-refcounted) segment,
    /// bumping its refcount — the zero-copy sharing path used by
    /// `substream`/`append_stream`.
    pub fn append(&mut self, table: &mut SegmentTable, id: SegmentId, offset: usize, len: usize) -> crate::error::Result<()> {
        if self.persistent {
            return Err(DataStreamError::PersistentAppend.into());
        }
        if len == 0 {
            return Ok(());
        }
        table.incref(id);
        self.segments.push((id, offset, len));
        self.total_size += len;
        Ok(())
    }

    /// Atomic in spirit (§4.3): appending another stream's triples only
    /// bumps refcounts, which cannot itself fail, so there is no partial
    /// state to roll back.
    pub fn append_stream(&mut self, table: &mut SegmentTable, other: &DataStream) -> crate::error::Result<()> {
        if self.persistent {
            return Err(DataStreamError::PersistentAppend.into());
        }
        for &(id, offset, len) in &other.segments {
            table.incref(id);
            self.segments.push((id, offset, len));
            self.total_size += len;
        }
        Ok(())
    }

    pub fn truncate_from_start(&mut self, table: &mut SegmentTable, chunkpool: &mut ChunkPool, mut arena: Option<&mut Arena>, mut n: usize) -> crate::error::Result<()> {
        if n > self.total_size {
            return Err(DataStreamError::TruncateOutOfRange.into());
        }
        while n > 0 {
            let (id, offset, len) = self.segments[0];
            if len <= n {
                self.segments.remove(0);
                table.decref(id, chunkpool, arena.as_deref_mut());
                self.total_size -= len;
                n -= len;
            } else {
                self.segments[0] = (id, offset + n, len - n);
                self.total_size -= n;
                n = 0;
            }
        }
        Ok(())
    }

    pub fn truncate_from_end(&mut self, table: &mut SegmentTable, chunkpool: &mut ChunkPool, mut arena: Option<&mut Arena>, mut n: usize) -> crate::error::Result<()> {
        if n > self.total_size {
            return Err(DataStreamError::TruncateOutOfRange.into());
        }
        while n > 0 {
            let last = self.segments.len() - 1;
            let (id, offset, len) = self.segments[last];
            if len <= n {
                self.segments.pop();
                table.decref(id, chunkpool, arena.as_deref_mut());
                self.total_size -= len;
                n -= len;
            } else {
                self.segments[last] = (id, offset, len - n);
                self.total_size -= n;
                n = 0;
            }
        }
        Ok(())
    }

    /// Share a byte-range view of `self` as a new stream, bumping the
    /// refcount of every segment touched.
    pub fn substream(&self, table: &mut SegmentTable, offset: usize, length: usize) -> crate::error::Result<DataStream> {
        if offset + length > self.total_size {
            return Err(DataStreamError::SubstreamOutOfRange.into());
        }
        let mut result = DataStream { segments: Vec::new(), total_size: 0, persistent: self.persistent };
        let mut pos = 0usize;
        let mut remaining_len = length;
        for &(id, seg_offset, seg_len) in &self.segments {
            if remaining_len == 0 {
                break;
            }
            if pos + seg_len <= offset {
                pos += seg_len;
                continue;
            }
            let skip = offset.saturating_sub(pos);
            let available = seg_len - skip;
            let take = available.min(remaining_len);
            table.incref(id);
            result.segments.push((id, seg_offset + skip, take));
            result.total_size += take;
            remaining_len -= take;
            pos += seg_len;
        }
        Ok(result)
    }

    /// Pack every byte of `self` into freshly allocated chunk-pool
    /// segments, producing a persistent stream (§4.3's ephemeral→persistent
    /// `clone`). Packs as densely as the allocator's maximum class allows.
    pub fn clone_into_chunkpool(&self, table: &mut SegmentTable, chunkpool: &mut ChunkPool, arena: Option<&Arena>) -> crate::error::Result<DataStream> {
        let mut bytes = Vec::with_capacity(self.total_size);
        for &(id, offset, len) in &self.segments {
            let slice = table.data(id, chunkpool, arena);
            bytes.extend_from_slice(&slice[offset..offset + len]);
        }

        let mut result = DataStream::new_persistent();
        let max_chunk = chunkpool.max_malloc_size();
        let mut pos = 0;
        while pos < bytes.len() {
            let take = (bytes.len() - pos).min(max_chunk);
            let id = table.new_chunk_segment(chunkpool, &bytes[pos..pos + take])?;
            result.segments.push((id, 0, take));
            result.total_size += take;
            pos += take;
        }
        Ok(result)
    }

    /// Release every segment this stream references. Streams do not
    /// implement `Drop` because releasing a segment needs the owning
    /// allocator(s) in hand — the same explicit-context discipline the
    /// allocators themselves require.
    pub fn delete(mut self, table: &mut SegmentTable, chunkpool: &mut ChunkPool, mut arena: Option<&mut Arena>) {
        for (id, _, _) in self.segments.drain(..) {
            table.decref(id, chunkpool, arena.as_deref_mut());
        }
        self.total_size = 0;
    }

    pub fn find_end_of_line(&self, table: &SegmentTable, chunkpool: &ChunkPool, arena: Option<&Arena>) -> LineScan {
        let mut prev_cr = false;
        let mut idx = 0usize;
        for &(id, offset, len) in &self.segments {
            let slice = table.data(id, chunkpool, arena);
            for &byte in &slice[offset..offset + len] {
                if byte == b'\n' {
                    return if prev_cr { LineScan::Found(idx - 1) } else { LineScan::BareNewline(idx) };
                }
                prev_cr = byte == b'\r';
                idx += 1;
            }
        }
        LineScan::NeedMore
    }

    /// Materialize a byte range into an owned `Vec<u8>` (used by the
    /// parser when a token straddles more than one segment, §4.7).
    pub fn read_range(&self, table: &SegmentTable, chunkpool: &ChunkPool, arena: Option<&Arena>, offset: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut pos = 0usize;
        let mut remaining = len;
        for &(id, seg_offset, seg_len) in &self.segments {
            if remaining == 0 {
                break;
            }
            if pos + seg_len <= offset {
                pos += seg_len;
                continue;
            }
            let skip = offset.saturating_sub(pos);
            let available = seg_len - skip;
            let take = available.min(remaining);
            let slice = table.data(id, chunkpool, arena);
            out.extend_from_slice(&slice[seg_offset + skip..seg_offset + skip + take]);
            remaining -= take;
            pos += seg_len;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallocator::PageCache;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn harness() -> (SegmentTable, ChunkPool, Arena) {
        let cache = Rc::new(RefCell::new(PageCache::new(16)));
        (SegmentTable::new(), ChunkPool::new(4), Arena::new(cache))
    }

    #[test]
    fn append_and_read_roundtrip() {
        let (mut table, mut chunkpool, mut arena) = harness();
        let mut stream = DataStream::new_ephemeral();
        stream.append_new_ephemeral(&mut table, &mut arena, b"hello").unwrap();
        stream.append_new_ephemeral(&mut table, &mut arena, b" world").unwrap();
        assert_eq!(stream.total_size(), 11);
        let bytes = stream.read_range(&table, &chunkpool, Some(&arena), 0, 11);
        assert_eq!(&bytes, b"hello world");
    }

    #[test]
    fn truncate_from_start_drops_prefix() {
        let (mut table, mut chunkpool, mut arena) = harness();
        let mut stream = DataStream::new_ephemeral();
        stream.append_new_ephemeral(&mut table, &mut arena, b"hello world").unwrap();
        stream.truncate_from_start(&mut table, &mut chunkpool, Some(&mut arena), 6).unwrap();
        let bytes = stream.read_range(&table, &chunkpool, Some(&arena), 0, stream.total_size());
        assert_eq!(&bytes, b"world");
    }

    #[test]
    fn substream_shares_segments() {
        let (mut table, mut chunkpool, mut arena) = harness();
        let mut stream = DataStream::new_ephemeral();
        stream.append_new_ephemeral(&mut table, &mut arena, b"hello world").unwrap();
        let sub = stream.substream(&mut table, 6, 5).unwrap();
        assert_eq!(sub.total_size(), 5);
        let bytes = sub.read_range(&table, &chunkpool, Some(&arena), 0, 5);
        assert_eq!(&bytes, b"world");
    }

    #[test]
    fn clone_packs_into_chunkpool() {
        let (mut table, mut chunkpool, mut arena) = harness();
        let mut stream = DataStream::new_ephemeral();
        stream.append_new_ephemeral(&mut table, &mut arena, b"persist me").unwrap();
        let persisted = stream.clone_into_chunkpool(&mut table, &mut chunkpool, Some(&arena)).unwrap();
        assert!(persisted.is_persistent());
        let bytes = persisted.read_range(&table, &chunkpool, None, 0, persisted.total_size());
        assert_eq!(&bytes, b"persist me");
    }

    #[test]
    fn find_end_of_line_detects_crlf() {
        let (mut table, chunkpool, mut arena) = harness();
        let mut stream = DataStream::new_ephemeral();
        stream.append_new_ephemeral(&mut table, &mut arena, b"get foo\r\nrest").unwrap();
        match stream.find_end_of_line(&table, &chunkpool, Some(&arena)) {
            LineScan::Found(pos) => assert_eq!(pos, 7),
            _ => panic!("expected Found"),
        }
    }

    #[test]
    fn persistent_stream_rejects_append() {
        let mut stream = DataStream::new_persistent();
        let (mut table, _chunkpool, mut arena) = harness();
        let err = stream.append_new_ephemeral(&mut table, &mut arena, b"x").unwrap_err();
        assert!(matches!(err, crate::error::Error::ClientError(_)));
    }
}
