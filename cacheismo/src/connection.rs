//! Per-connection state (§3 "Connection context", §4.8).
//!
//! Grounded on `original_source/src/driver/driver.c`'s `connectionContext_t`
//! (read/write streams, parser, fallocator, `isWriting` flag) and
//! `original_source/src/io/connection.c`'s non-blocking read/write helpers
//! (`connectionRead`'s 8 KB-per-wakeup loop, `connectionWriteHelper`'s
//! `sendmsg`-equivalent batching), reimplemented against
//! `mio::net::TcpStream` instead of raw `fd`/`libevent` plumbing.

use crate::datastream::{DataStream, SegmentTable};
use crate::error::ConnectionError;
use crate::fallocator::{Arena, PageCache};
use crate::parser::RequestParser;
use mio::net::TcpStream;
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Instant;

/// Bytes read from the socket per readiness wakeup, mirroring
/// `connectionRead`'s `8 * 1024` argument (§4.8, §10.5).
pub const READ_QUANTUM: usize = 8 * 1024;
/// Bytes written per `writev`-equivalent batch, mirroring the source's
/// `MAX_BYTES_TO_WRITE` (§4.8, §10.5).
pub const WRITE_QUANTUM: usize = 64 * 1024;

/// Outcome of pumping bytes off the socket (`connectionRead`'s return
/// convention: `0` keep going, `1` would-block, `<0` closed/errored).
pub enum ReadOutcome {
    /// At least `READ_QUANTUM` bytes were consumed; more may be pending.
    Full(usize),
    /// The socket would block; `usize` bytes were read before that.
    WouldBlock(usize),
    /// The peer closed the connection or the socket errored.
    Closed,
}

/// Outcome of draining the write stream (`completeWrite`'s return
/// convention: `0` fully flushed, `1` partial/would-block, `<0` error).
pub enum WriteOutcome {
    Flushed,
    WouldBlock,
    Closed,
}

/// Pumps up to `READ_QUANTUM` bytes from `socket` into `stream` through
/// arena-backed segments, mirroring `connectionRead`. Shared by client
/// connections (`ConnectionContext`) and outbound peer connections
/// (`cluster::PeerConnection`), which both reduce to "a socket, its arena,
/// and a data stream" for the purposes of the read/write pump.
pub fn read_socket<S: Read>(
    socket: &mut S,
    table: &mut SegmentTable,
    arena: &mut Arena,
    stream: &mut DataStream,
) -> Result<ReadOutcome, ConnectionError> {
    let mut total = 0usize;
    let mut buf = [0u8; 4096];
    while total < READ_QUANTUM {
        let want = (READ_QUANTUM - total).min(buf.len());
        match socket.read(&mut buf[..want]) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => {
                stream.append_new_ephemeral(table, arena, &buf[..n]).map_err(|_| ConnectionError::OutOfMemory)?;
                total += n;
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::WouldBlock(total)),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return Ok(ReadOutcome::Closed),
        }
    }
    Ok(ReadOutcome::Full(total))
}

/// Drains up to `WRITE_QUANTUM` bytes of `stream` to `socket`, truncating
/// whatever made it out, mirroring `completeWrite`/`connectionWriteHelper`.
pub fn write_socket<S: Write>(
    socket: &mut S,
    table: &mut SegmentTable,
    chunkpool: &mut crate::chunkpool::ChunkPool,
    arena: &mut Arena,
    stream: &mut DataStream,
) -> Result<WriteOutcome, ConnectionError> {
    let size = stream.total_size();
    if size == 0 {
        return Ok(WriteOutcome::Flushed);
    }
    let batch = size.min(WRITE_QUANTUM);
    let bytes = stream.read_range(table, chunkpool, Some(arena), 0, batch);
    match socket.write(&bytes) {
        Ok(written) => {
            if written > 0 {
                stream.truncate_from_start(table, chunkpool, Some(arena), written).map_err(|_| ConnectionError::OutOfMemory)?;
            }
            if written == batch && stream.total_size() == 0 {
                Ok(WriteOutcome::Flushed)
            } else {
                Ok(WriteOutcome::WouldBlock)
            }
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(WriteOutcome::WouldBlock),
        Err(_) => Ok(WriteOutcome::Closed),
    }
}

/// A `get`/`bget` that fanned out to the cluster client is parked here
/// while its remote keys are still outstanding (§5 "Suspension points", §9
/// "a pending command holds... a fan-in counter").
pub struct SuspendedFetch {
    pub pending: usize,
}

/// Mirrors `connectionContext_t`. Owns everything needed to pump one
/// client socket through parse → dispatch → write without touching any
/// other connection's state (§5 "Resource ownership").
pub struct ConnectionContext {
    pub socket: TcpStream,
    pub arena: Arena,
    pub read_stream: DataStream,
    pub write_stream: DataStream,
    pub parser: RequestParser,
    pub writing: bool,
    pub suspended: Option<SuspendedFetch>,
    pub last_activity: Instant,
    pub closing: bool,
}

impl ConnectionContext {
    pub fn new(socket: TcpStream, page_cache: Rc<RefCell<PageCache>>) -> Self {
        ConnectionContext {
            socket,
            arena: Arena::new(page_cache),
            read_stream: DataStream::new_ephemeral(),
            write_stream: DataStream::new_ephemeral(),
            parser: RequestParser::new(),
            writing: false,
            suspended: None,
            last_activity: Instant::now(),
            closing: false,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Reads up to `READ_QUANTUM` bytes from the socket into the read
    /// stream via arena-backed segments, mirroring `connectionRead`.
    pub fn read(&mut self, table: &mut SegmentTable) -> Result<ReadOutcome, ConnectionError> {
        read_socket(&mut self.socket, table, &mut self.arena, &mut self.read_stream)
    }

    /// Drains up to `WRITE_QUANTUM` bytes of the write stream to the
    /// socket, truncating whatever made it out, mirroring `completeWrite`.
    pub fn write(&mut self, table: &mut SegmentTable, chunkpool: &mut crate::chunkpool::ChunkPool) -> Result<WriteOutcome, ConnectionError> {
        write_socket(&mut self.socket, table, chunkpool, &mut self.arena, &mut self.write_stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspended_fetch_tracks_pending_count() {
        let mut fetch = SuspendedFetch { pending: 2 };
        fetch.pending -= 1;
        assert_eq!(fetch.pending, 1);
    }
}
