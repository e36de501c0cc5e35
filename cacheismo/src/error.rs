//! Crate-wide error hierarchy.
//!
//! The original source threads a raw `int` error code through
//! `IfTrue(x, level, fmt, ...) { LOG(...); goto OnError; }` at almost every
//! call site, plus a second, richer enumerated-error convention in the
//! driver layer. `t51core/src/net/result.rs` already shows the Rust-idiom
//! version of that second convention (an enum implementing `From<io::Error>`
//! by storing `io::ErrorKind`). This module generalizes that idiom with
//! `thiserror` across every subsystem boundary named in spec §7, instead of
//! hand-writing `Display`/`Error` impls per module the way the teacher did.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkPoolError {
    #[error("requested size exceeds the maximum chunk class")]
    TooLarge,
    #[error("chunk allocator out of memory")]
    OutOfMemory,
}

#[derive(Debug, Error)]
pub enum FallocatorError {
    #[error("arena allocator out of memory")]
    OutOfMemory,
}

#[derive(Debug, Error)]
pub enum DataStreamError {
    #[error("cannot append to a persistent (clone-only) data stream")]
    PersistentAppend,
    #[error("truncation length exceeds stream size")]
    TruncateOutOfRange,
    #[error("substream range exceeds stream size")]
    SubstreamOutOfRange,
    #[error(transparent)]
    ChunkPool(#[from] ChunkPoolError),
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("need more bytes")]
    NeedMore,
    #[error("malformed request: {0}")]
    Malformed(&'static str),
    #[error("unknown command verb")]
    UnknownVerb,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("out of memory servicing the connection's arena or read/write streams")]
    OutOfMemory,
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed peer response: {0}")]
    Parse(#[from] ParseError),
    #[error("peer response desynchronized from pending request queue")]
    Desync,
}

/// Top-level error surfaced at the wire protocol boundary (§7).
#[derive(Debug, Error)]
pub enum Error {
    #[error("SERVER_ERROR out of memory")]
    OutOfMemory,
    #[error("CLIENT_ERROR {0}")]
    ClientError(&'static str),
    #[error("ERROR")]
    UnknownCommand,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl From<ChunkPoolError> for Error {
    fn from(_: ChunkPoolError) -> Self {
        Error::OutOfMemory
    }
}

impl From<FallocatorError> for Error {
    fn from(_: FallocatorError) -> Self {
        Error::OutOfMemory
    }
}

impl From<DataStreamError> for Error {
    fn from(err: DataStreamError) -> Self {
        match err {
            DataStreamError::PersistentAppend => Error::ClientError("cannot append to a persistent stream"),
            DataStreamError::TruncateOutOfRange => Error::ClientError("truncate length exceeds stream size"),
            DataStreamError::SubstreamOutOfRange => Error::ClientError("substream range exceeds stream size"),
            DataStreamError::ChunkPool(_) => Error::OutOfMemory,
        }
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::NeedMore => Error::ClientError("need more data"),
            ParseError::Malformed(msg) => Error::ClientError(msg),
            ParseError::UnknownVerb => Error::UnknownCommand,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
