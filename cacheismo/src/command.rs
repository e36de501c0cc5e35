//! Parsed request record (§3), grounded on
//! `original_source/src/driver/commands.h`'s `command_t`/`commands_enum_t`.
//!
//! The source's `command_t` carries a `response` field the lua binding
//! sets as it decides what to write back, and a `cacheItem` out-parameter;
//! both are reinterpreted here as the return value of whichever
//! `runtime::BuiltinRuntime` verb handler processed the command (§10.6),
//! rather than fields mutated in place on the command itself.

use crate::datastream::DataStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Get,
    Bget,
    Gets,
    Add,
    Set,
    Replace,
    Prepend,
    Append,
    Cas,
    Incr,
    Decr,
    Delete,
    Stats,
    FlushAll,
    Version,
    Quit,
    Verbosity,
}

/// One in-flight request (§3). `data_stream` is `None` until the parser's
/// `parse_data` state completes for verbs that expect a body.
pub struct Command {
    pub kind: CommandKind,
    pub key: Vec<u8>,
    pub multi_keys: Vec<Vec<u8>>,
    pub flags: u32,
    pub exptime: u32,
    pub data_length: u32,
    pub delta: u64,
    pub cas: u64,
    pub noreply: bool,
    pub data_stream: Option<DataStream>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Command {
            kind,
            key: Vec::new(),
            multi_keys: Vec::new(),
            flags: 0,
            exptime: 0,
            data_length: 0,
            delta: 0,
            cas: 0,
            noreply: false,
            data_stream: None,
        }
    }

    /// Verbs with a CRLF-terminated body per §4.7 (`add`, `set`, `replace`,
    /// `prepend`, `append`, `cas`), mirroring `isDataExpected`.
    pub fn expects_data(&self) -> bool {
        matches!(
            self.kind,
            CommandKind::Add
                | CommandKind::Set
                | CommandKind::Replace
                | CommandKind::Prepend
                | CommandKind::Append
                | CommandKind::Cas
        )
    }
}
