//! The scripting boundary (§6 "Runtime boundary") and its only shipped
//! implementation, a runtime that dispatches wire verbs directly.
//!
//! Grounded on `original_source/src/driver/driver.c`'s
//! `writeCacheItemToStream`/`completeWrite`/`handleCommandLUA` call
//! sequence and `original_source/src/lua/*`'s five-capability binding
//! surface (`global_hash_map`, `write_cache_item`, `write_raw`,
//! `create_cache_item_from_command`, `cluster_get`), reimplemented here as
//! plain Rust verb handlers instead of a Lua call (§10.6: Lua itself is out
//! of scope per spec §1's explicit exclusion).

use crate::chunkpool::ChunkPool;
use crate::cluster::{ClusterClient, ClusterEvent, ClusterResult, ConsistentRing, Route};
use crate::command::{Command, CommandKind};
use crate::connection::{ConnectionContext, SuspendedFetch};
use crate::context::CoreContext;
use crate::datastream::{DataStream, SegmentTable};
use crate::fallocator::Arena;
use crate::item::{self, CacheItem};

/// Mirrors the source's "returns a sentinel to suspend, zero/negative to
/// finish" convention (`luaRunnableRun`'s return value), reinterpreted as
/// an enum instead of an overloaded integer.
pub enum DispatchOutcome {
    Done,
    /// At least one key was routed to a peer; `pending` tracks how many
    /// cluster responses are still outstanding (§5's "fan-in counter").
    /// `new_peer_tokens` are freshly opened peer connections the caller
    /// (`server::Server`) must register with its `mio::Poll`.
    Suspended { pending: usize, new_peer_tokens: Vec<usize> },
}

/// Exposes exactly §6's five capabilities as Rust methods instead of a
/// function-pointer vtable the way `original_source/src/lua/binding.c`
/// hands them to the Lua state.
pub trait ScriptRuntime {
    fn dispatch(
        &mut self,
        core: &mut CoreContext,
        cluster: &mut ClusterClient,
        conn: &mut ConnectionContext,
        requester: usize,
        cmd: Command,
    ) -> crate::error::Result<DispatchOutcome>;

    /// Delivers one previously-requested cluster response, resuming the
    /// pinned command once every outstanding fetch has answered.
    fn resume(
        &mut self,
        core: &mut CoreContext,
        conn: &mut ConnectionContext,
        event: ClusterEvent,
    ) -> crate::error::Result<DispatchOutcome>;
}

/// Implements `ScriptRuntime` by executing §6's verb table directly
/// against the hash map and cluster client; the crate's only runtime,
/// since an embedded scripting language is out of scope (§10.6).
pub struct BuiltinRuntime {
    ring: ConsistentRing,
}

impl BuiltinRuntime {
    pub fn new(peers: &[String]) -> Self {
        BuiltinRuntime { ring: ConsistentRing::new(peers) }
    }

    fn dispatch_get(
        &self,
        core: &mut CoreContext,
        cluster: &mut ClusterClient,
        conn: &mut ConnectionContext,
        requester: usize,
        cmd: &Command,
    ) -> crate::error::Result<DispatchOutcome> {
        let keys: Vec<&[u8]> = if cmd.multi_keys.is_empty() { vec![cmd.key.as_slice()] } else { cmd.multi_keys.iter().map(Vec::as_slice).collect() };

        let mut pending = 0usize;
        let mut new_tokens = Vec::new();

        // Virtual keys are an explicit no-op capability point (§10.6): the
        // scripting collaborator that would resolve them isn't present, so
        // every lookup reports a miss rather than falling through to the
        // ordinary cache lookup.
        if !core.config.virtual_keys {
            for &key in &keys {
                match self.ring.route(key) {
                    Route::Local => {
                        let now = core.clock.now_secs();
                        if let Some(found) = core.map.get(key, now) {
                            write_cache_item(&mut core.segments, &mut conn.arena, &mut conn.write_stream, key, found.flags(), found.data())?;
                            found.release();
                        }
                    }
                    Route::Peer(peer) => {
                        let peer = peer.clone();
                        if let Some(token) = cluster.get(&mut core.segments, &peer, key, requester)? {
                            new_tokens.push(token);
                        }
                        pending += 1;
                    }
                }
            }
        }

        if pending == 0 {
            write_raw(&mut core.segments, &mut conn.arena, &mut conn.write_stream, b"END\r\n")?;
            Ok(DispatchOutcome::Done)
        } else {
            conn.suspended = Some(SuspendedFetch { pending });
            Ok(DispatchOutcome::Suspended { pending, new_peer_tokens: new_tokens })
        }
    }

    fn dispatch_store(&self, core: &mut CoreContext, conn: &mut ConnectionContext, cmd: &Command) -> crate::error::Result<&'static [u8]> {
        match cmd.kind {
            CommandKind::Set => {
                let payload = cmd.data_stream.as_ref().expect("set carries a body");
                let fresh = admit_item(core, Some(&conn.arena), cmd, payload)?;
                replace_entry(core, &cmd.key, fresh);
                Ok(b"STORED\r\n")
            }
            CommandKind::Add => {
                if core.map.contains(&cmd.key) {
                    Ok(b"NOT_STORED\r\n")
                } else {
                    let payload = cmd.data_stream.as_ref().expect("add carries a body");
                    let fresh = admit_item(core, Some(&conn.arena), cmd, payload)?;
                    core.map.put(fresh);
                    Ok(b"STORED\r\n")
                }
            }
            CommandKind::Replace => {
                if !core.map.contains(&cmd.key) {
                    Ok(b"NOT_STORED\r\n")
                } else {
                    let payload = cmd.data_stream.as_ref().expect("replace carries a body");
                    let fresh = admit_item(core, Some(&conn.arena), cmd, payload)?;
                    replace_entry(core, &cmd.key, fresh);
                    Ok(b"STORED\r\n")
                }
            }
            CommandKind::Append | CommandKind::Prepend => {
                let now = core.clock.now_secs();
                let existing = match core.map.get(&cmd.key, now) {
                    None => None,
                    Some(found) => {
                        let flags = found.flags();
                        let expiry = found.expiry();
                        let payload = cmd.data_stream.as_ref().expect("append/prepend carries a body");
                        let mut combined = DataStream::new_ephemeral();
                        if matches!(cmd.kind, CommandKind::Append) {
                            combined.append_stream(&mut core.segments, found.data())?;
                            combined.append_stream(&mut core.segments, payload)?;
                        } else {
                            combined.append_stream(&mut core.segments, payload)?;
                            combined.append_stream(&mut core.segments, found.data())?;
                        }
                        found.release();
                        Some((flags, expiry, combined))
                    }
                };
                match existing {
                    None => Ok(b"NOT_STORED\r\n"),
                    Some((flags, expiry, combined)) => {
                        let packed = combined.clone_into_chunkpool(&mut core.segments, &mut core.chunkpool, Some(&conn.arena))?;
                        combined.delete(&mut core.segments, &mut core.chunkpool, Some(&mut conn.arena));
                        let cas = core.next_cas();
                        let fresh = CacheItem::with_data(cmd.key.clone(), flags, expiry, packed, cas);
                        replace_entry(core, &cmd.key, fresh);
                        Ok(b"STORED\r\n")
                    }
                }
            }
            _ => unreachable!("dispatch_store only called for storage verbs"),
        }
    }

    fn dispatch_cas(&self, core: &mut CoreContext, conn: &mut ConnectionContext, cmd: &Command) -> crate::error::Result<&'static [u8]> {
        let now = core.clock.now_secs();
        let verdict = match core.map.get(&cmd.key, now) {
            None => None,
            Some(found) => {
                let matches = found.cas() == cmd.cas;
                found.release();
                Some(matches)
            }
        };
        match verdict {
            None => Ok(b"NOT_FOUND\r\n"),
            Some(false) => Ok(b"EXISTS\r\n"),
            Some(true) => {
                let payload = cmd.data_stream.as_ref().expect("cas carries a body");
                let fresh = admit_item(core, Some(&conn.arena), cmd, payload)?;
                replace_entry(core, &cmd.key, fresh);
                Ok(b"STORED\r\n")
            }
        }
    }

    fn dispatch_delta(&self, core: &mut CoreContext, conn: &mut ConnectionContext, cmd: &Command, positive: bool) -> crate::error::Result<Vec<u8>> {
        let now = core.clock.now_secs();
        let existing = match core.map.get(&cmd.key, now) {
            None => None,
            Some(found) => {
                let flags = found.flags();
                let expiry = found.expiry();
                let text = found.data().read_range(&core.segments, &core.chunkpool, Some(&conn.arena), 0, found.data().total_size());
                found.release();
                Some((flags, expiry, text))
            }
        };
        let (flags, expiry, text) = match existing {
            None => return Ok(b"NOT_FOUND\r\n".to_vec()),
            Some(v) => v,
        };
        let current: u64 = match std::str::from_utf8(&text).ok().and_then(|s| s.trim().parse().ok()) {
            Some(v) => v,
            None => return Ok(b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec()),
        };
        let updated = if positive { current.wrapping_add(cmd.delta) } else { current.saturating_sub(cmd.delta) };
        let rendered = updated.to_string().into_bytes();

        let mut fresh_stream = DataStream::new_ephemeral();
        fresh_stream.append_new_ephemeral(&mut core.segments, &mut conn.arena, &rendered)?;
        let packed = fresh_stream.clone_into_chunkpool(&mut core.segments, &mut core.chunkpool, Some(&conn.arena))?;
        fresh_stream.delete(&mut core.segments, &mut core.chunkpool, Some(&mut conn.arena));
        let cas = core.next_cas();
        let fresh = CacheItem::with_data(cmd.key.clone(), flags, expiry, packed, cas);
        replace_entry(core, &cmd.key, fresh);

        let mut reply = rendered;
        reply.extend_from_slice(b"\r\n");
        Ok(reply)
    }
}

impl ScriptRuntime for BuiltinRuntime {
    fn dispatch(
        &mut self,
        core: &mut CoreContext,
        cluster: &mut ClusterClient,
        conn: &mut ConnectionContext,
        requester: usize,
        cmd: Command,
    ) -> crate::error::Result<DispatchOutcome> {
        match cmd.kind {
            CommandKind::Get | CommandKind::Bget | CommandKind::Gets => return self.dispatch_get(core, cluster, conn, requester, &cmd),
            CommandKind::Set | CommandKind::Add | CommandKind::Replace | CommandKind::Append | CommandKind::Prepend => {
                let reply = self.dispatch_store(core, conn, &cmd)?;
                reply_unless_noreply(core, conn, cmd.noreply, reply)?;
            }
            CommandKind::Cas => {
                let reply = self.dispatch_cas(core, conn, &cmd)?;
                reply_unless_noreply(core, conn, cmd.noreply, reply)?;
            }
            CommandKind::Incr => {
                let reply = self.dispatch_delta(core, conn, &cmd, true)?;
                reply_unless_noreply(core, conn, cmd.noreply, &reply)?;
            }
            CommandKind::Decr => {
                let reply = self.dispatch_delta(core, conn, &cmd, false)?;
                reply_unless_noreply(core, conn, cmd.noreply, &reply)?;
            }
            CommandKind::Delete => {
                let now = core.clock.now_secs();
                let hit = match core.map.get(&cmd.key, now) {
                    Some(found) => {
                        found.release();
                        true
                    }
                    None => false,
                };
                if hit {
                    if let Some(old) = core.map.delete(&cmd.key) {
                        release_item(core, old);
                    }
                    reply_unless_noreply(core, conn, cmd.noreply, b"DELETED\r\n")?;
                } else {
                    reply_unless_noreply(core, conn, cmd.noreply, b"NOT_FOUND\r\n")?;
                }
            }
            CommandKind::Stats => {
                let mut body = Vec::new();
                body.extend_from_slice(format!("STAT pid {}\r\n", std::process::id()).as_bytes());
                body.extend_from_slice(format!("STAT curr_items {}\r\n", core.map.len()).as_bytes());
                body.extend_from_slice(format!("STAT bytes {}\r\n", core.chunkpool.memory_used()).as_bytes());
                body.extend_from_slice(b"END\r\n");
                write_raw(&mut core.segments, &mut conn.arena, &mut conn.write_stream, &body)?;
            }
            CommandKind::FlushAll => {
                let freed = core.flush_all();
                log::debug!("flush_all reclaimed {} bytes", freed);
                reply_unless_noreply(core, conn, cmd.noreply, b"OK\r\n")?;
            }
            CommandKind::Version => {
                write_raw(&mut core.segments, &mut conn.arena, &mut conn.write_stream, b"VERSION 0.1.0\r\n")?;
            }
            CommandKind::Quit => {
                conn.closing = true;
            }
            CommandKind::Verbosity => {
                log::info!("verbosity set to {}", cmd.flags);
                reply_unless_noreply(core, conn, cmd.noreply, b"OK\r\n")?;
            }
        }
        Ok(DispatchOutcome::Done)
    }

    fn resume(&mut self, core: &mut CoreContext, conn: &mut ConnectionContext, event: ClusterEvent) -> crate::error::Result<DispatchOutcome> {
        match event.result {
            ClusterResult::Hit { data, flags } => {
                write_cache_item(&mut core.segments, &mut conn.arena, &mut conn.write_stream, &event.key, flags, &data)?;
                data.delete(&mut core.segments, &mut core.chunkpool, None);
            }
            ClusterResult::Miss => {}
        }

        let pending = match conn.suspended.as_mut() {
            Some(fetch) => {
                fetch.pending -= 1;
                fetch.pending
            }
            None => 0,
        };

        if pending == 0 {
            conn.suspended = None;
            write_raw(&mut core.segments, &mut conn.arena, &mut conn.write_stream, b"END\r\n")?;
            Ok(DispatchOutcome::Done)
        } else {
            Ok(DispatchOutcome::Suspended { pending, new_peer_tokens: Vec::new() })
        }
    }
}

/// Mirrors `create_cache_item_from_command`'s admission retry (§4.6): on
/// failure, evict `2·est` bytes from the LRU tail and retry, doubling the
/// eviction budget until it reaches 2 MB.
fn admit_item(core: &mut CoreContext, arena: Option<&Arena>, cmd: &Command, payload: &DataStream) -> crate::error::Result<CacheItem> {
    const MAX_BUDGET: u64 = 2 * 1024 * 1024;

    let cas = core.next_cas();
    if let Ok(fresh) = CacheItem::create(&mut core.segments, &mut core.chunkpool, arena, &core.clock, cmd, payload, cas) {
        return Ok(fresh);
    }

    let mut budget = item::estimate_size(cmd, payload.total_size()) as u64 * 2;
    loop {
        let segments = &mut core.segments;
        let chunkpool = &mut core.chunkpool;
        core.map.delete_lru(budget, |victim| {
            let data = victim.take_data();
            data.delete(segments, chunkpool, None);
        });
        match CacheItem::create(&mut core.segments, &mut core.chunkpool, arena, &core.clock, cmd, payload, cas) {
            Ok(fresh) => return Ok(fresh),
            Err(err) => {
                if budget >= MAX_BUDGET {
                    return Err(err);
                }
                budget *= 2;
            }
        }
    }
}

/// Removes any existing entry for `key` (releasing its data) before
/// inserting `fresh`, the common tail of `set`/`replace`/`cas`/`append`.
fn replace_entry(core: &mut CoreContext, key: &[u8], fresh: CacheItem) {
    if let Some(old) = core.map.delete(key) {
        release_item(core, old);
    }
    core.map.put(fresh);
}

/// Drops the hash map's own reference to an item pulled out via `delete`,
/// freeing its chunk-backed data once the refcount reaches zero. Mirrors
/// the final step of `cacheItemDelete`.
fn release_item(core: &mut CoreContext, victim: CacheItem) {
    if victim.release() {
        let data = victim.take_data();
        data.delete(&mut core.segments, &mut core.chunkpool, None);
    }
}

fn write_raw(table: &mut SegmentTable, arena: &mut Arena, stream: &mut DataStream, bytes: &[u8]) -> crate::error::Result<()> {
    stream.append_new_ephemeral(table, arena, bytes)?;
    Ok(())
}

fn reply_unless_noreply(core: &mut CoreContext, conn: &mut ConnectionContext, noreply: bool, bytes: &[u8]) -> crate::error::Result<()> {
    if noreply {
        return Ok(());
    }
    write_raw(&mut core.segments, &mut conn.arena, &mut conn.write_stream, bytes)
}

/// Mirrors `writeCacheItemToStream`: `VALUE key flags len\r\n<body>\r\n`,
/// sharing the item's data by reference rather than copying it.
fn write_cache_item(table: &mut SegmentTable, arena: &mut Arena, stream: &mut DataStream, key: &[u8], flags: u32, data: &DataStream) -> crate::error::Result<()> {
    let mut header = Vec::with_capacity(key.len() + 32);
    header.extend_from_slice(b"VALUE ");
    header.extend_from_slice(key);
    header.push(b' ');
    header.extend_from_slice(flags.to_string().as_bytes());
    header.push(b' ');
    header.extend_from_slice(data.total_size().to_string().as_bytes());
    header.extend_from_slice(b"\r\n");
    write_raw(table, arena, stream, &header)?;
    stream.append_stream(table, data)?;
    write_raw(table, arena, stream, b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreConfig;
    use mio::net::TcpListener;

    fn harness() -> (CoreContext, ClusterClient, ConnectionContext, BuiltinRuntime) {
        let core = CoreContext::new(64, 16, CoreConfig { virtual_keys: false, idle_timeout_secs: None });
        let page_cache = core.page_cache.clone();
        let cluster = ClusterClient::new(page_cache.clone());
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let (client, _addr) = {
            let addr = listener.local_addr().unwrap();
            let client = mio::net::TcpStream::connect(&addr).unwrap();
            (client, addr)
        };
        let conn = ConnectionContext::new(client, page_cache);
        let runtime = BuiltinRuntime::new(&[]);
        (core, cluster, conn, runtime)
    }

    fn set_command(core: &mut CoreContext, conn: &mut ConnectionContext, key: &[u8], value: &[u8]) -> Command {
        let mut payload = DataStream::new_ephemeral();
        payload.append_new_ephemeral(&mut core.segments, &mut conn.arena, value).unwrap();
        let mut cmd = Command::new(CommandKind::Set);
        cmd.key = key.to_vec();
        cmd.data_length = value.len() as u32;
        cmd.data_stream = Some(payload);
        cmd
    }

    #[test]
    fn set_then_get_round_trips_value() {
        let (mut core, mut cluster, mut conn, mut runtime) = harness();
        let set_cmd = set_command(&mut core, &mut conn, b"k", b"hello");
        let outcome = runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, set_cmd).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Done));

        let mut get_cmd = Command::new(CommandKind::Get);
        get_cmd.key = b"k".to_vec();
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, get_cmd).unwrap();

        let bytes = conn.write_stream.read_range(&core.segments, &core.chunkpool, Some(&conn.arena), 0, conn.write_stream.total_size());
        assert_eq!(&bytes, b"VALUE k 0 5\r\nhello\r\nEND\r\n");
    }

    #[test]
    fn get_of_missing_key_writes_only_end() {
        let (mut core, mut cluster, mut conn, mut runtime) = harness();
        let mut get_cmd = Command::new(CommandKind::Get);
        get_cmd.key = b"absent".to_vec();
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, get_cmd).unwrap();
        let bytes = conn.write_stream.read_range(&core.segments, &core.chunkpool, Some(&conn.arena), 0, conn.write_stream.total_size());
        assert_eq!(&bytes, b"END\r\n");
    }

    #[test]
    fn add_to_existing_key_is_not_stored() {
        let (mut core, mut cluster, mut conn, mut runtime) = harness();
        let set_cmd = set_command(&mut core, &mut conn, b"k", b"1");
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, set_cmd).unwrap();

        let add_cmd = set_command(&mut core, &mut conn, b"k", b"2");
        let mut add_cmd = Command { kind: CommandKind::Add, ..add_cmd };
        add_cmd.kind = CommandKind::Add;
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, add_cmd).unwrap();

        let bytes = conn.write_stream.read_range(&core.segments, &core.chunkpool, Some(&conn.arena), 0, conn.write_stream.total_size());
        assert_eq!(&bytes, b"NOT_STORED\r\n");
    }

    #[test]
    fn incr_adds_delta_to_numeric_value() {
        let (mut core, mut cluster, mut conn, mut runtime) = harness();
        let set_cmd = set_command(&mut core, &mut conn, b"n", b"10");
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, set_cmd).unwrap();

        let mut incr_cmd = Command::new(CommandKind::Incr);
        incr_cmd.key = b"n".to_vec();
        incr_cmd.delta = 5;
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, incr_cmd).unwrap();

        let bytes = conn.write_stream.read_range(&core.segments, &core.chunkpool, Some(&conn.arena), 0, conn.write_stream.total_size());
        assert_eq!(&bytes, b"15\r\n");
    }

    #[test]
    fn delete_of_missing_key_reports_not_found() {
        let (mut core, mut cluster, mut conn, mut runtime) = harness();
        let mut delete_cmd = Command::new(CommandKind::Delete);
        delete_cmd.key = b"nope".to_vec();
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, delete_cmd).unwrap();
        let bytes = conn.write_stream.read_range(&core.segments, &core.chunkpool, Some(&conn.arena), 0, conn.write_stream.total_size());
        assert_eq!(&bytes, b"NOT_FOUND\r\n");
    }

    #[test]
    fn noreply_suppresses_store_response() {
        let (mut core, mut cluster, mut conn, mut runtime) = harness();
        let mut set_cmd = set_command(&mut core, &mut conn, b"k", b"v");
        set_cmd.noreply = true;
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, set_cmd).unwrap();
        assert_eq!(conn.write_stream.total_size(), 0);
    }

    #[test]
    fn virtual_keys_enabled_always_misses() {
        let mut core = CoreContext::new(64, 16, CoreConfig { virtual_keys: true, idle_timeout_secs: None });
        let page_cache = core.page_cache.clone();
        let mut cluster = ClusterClient::new(page_cache.clone());
        let listener = TcpListener::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let client = mio::net::TcpStream::connect(&listener.local_addr().unwrap()).unwrap();
        let mut conn = ConnectionContext::new(client, page_cache);
        let mut runtime = BuiltinRuntime::new(&[]);

        let set_cmd = set_command(&mut core, &mut conn, b"k", b"v");
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, set_cmd).unwrap();

        let mut get_cmd = Command::new(CommandKind::Get);
        get_cmd.key = b"k".to_vec();
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, get_cmd).unwrap();
        let bytes = conn.write_stream.read_range(&core.segments, &core.chunkpool, Some(&conn.arena), 0, conn.write_stream.total_size());
        assert_eq!(&bytes, b"END\r\n");
    }

    #[test]
    fn flush_all_removes_every_entry() {
        let (mut core, mut cluster, mut conn, mut runtime) = harness();
        let set_cmd = set_command(&mut core, &mut conn, b"k", b"v");
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, set_cmd).unwrap();
        assert_eq!(core.map.len(), 1);

        let flush_cmd = Command::new(CommandKind::FlushAll);
        runtime.dispatch(&mut core, &mut cluster, &mut conn, 0, flush_cmd).unwrap();
        assert_eq!(core.map.len(), 0);
    }
}
