//! Single-threaded cooperative event loop (§4.8, §5): accepts client
//! connections, pumps each through parse → dispatch → write, drives the
//! cluster client's outbound sockets, and runs the 1-second housekeeping
//! timer (expiry sweep + chunkpool GC, §4.1/§4.5/§9).
//!
//! Grounded on `original_source/src/driver/driver.c`'s
//! `readAvailableImpl`/`writeAvailableImpl`/`timerCallback` state machine
//! and `original_source/src/cacheismo.c`'s event-loop bootstrap
//! (`event_base_new`/`event_base_dispatch` plus the housekeeping
//! `event_add`). The source reactor is `libevent`; this crate uses `mio`
//! as the direct non-blocking-multiplexer equivalent (§9, recorded as a
//! deliberate addition in `DESIGN.md` since the teacher workspace itself
//! has no `mio` dependency).

use crate::alloc::SlotPool;
use crate::cluster::ClusterClient;
use crate::connection::{ConnectionContext, ReadOutcome, WriteOutcome};
use crate::context::CoreContext;
use crate::error::{ConnectionError, Result};
use crate::parser::ParseProgress;
use crate::runtime::{DispatchOutcome, ScriptRuntime};
use mio::net::TcpListener;
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: Token = Token(0);
const CLIENT_TOKEN_BASE: usize = 1;
const PEER_TOKEN_BASE: usize = 1 << 32;
/// Mirrors the source's 1-second housekeeping `event_add` in `cacheismo.c`.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

fn client_token(slot: usize) -> Token {
    Token(CLIENT_TOKEN_BASE + slot)
}

fn client_slot(token: Token) -> usize {
    token.0 - CLIENT_TOKEN_BASE
}

fn peer_token(slot: usize) -> Token {
    Token(PEER_TOKEN_BASE + slot)
}

fn peer_slot(token: Token) -> usize {
    token.0 - PEER_TOKEN_BASE
}

fn is_peer_token(token: Token) -> bool {
    token.0 >= PEER_TOKEN_BASE
}

/// The per-connection state machine's drive result for one readiness pass,
/// used only to decide what interest to re-register (§4.8).
enum PumpOutcome {
    /// Waiting on more bytes from the client; re-arm for read.
    NeedMore,
    /// A script suspended on a peer fetch; no interest is re-armed (§5).
    Suspended,
    /// The write stream didn't fully drain; re-arm for write.
    WouldBlock,
    /// Hard error or clean close; the connection is torn down.
    Closed,
}

/// Owns every per-process collaborator and drives the `mio::Poll` loop.
/// Generic over the runtime so the built-in verb dispatcher (§10.6) and
/// any future scripting runtime share the same driver.
pub struct Server<R: ScriptRuntime> {
    poll: Poll,
    listener: TcpListener,
    core: CoreContext,
    cluster: ClusterClient,
    runtime: R,
    connections: SlotPool<ConnectionContext>,
}

impl<R: ScriptRuntime> Server<R> {
    pub fn bind(addr: SocketAddr, core: CoreContext, runtime: R) -> Result<Self> {
        let listener = TcpListener::bind(&addr).map_err(ConnectionError::Io)?;
        let poll = Poll::new().map_err(ConnectionError::Io)?;
        poll.register(&listener, LISTENER_TOKEN, Ready::readable(), PollOpt::edge())
            .map_err(ConnectionError::Io)?;
        let page_cache = core.page_cache.clone();
        Ok(Server {
            poll,
            listener,
            core,
            cluster: ClusterClient::new(page_cache),
            runtime,
            connections: SlotPool::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the event loop until the process is killed. Each `poll()` call
    /// is bounded by `HOUSEKEEPING_INTERVAL` so the timer fires even on an
    /// idle server, mirroring the source's periodic `event_base` timer.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut last_housekeeping = Instant::now();
        loop {
            let elapsed = last_housekeeping.elapsed();
            let timeout = HOUSEKEEPING_INTERVAL.checked_sub(elapsed).unwrap_or(Duration::from_secs(0));
            self.poll.poll(&mut events, Some(timeout)).map_err(ConnectionError::Io)?;

            for event in events.iter() {
                let token = event.token();
                let readiness = event.readiness();
                if token == LISTENER_TOKEN {
                    self.accept_all()?;
                } else if is_peer_token(token) {
                    self.service_peer(peer_slot(token), readiness.is_readable(), readiness.is_writable());
                } else {
                    self.service_client(client_slot(token), readiness.is_readable(), readiness.is_writable());
                }
            }

            if last_housekeeping.elapsed() >= HOUSEKEEPING_INTERVAL {
                self.housekeeping();
                last_housekeeping = Instant::now();
            }
        }
    }

    /// Edge-triggered listener: drain every pending connection per wakeup.
    fn accept_all(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((socket, _addr)) => {
                    socket.set_nodelay(true).ok();
                    let conn = ConnectionContext::new(socket, self.core.page_cache.clone());
                    let slot = self.connections.push(conn);
                    let conn = self.connections.get(slot).expect("just inserted");
                    if self
                        .poll
                        .register(&conn.socket, client_token(slot), Ready::readable() | Ready::writable(), PollOpt::edge())
                        .is_err()
                    {
                        self.connections.reclaim(slot);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(_) => return Ok(()),
            }
        }
    }

    /// §9's periodic reap: expired-key sweep plus gated chunkpool GC, and
    /// (§10.7) idle-connection eviction when `--idle-timeout-secs` is set.
    fn housekeeping(&mut self) {
        self.core.housekeeping();

        if let Some(limit) = self.core.config.idle_timeout_secs {
            let limit = Duration::from_secs(limit);
            let now = Instant::now();
            let idle: Vec<usize> = self
                .connections
                .iter()
                .filter(|&(_, conn)| conn.idle_for(now) >= limit)
                .map(|(slot, _)| slot)
                .collect();
            for slot in idle {
                log::info!("closing connection {} after idle timeout", slot);
                self.close_client(slot);
            }
        }
    }

    fn service_client(&mut self, slot: usize, readable: bool, writable: bool) {
        if readable {
            let outcome = match self.connections.get_mut(slot) {
                Some(conn) => conn.read(&mut self.core.segments),
                None => return,
            };
            match outcome {
                Ok(ReadOutcome::Closed) | Err(_) => {
                    self.close_client(slot);
                    return;
                }
                Ok(_) => {}
            }
            if let Some(conn) = self.connections.get_mut(slot) {
                conn.touch();
            }
        }

        let outcome = self.pump_client(slot, writable);
        match outcome {
            PumpOutcome::Closed => self.close_client(slot),
            PumpOutcome::NeedMore => self.rearm_client(slot, Ready::readable()),
            PumpOutcome::WouldBlock => self.rearm_client(slot, Ready::readable() | Ready::writable()),
            PumpOutcome::Suspended => {
                // §5: the connection does no further I/O until every
                // outstanding peer fetch resolves; interest is left as-is
                // (edge-triggered mio won't refire without new readiness).
            }
        }
    }

    /// Parses and dispatches as many complete, synchronously-finished
    /// commands as the read stream currently holds, then drains the write
    /// stream, mirroring §2's "unread bytes re-enter parsing" data flow.
    fn pump_client(&mut self, slot: usize, attempt_write_first: bool) -> PumpOutcome {
        if attempt_write_first {
            if let PumpOutcome::Closed = self.drain_client_writes(slot) {
                return PumpOutcome::Closed;
            }
        }

        loop {
            let conn = match self.connections.get_mut(slot) {
                Some(conn) => conn,
                None => return PumpOutcome::Closed,
            };
            if conn.suspended.is_some() {
                return PumpOutcome::Suspended;
            }
            if conn.closing {
                return PumpOutcome::Closed;
            }

            let progress = conn.parser.parse(&self.core.segments, &self.core.chunkpool, &conn.arena, &conn.read_stream);
            let request_size = match progress {
                Ok(ParseProgress::NeedMore) => break,
                Ok(ParseProgress::Complete { request_size }) => request_size,
                Err(_) => return PumpOutcome::Closed,
            };

            let cmd = {
                let conn = self.connections.get_mut(slot).expect("checked above");
                conn.parser.take_command(&mut self.core.segments, &mut self.core.chunkpool, Some(&mut conn.arena), &mut conn.read_stream, request_size)
            };
            let cmd = match cmd {
                Ok(cmd) => cmd,
                Err(_) => return PumpOutcome::Closed,
            };

            let outcome = {
                let conn = self.connections.get_mut(slot).expect("checked above");
                self.runtime.dispatch(&mut self.core, &mut self.cluster, conn, slot, cmd)
            };
            match outcome {
                Ok(DispatchOutcome::Done) => {}
                Ok(DispatchOutcome::Suspended { new_peer_tokens, .. }) => {
                    self.register_new_peers(&new_peer_tokens);
                    return PumpOutcome::Suspended;
                }
                Err(_) => return PumpOutcome::Closed,
            }

            if self.connections.get(slot).map(|c| c.closing).unwrap_or(true) {
                return PumpOutcome::Closed;
            }
        }

        self.drain_client_writes(slot)
    }

    fn drain_client_writes(&mut self, slot: usize) -> PumpOutcome {
        let conn = match self.connections.get_mut(slot) {
            Some(conn) => conn,
            None => return PumpOutcome::Closed,
        };
        match conn.write(&mut self.core.segments, &mut self.core.chunkpool) {
            Ok(WriteOutcome::Flushed) => {
                if conn.closing && conn.write_stream.total_size() == 0 {
                    PumpOutcome::Closed
                } else {
                    PumpOutcome::NeedMore
                }
            }
            Ok(WriteOutcome::WouldBlock) => PumpOutcome::WouldBlock,
            Ok(WriteOutcome::Closed) | Err(_) => PumpOutcome::Closed,
        }
    }

    fn rearm_client(&mut self, slot: usize, interest: Ready) {
        if let Some(conn) = self.connections.get(slot) {
            let _ = self.poll.reregister(&conn.socket, client_token(slot), interest, PollOpt::edge());
        }
    }

    fn close_client(&mut self, slot: usize) {
        if let Some(mut conn) = self.connections.reclaim(slot) {
            let _ = self.poll.deregister(&conn.socket);
            conn.read_stream.delete(&mut self.core.segments, &mut self.core.chunkpool, Some(&mut conn.arena));
            conn.write_stream.delete(&mut self.core.segments, &mut self.core.chunkpool, Some(&mut conn.arena));
        }
    }

    fn register_new_peers(&mut self, tokens: &[usize]) {
        for &token in tokens {
            if let Some(socket) = self.cluster.socket(token) {
                let _ = self.poll.register(socket, peer_token(token), Ready::readable() | Ready::writable(), PollOpt::edge());
            }
        }
    }

    fn service_peer(&mut self, token: usize, readable: bool, writable: bool) {
        let peer = match self.cluster.peer_of(token) {
            Some(peer) => peer.to_string(),
            None => return,
        };
        let events = self.cluster.service(&mut self.core.segments, &mut self.core.chunkpool, &peer, token, readable, writable);
        if self.cluster.socket(token).is_none() {
            // `service` tore the connection down; mio will drop its own
            // registration once the `TcpStream` itself is dropped.
        }
        for event in events {
            self.resume_client(event);
        }
    }

    fn resume_client(&mut self, event: crate::cluster::ClusterEvent) {
        let slot = event.requester;
        let outcome = {
            let conn = match self.connections.get_mut(slot) {
                Some(conn) => conn,
                None => return,
            };
            self.runtime.resume(&mut self.core, conn, event)
        };
        match outcome {
            Ok(DispatchOutcome::Done) => {
                let pump = self.pump_client(slot, true);
                match pump {
                    PumpOutcome::Closed => self.close_client(slot),
                    PumpOutcome::NeedMore => self.rearm_client(slot, Ready::readable()),
                    PumpOutcome::WouldBlock => self.rearm_client(slot, Ready::readable() | Ready::writable()),
                    PumpOutcome::Suspended => {}
                }
            }
            Ok(DispatchOutcome::Suspended { .. }) => {}
            Err(_) => self.close_client(slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreConfig;
    use crate::runtime::BuiltinRuntime;
    use std::net::TcpStream as StdTcpStream;

    fn make_server() -> Server<BuiltinRuntime> {
        let core = CoreContext::new(64, 16, CoreConfig { virtual_keys: false, idle_timeout_secs: None });
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        Server::bind(addr, core, BuiltinRuntime::new(&[])).unwrap()
    }

    #[test]
    fn bind_picks_an_ephemeral_port() {
        let server = make_server();
        assert!(server.local_addr().unwrap().port() > 0);
    }

    #[test]
    fn accept_all_registers_a_connecting_client() {
        let mut server = make_server();
        let addr = server.local_addr().unwrap();
        let _client = StdTcpStream::connect(addr).unwrap();
        // Give the kernel a moment to complete the handshake before polling.
        std::thread::sleep(Duration::from_millis(20));
        let mut events = Events::with_capacity(16);
        server.poll.poll(&mut events, Some(Duration::from_millis(200))).unwrap();
        server.accept_all().unwrap();
        assert_eq!(server.connections.len(), 1);
    }
}
