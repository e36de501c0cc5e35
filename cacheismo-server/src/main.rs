//! `cacheismo-server`: binds the listening socket, wires the CLI-derived
//! configuration into a `CoreContext`, and runs the event loop (§4.8,
//! §10.3). Mirrors `original_source/src/cacheismo.c`'s `main` — parse
//! args, allocate the chunk region, open the listening socket, enter
//! `event_base_dispatch`.

mod config;

use cacheismo::context::{CoreConfig, CoreContext};
use cacheismo::runtime::BuiltinRuntime;
use cacheismo::server::Server;
use clap::Parser;
use config::Cli;
use std::net::SocketAddr;
use std::process;

/// Shared by both allocators' megabyte→page-count conversions (§10.3); the
/// chunk allocator and the arena's free-page cache both use a 4KB page.
pub const PAGE_SIZE: usize = 4096;

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.env_logger_filter())).init();

    let addr = SocketAddr::new(cli.listen, cli.port);
    let core = CoreContext::new(
        cli.page_count(),
        cli.io_page_cache_cap(),
        CoreConfig { virtual_keys: cli.virtual_keys, idle_timeout_secs: cli.idle_timeout_secs },
    );
    let runtime = BuiltinRuntime::new(cli.peers());

    log::info!(
        "cacheismo-server listening on {} (memory={}MB, io-cache={}MB, virtual_keys={}, cluster={})",
        addr,
        cli.memory_mb,
        cli.io_cache_mb,
        cli.virtual_keys,
        cli.cluster
    );

    let mut server = match Server::bind(addr, core, runtime) {
        Ok(server) => server,
        Err(err) => {
            log::error!("failed to bind {}: {}", addr, err);
            process::exit(1);
        }
    };

    if let Err(err) = server.run() {
        log::error!("event loop exited: {}", err);
        process::exit(1);
    }
}
