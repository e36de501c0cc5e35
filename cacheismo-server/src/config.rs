//! CLI surface (§10.3), a direct translation of `cacheismo.c`'s `getopt`
//! table to `clap`'s derive API.

use clap::Parser;
use std::net::IpAddr;

#[derive(Parser, Debug)]
#[command(name = "cacheismo-server", about = "ASCII memcached-protocol cache server")]
pub struct Cli {
    /// Listen port (`-p` in the source).
    #[arg(long, short = 'p', default_value_t = 11211)]
    pub port: u16,

    /// Bind address (`-l` in the source).
    #[arg(long, short = 'l', default_value = "0.0.0.0")]
    pub listen: IpAddr,

    /// Chunk allocator budget in megabytes, converted to a page count
    /// (`-m` in the source).
    #[arg(long, short = 'm', default_value_t = 64)]
    pub memory_mb: u64,

    /// Scripting runtime's script directory; opaque to the core, forwarded
    /// only (`-d` in the source, §10.6).
    #[arg(long, short = 'd', default_value = "./scripts")]
    pub scripts_dir: String,

    /// Enable virtual-key resolution in the runtime boundary (`-e` in the
    /// source).
    #[arg(long, short = 'e', default_value_t = false)]
    pub virtual_keys: bool,

    /// Arena allocator's global free-page cache budget in megabytes (`-i`
    /// in the source).
    #[arg(long, short = 'i', default_value_t = 16)]
    pub io_cache_mb: u64,

    /// Log level: one of `debug`, `info`, `warn`, `err` (`-v` in the
    /// source).
    #[arg(long, short = 'v', default_value = "err")]
    pub log_level: String,

    /// Enable the cluster client and the `--peer` list below (added;
    /// §4.9/§6's "cluster-mode enable" has no concrete flag upstream).
    #[arg(long, default_value_t = false)]
    pub cluster: bool,

    /// `host:port` of a peer server for the cluster client; repeatable
    /// (added).
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Close a connection idle longer than this many seconds (§10.7,
    /// additive; disabled unless set, matching the source exactly).
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,
}

impl Cli {
    pub fn page_count(&self) -> usize {
        (self.memory_mb * 1024 * 1024 / crate::PAGE_SIZE as u64) as usize
    }

    pub fn io_page_cache_cap(&self) -> usize {
        (self.io_cache_mb * 1024 * 1024 / crate::PAGE_SIZE as u64) as usize
    }

    pub fn peers(&self) -> &[String] {
        if self.cluster {
            &self.peers
        } else {
            &[]
        }
    }

    pub fn env_logger_filter(&self) -> &'static str {
        match self.log_level.as_str() {
            "debug" => "debug",
            "info" => "info",
            "warn" => "warn",
            _ => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_source_gettopt_table() {
        let cli = Cli::parse_from(["cacheismo-server"]);
        assert_eq!(cli.port, 11211);
        assert_eq!(cli.memory_mb, 64);
        assert_eq!(cli.io_cache_mb, 16);
        assert!(!cli.virtual_keys);
        assert!(!cli.cluster);
        assert!(cli.peers().is_empty());
    }

    #[test]
    fn cluster_mode_surfaces_configured_peers() {
        let cli = Cli::parse_from(["cacheismo-server", "--cluster", "--peer", "10.0.0.1:11211", "--peer", "10.0.0.2:11211"]);
        assert_eq!(cli.peers(), &["10.0.0.1:11211".to_string(), "10.0.0.2:11211".to_string()][..]);
    }

    #[test]
    fn peers_are_ignored_when_cluster_mode_is_off() {
        let cli = Cli::parse_from(["cacheismo-server", "--peer", "10.0.0.1:11211"]);
        assert!(cli.peers().is_empty());
    }
}
