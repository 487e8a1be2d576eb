//! Host-side tunables. None of this is on-disk format — the super block
//! read at mount time is the authoritative geometry source;
//! this only configures cache soft caps and the apply worker's poll cadence.

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "hscfsd", about = "hscfs host-side core smoke driver")]
pub struct Config {
    /// Soft cap on the super/SIT/NAT/node/dentry/dir-data caches (§4.1 `expect_size`).
    #[arg(long, default_value_t = 256)]
    pub meta_cache_size: usize,

    /// Soft cap on the file object cache.
    #[arg(long, default_value_t = 64)]
    pub file_cache_size: usize,

    /// Soft cap on a single file's page cache.
    #[arg(long, default_value_t = 256)]
    pub page_cache_size: usize,

    /// Apply worker's tail-poll period in microseconds.
    #[arg(long, default_value_t = 100)]
    pub apply_poll_micros: u64,

    /// `-v`: set `RUST_LOG=debug` before `env_logger::init()`.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn apply_poll_interval(&self) -> Duration {
        Duration::from_micros(self.apply_poll_micros)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta_cache_size: 256,
            file_cache_size: 64,
            page_cache_size: 256,
            apply_poll_micros: 100,
            verbose: false,
        }
    }
}
