//! Environment-driven configuration (spec §6, "Environment").
//!
//! Every value is read once, at `init`/`attach` time, into a [`Config`] that
//! is then threaded through the endpoint context rather than re-read from
//! the environment on every call — the §9 design note about encapsulating
//! global mutable state in one context object applies to configuration too.

use std::env;

/// Parsed and defaulted runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-peer in-flight operation limit (`NETWORKDEPTH`); sizes the send
    /// buffer pool and the send-credit semaphore (spec §4.1, §4.3).
    pub network_depth: u32,

    /// Largest payload sent as a verbs inline send without a local pin
    /// (`INLINESEND_LIMIT`).
    pub inline_send_limit: usize,

    /// Firehose bucket size, in bytes (must be a power of two).
    pub bucket_size: usize,

    /// `FIREHOSE_M`: total pinnable memory agreed globally (bytes).
    pub firehose_m: usize,

    /// `FIREHOSE_R`: reserved (non-firehose) pinned memory per node (bytes).
    pub firehose_r: usize,

    /// `FIREHOSE_MAXVICTIM_M`: max local victim FIFO length.
    pub firehose_maxvictim_m: usize,

    /// `FIREHOSE_MAXVICTIM_R`: max per-peer remote victim FIFO length.
    pub firehose_maxvictim_r: usize,

    /// `FIREHOSE_MAXREGION_SIZE`: largest single pin request honored in one
    /// firehose move.
    pub firehose_maxregion_size: usize,

    /// `TRACEMASK` / `STATSMASK`: bitmask of trace categories to emit.
    pub trace_mask: u32,
    pub stats_mask: u32,

    /// `TRACEFILE` / `STATSFILE`: path the corresponding sink writes to, in
    /// addition to the `log` crate. `None` means log-only.
    pub trace_file: Option<String>,
    pub stats_file: Option<String>,

    /// Largest single work request the HCA accepts before a transfer must
    /// be chunked (spec §4.3 "Chunking"). Not an environment variable in
    /// upstream GASNet (it's a queried HCA attribute); exposed here as a
    /// config knob so the loopback transport's tests can exercise chunking
    /// without a real HCA.
    pub max_msg_size: usize,
}

/// Largest payload a buffer-bounced put/get copies through rather than
/// zero-copying (spec §4.3's `COPY_LIMIT`).
pub const COPY_LIMIT: usize = 4096;

/// Largest AM payload sent inline (spec §4.5).
pub const AM_INLINE_LIMIT: usize = 1024;

/// Fixed send/receive buffer size (spec §3's `BUFSZ`,
/// "`4·max_args + max_medium`"); sized to hold 16 32-bit args plus an 8KiB
/// medium payload, 8-byte aligned.
pub const BUF_SIZE: usize = 16 * 4 + 8192;

/// Per-`poll()` reap limits (spec §4.3).
pub const SND_REAP_LIMIT: usize = 64;
pub const RCV_REAP_LIMIT: usize = 64;

/// Max handler argument count (spec §4.5's 5-bit argument-count field).
pub const MAX_ARGS: usize = 16;

/// Largest memset honored as a chunked RDMA put before `gasnet-extended`
/// switches to the AM-driven remote-memset path (spec §4.6's small/large
/// split). Above this, filling the destination locally and shipping one
/// "run memset" AM costs less network traffic than bouncing the whole
/// fill pattern over as put payload.
pub const MEMSET_PUT_LIMIT: usize = 64 * 1024;

impl Default for Config {
    fn default() -> Self {
        Config {
            network_depth: 128,
            inline_send_limit: 256,
            bucket_size: 4096,
            firehose_m: 256 << 20, // 256 MiB
            firehose_r: 16 << 20,
            firehose_maxvictim_m: 256,
            firehose_maxvictim_r: 64,
            firehose_maxregion_size: 1 << 20,
            trace_mask: 0,
            stats_mask: 0,
            trace_file: None,
            stats_file: None,
            max_msg_size: 1 << 20, // 1 MiB
        }
    }
}

impl Config {
    /// Read configuration from the process environment, falling back to
    /// defaults (and logging a warning) for anything missing or
    /// unparseable — the same forgiving behavior
    /// `gasnet_toolhelp.h`'s environment helpers use.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            network_depth: env_u32("NETWORKDEPTH", defaults.network_depth),
            inline_send_limit: env_bytes("INLINESEND_LIMIT", defaults.inline_send_limit),
            bucket_size: defaults.bucket_size,
            firehose_m: env_bytes("FIREHOSE_M", defaults.firehose_m),
            firehose_r: env_bytes("FIREHOSE_R", defaults.firehose_r),
            firehose_maxvictim_m: env_u32("FIREHOSE_MAXVICTIM_M", defaults.firehose_maxvictim_m as u32) as usize,
            firehose_maxvictim_r: env_u32("FIREHOSE_MAXVICTIM_R", defaults.firehose_maxvictim_r as u32) as usize,
            firehose_maxregion_size: env_bytes("FIREHOSE_MAXREGION_SIZE", defaults.firehose_maxregion_size),
            trace_mask: env_u32("TRACEMASK", 0),
            stats_mask: env_u32("STATSMASK", 0),
            trace_file: env::var("TRACEFILE").ok(),
            stats_file: env::var("STATSFILE").ok(),
            max_msg_size: env_bytes("MAX_MSG_SIZE", defaults.max_msg_size),
        }
    }

    /// The number of firehoses this node may own to any single peer (spec
    /// §3: `F = M / (B * (N-1))`).
    pub fn firehose_quota(&self, num_nodes: usize) -> usize {
        let peers = num_nodes.saturating_sub(1).max(1);
        (self.firehose_m / (self.bucket_size * peers)).max(1)
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            log::warn!("{name}={v:?} is not a valid integer, using default {default}");
            default
        }),
        Err(_) => default,
    }
}

/// Parse a base-2 byte-count string, accepting `KB`/`MB`/`GB` suffixes
/// (spec §6: "Units for memory values accept KB/MB/GB suffixes (base-2)").
fn parse_bytes(s: &str) -> Option<usize> {
    let s = s.trim();
    let (num, mult): (&str, usize) = if let Some(n) = s.strip_suffix("GB") {
        (n, 1 << 30)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1 << 20)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1 << 10)
    } else {
        (s, 1)
    };
    num.trim().parse::<usize>().ok().map(|n| n * mult)
}

fn env_bytes(name: &str, default: usize) -> usize {
    match env::var(name) {
        Ok(v) => parse_bytes(&v).unwrap_or_else(|| {
            log::warn!("{name}={v:?} is not a valid byte count, using default {default}");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixes() {
        assert_eq!(parse_bytes("4KB"), Some(4 * 1024));
        assert_eq!(parse_bytes("16MB"), Some(16 * 1024 * 1024));
        assert_eq!(parse_bytes("2GB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_bytes("128"), Some(128));
        assert_eq!(parse_bytes("bogus"), None);
    }

    #[test]
    fn firehose_quota_matches_spec_formula() {
        let mut cfg = Config::default();
        cfg.firehose_m = 1 << 20;
        cfg.bucket_size = 4096;
        // F = M / (B * (N - 1)), N = 5 peers total -> 4 remote peers
        assert_eq!(cfg.firehose_quota(5), (1 << 20) / (4096 * 4));
    }
}
