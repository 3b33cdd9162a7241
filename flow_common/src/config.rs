//! Process-wide configuration, read from the environment.
//!
//! Mirrors the way the rest of this crate reads `DATABASE_URL`: environment
//! variables with sane defaults, so the same binary behaves correctly both
//! in-cluster and on a developer workstation talking through `kubectl
//! proxy`.

use std::env;

/// The three explicit concurrency limiters named in the design notes.
/// Values are fixed, not configurable, on purpose — they bound memory, not
/// correctness, and changing them per-deployment has never been needed.
pub mod concurrency {
    /// Parallelism cap for GC tree walks (mark-from-commits, mark-from-tags).
    pub const GC_TREE_WALK: usize = 100;

    /// Parallelism cap for fetching stats-mode log files.
    pub const STATS_LOG_FETCH: usize = 20;

    /// Parallelism cap for fetching datum details on a finished job.
    pub const DATUM_DETAIL_FETCH: usize = 200;

    /// Minimum batch size before a GC sweep phase issues a delete batch.
    pub const GC_SWEEP_BATCH: usize = 100;
}

/// Runtime configuration for `flowd`.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// TCP port to listen on.
    pub port: u16,
    /// Default page size used by `ListDatum`/`ListJob` when the caller
    /// doesn't specify one.
    pub default_page_size: i64,
    /// Maximum time `InspectJob(BlockState=true)` will poll before giving up
    /// and returning a timeout error, to avoid hanging HTTP handlers
    /// forever if a job somehow never reaches a terminal state.
    pub block_inspect_timeout_secs: u64,
    /// Poll interval used by the block-inspect watch loop and by the
    /// babysitter's reconciliation pass.
    pub poll_interval_millis: u64,
}

impl ServerConfig {
    /// Build configuration from the environment, falling back to
    /// development-friendly defaults.
    pub fn from_env() -> Self {
        ServerConfig {
            port: env_or("FLOWD_PORT", 8089),
            default_page_size: env_or("FLOWD_DEFAULT_PAGE_SIZE", 1000),
            block_inspect_timeout_secs: env_or("FLOWD_BLOCK_INSPECT_TIMEOUT_SECS", 300),
            poll_interval_millis: env_or("FLOWD_POLL_INTERVAL_MILLIS", 500),
        }
    }
}

/// Read an environment variable and parse it, falling back to `default` if
/// the variable is unset or fails to parse.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_has_sane_defaults_with_no_environment() {
        // We can't safely manipulate process-wide env vars in a parallel
        // test run, so just check that defaults are sane when unset.
        let config = ServerConfig {
            port: env_or("FLOWD_PORT_NOT_SET_IN_TESTS", 8089),
            ..ServerConfig::from_env()
        };
        assert_eq!(config.port, 8089);
        assert!(config.default_page_size > 0);
    }
}
