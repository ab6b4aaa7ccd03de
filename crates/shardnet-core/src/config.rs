use std::time::Duration;

/// Every configurable option the core exposes. Plain data — loading it from a
/// file or environment is a collaborator's concern, not this crate's.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of I/O workers. `0` means "inline": all connections are driven on the
    /// caller's own Tokio runtime rather than a dedicated worker pool.
    pub worker_count: usize,
    /// Initial block size of a `BufferedOutputStream`.
    pub initial_block_size: usize,
    /// Cap on block growth.
    pub max_block_size: usize,
    /// Maximum cached (idle) blocks the pool retains.
    pub buffer_pool_cap: usize,
    /// Listen backlog passed to the OS on `bind`.
    pub accept_backlog: u32,
    /// Whether listeners set `SO_REUSEADDR`.
    pub reuse_addr: bool,
    /// Default timeout for graceful `close(timeout)` when the caller doesn't specify one.
    pub close_timeout_ms: u64,
    /// Outbound connect timeout; `None` means no timeout.
    pub connection_timeout_ms: Option<u64>,
}

impl Config {
    pub const DEFAULT_INITIAL_BLOCK_SIZE: usize = 1024;
    pub const DEFAULT_MAX_BLOCK_SIZE: usize = 512 * 1024;
    pub const DEFAULT_BUFFER_POOL_CAP: usize = 4096;
    pub const DEFAULT_ACCEPT_BACKLOG: u32 = 1024;
    pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 5_000;

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Option<Duration> {
        self.connection_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 0,
            initial_block_size: Self::DEFAULT_INITIAL_BLOCK_SIZE,
            max_block_size: Self::DEFAULT_MAX_BLOCK_SIZE,
            buffer_pool_cap: Self::DEFAULT_BUFFER_POOL_CAP,
            accept_backlog: Self::DEFAULT_ACCEPT_BACKLOG,
            reuse_addr: true,
            close_timeout_ms: Self::DEFAULT_CLOSE_TIMEOUT_MS,
            connection_timeout_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.worker_count, 0);
        assert_eq!(cfg.initial_block_size, 1024);
        assert_eq!(cfg.max_block_size, 512 * 1024);
        assert!(cfg.connection_timeout().is_none());
    }
}
