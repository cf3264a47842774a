//! Core runtime configuration.

use crate::pool::PoolConfig;

use std::time::Duration;

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Configuration consumed by the runtime context.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Floor applied to every call timeout.
    pub min_rpc_timeout: Duration,
    /// Timeout used when a request does not carry one.
    pub default_rpc_timeout: Duration,
    /// Largest frame accepted or produced.
    pub max_frame_size: usize,
    /// How long a partially received frame may take to complete.
    pub body_read_timeout: Duration,
    /// Capacity of the dispatch queue shared by all sessions.
    pub dispatch_queue_size: usize,
    /// Message pool configuration.
    pub pool: PoolConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            min_rpc_timeout: Duration::from_secs(5),
            default_rpc_timeout: Duration::from_secs(10),
            max_frame_size: MAX_FRAME_SIZE,
            body_read_timeout: Duration::from_secs(8),
            dispatch_queue_size: 1024,
            pool: PoolConfig::default(),
        }
    }
}

impl RpcConfig {
    /// Set the minimum call timeout.
    #[must_use]
    pub const fn min_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.min_rpc_timeout = timeout;
        self
    }

    /// Set the timeout used for requests that carry none.
    #[must_use]
    pub const fn default_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.default_rpc_timeout = timeout;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the bounded wait for frame bodies.
    #[must_use]
    pub const fn body_read_timeout(mut self, timeout: Duration) -> Self {
        self.body_read_timeout = timeout;
        self
    }

    /// Replace the pool configuration.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// The timeout a call actually waits for.
    #[must_use]
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.default_rpc_timeout)
            .max(self.min_rpc_timeout)
    }
}
