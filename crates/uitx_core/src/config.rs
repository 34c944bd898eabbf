//! Engine configuration.

use std::time::Duration;

/// Default number of times a task is retried after a lock collision.
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// Configuration for a [`TransactionRegistry`](crate::TransactionRegistry).
#[derive(Debug, Clone)]
pub struct Config {
    /// Bounded wait applied when a lock is busy and no cross-lock was detected.
    pub lock_wait_timeout: Duration,

    /// Interval at which a blocked wait re-checks its cancellation token.
    pub wait_slice: Duration,

    /// Retry budget for tasks that do not specify their own.
    pub max_retries: u32,

    /// Upper bound on broadcast rounds in one fixed-point pass.
    pub max_broadcast_rounds: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_millis(50),
            wait_slice: Duration::from_millis(5),
            max_retries: DEFAULT_MAX_RETRIES,
            max_broadcast_rounds: 10_000,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bounded lock wait.
    #[must_use]
    pub const fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    /// Sets the cancellation check interval for blocked waits.
    #[must_use]
    pub const fn wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice = slice;
        self
    }

    /// Sets the default retry budget.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the broadcast round guard.
    #[must_use]
    pub const fn max_broadcast_rounds(mut self, rounds: usize) -> Self {
        self.max_broadcast_rounds = rounds;
        self
    }
}
