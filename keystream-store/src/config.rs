//! Configuration for the in-memory store.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Limits and retry policy applied by [`MemoryStore`](crate::MemoryStore) transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Largest value accepted by a single write, in bytes.
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,

    /// Largest key accepted by a single write, in bytes.
    #[serde(default = "default_max_key_size")]
    pub max_key_size: usize,

    /// Maximum lifetime of a transaction before commit fails with `TimedOut`.
    #[serde(default = "default_transaction_timeout", with = "humantime_serde")]
    pub transaction_timeout: Duration,

    /// Number of retryable failures `on_error` absorbs before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff before the first retry; doubles on each subsequent retry.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for the retry backoff.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

fn default_max_value_size() -> usize {
    100_000
}

fn default_max_key_size() -> usize {
    10_000
}

fn default_transaction_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    100
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(10)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(1)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_value_size: default_max_value_size(),
            max_key_size: default_max_key_size(),
            transaction_timeout: default_transaction_timeout(),
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl StoreConfig {
    /// Set the maximum value size.
    #[must_use]
    pub fn with_max_value_size(mut self, size: usize) -> Self {
        self.max_value_size = size;
        self
    }

    /// Set the transaction timeout.
    #[must_use]
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Set the retry limit used by `on_error`.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Backoff to apply before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}
