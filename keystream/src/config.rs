//! Configuration for streams and consumer groups.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration applied to streams opened through a [`StreamStore`](crate::StreamStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Partition count for newly created streams.
    #[serde(default = "default_partition_count")]
    pub partition_count: u32,

    /// Consumer group behaviour.
    #[serde(default)]
    pub group: ConsumerGroupConfig,
}

fn default_partition_count() -> u32 {
    256
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            group: ConsumerGroupConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Set the partition count used for new streams.
    #[must_use]
    pub fn with_partition_count(mut self, count: u32) -> Self {
        self.partition_count = count;
        self
    }

    /// Set the consumer group configuration.
    #[must_use]
    pub fn with_group(mut self, group: ConsumerGroupConfig) -> Self {
        self.group = group;
        self
    }
}

/// Timing and registration policy for a consumer group instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerGroupConfig {
    /// Pause before retrying partition discovery after it failed or found
    /// no owned partitions.
    #[serde(default = "default_reconfigure_backoff", with = "humantime_serde")]
    pub reconfigure_backoff: Duration,

    /// Ceiling on how long an idle instance blocks on the stream signal.
    #[serde(default = "default_signal_wait_timeout", with = "humantime_serde")]
    pub signal_wait_timeout: Duration,

    /// Whether registration waits for the rebalancer to acknowledge the
    /// membership record before consuming.
    #[serde(default = "default_await_registration_ack")]
    pub await_registration_ack: bool,
}

fn default_reconfigure_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_signal_wait_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_await_registration_ack() -> bool {
    true
}

impl Default for ConsumerGroupConfig {
    fn default() -> Self {
        Self {
            reconfigure_backoff: default_reconfigure_backoff(),
            signal_wait_timeout: default_signal_wait_timeout(),
            await_registration_ack: default_await_registration_ack(),
        }
    }
}

impl ConsumerGroupConfig {
    #[must_use]
    pub fn with_reconfigure_backoff(mut self, backoff: Duration) -> Self {
        self.reconfigure_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_signal_wait_timeout(mut self, timeout: Duration) -> Self {
        self.signal_wait_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_await_registration_ack(mut self, await_ack: bool) -> Self {
        self.await_registration_ack = await_ack;
        self
    }
}
