use std::time::Duration;

use keystream::StreamConfig;
use keystream_store::StoreConfig;
use serde::{Deserialize, Serialize};

/// Configuration as stored in TOML files (with optional fields for merging)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawKeystreamConfig {
    #[serde(default)]
    pub store: RawStoreConfig,

    #[serde(default)]
    pub stream: RawStreamConfig,

    #[serde(default)]
    pub demo: RawDemoConfig,
}

/// Store limits as stored in TOML
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawStoreConfig {
    pub max_value_size: Option<usize>,
    pub max_key_size: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    pub transaction_timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub initial_backoff: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub max_backoff: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawStreamConfig {
    pub partition_count: Option<u32>,

    #[serde(default)]
    pub group: RawGroupConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawGroupConfig {
    #[serde(default, with = "humantime_serde")]
    pub reconfigure_backoff: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub signal_wait_timeout: Option<Duration>,
    pub await_registration_ack: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawDemoConfig {
    pub namespace: Option<String>,
    pub topic: Option<String>,
    pub group: Option<String>,
    pub messages: Option<usize>,
    pub keys: Option<usize>,
}

/// Final configuration with defaults applied
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeystreamConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub demo: DemoConfig,
}

/// Settings of the `demo` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Namespace the demo stream lives in
    pub namespace: String,

    /// Topic of the demo stream
    pub topic: String,

    /// Consumer group reading the demo stream
    pub group: String,

    /// Number of messages to emit
    pub messages: usize,

    /// Number of distinct partition keys
    pub keys: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            group: DEFAULT_GROUP.to_string(),
            messages: DEFAULT_MESSAGES,
            keys: DEFAULT_KEYS,
        }
    }
}

pub const DEFAULT_NAMESPACE: &str = "demo";
pub const DEFAULT_TOPIC: &str = "events";
pub const DEFAULT_GROUP: &str = "demo-consumers";
pub const DEFAULT_MESSAGES: usize = 1000;
pub const DEFAULT_KEYS: usize = 16;
