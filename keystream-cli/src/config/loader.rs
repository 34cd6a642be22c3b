use super::types::{
    DemoConfig, KeystreamConfig, RawDemoConfig, RawGroupConfig, RawKeystreamConfig,
    RawStoreConfig, RawStreamConfig,
};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use keystream::{ConsumerGroupConfig, StreamConfig};
use keystream_store::StoreConfig;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user + project)
    pub fn load() -> Result<KeystreamConfig> {
        let mut raw = RawKeystreamConfig::default();

        // Layer 1: User config
        if let Some(user_path) = Self::user_config_path()
            && user_path.exists()
        {
            raw = Self::merge_raw(raw, Self::read_raw(&user_path)?);
        }

        // Layer 2: Project config
        let project_path = Self::project_config_path();
        if project_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(&project_path)?);
        }

        Ok(Self::finalize(raw))
    }

    fn read_raw(path: &Path) -> Result<RawKeystreamConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "keystream").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with KEYSTREAM_PROJECT_CONFIG_DIR env var
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("KEYSTREAM_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".keystream/config.toml")
        }
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawKeystreamConfig, overlay: RawKeystreamConfig) -> RawKeystreamConfig {
        RawKeystreamConfig {
            store: RawStoreConfig {
                max_value_size: overlay.store.max_value_size.or(base.store.max_value_size),
                max_key_size: overlay.store.max_key_size.or(base.store.max_key_size),
                transaction_timeout: overlay
                    .store
                    .transaction_timeout
                    .or(base.store.transaction_timeout),
                max_retries: overlay.store.max_retries.or(base.store.max_retries),
                initial_backoff: overlay.store.initial_backoff.or(base.store.initial_backoff),
                max_backoff: overlay.store.max_backoff.or(base.store.max_backoff),
            },
            stream: RawStreamConfig {
                partition_count: overlay
                    .stream
                    .partition_count
                    .or(base.stream.partition_count),
                group: RawGroupConfig {
                    reconfigure_backoff: overlay
                        .stream
                        .group
                        .reconfigure_backoff
                        .or(base.stream.group.reconfigure_backoff),
                    signal_wait_timeout: overlay
                        .stream
                        .group
                        .signal_wait_timeout
                        .or(base.stream.group.signal_wait_timeout),
                    await_registration_ack: overlay
                        .stream
                        .group
                        .await_registration_ack
                        .or(base.stream.group.await_registration_ack),
                },
            },
            demo: RawDemoConfig {
                namespace: overlay.demo.namespace.or(base.demo.namespace),
                topic: overlay.demo.topic.or(base.demo.topic),
                group: overlay.demo.group.or(base.demo.group),
                messages: overlay.demo.messages.or(base.demo.messages),
                keys: overlay.demo.keys.or(base.demo.keys),
            },
        }
    }

    /// Convert raw config to final config with defaults applied
    fn finalize(raw: RawKeystreamConfig) -> KeystreamConfig {
        let store_defaults = StoreConfig::default();
        let group_defaults = ConsumerGroupConfig::default();
        let demo_defaults = DemoConfig::default();

        KeystreamConfig {
            store: StoreConfig {
                max_value_size: raw
                    .store
                    .max_value_size
                    .unwrap_or(store_defaults.max_value_size),
                max_key_size: raw.store.max_key_size.unwrap_or(store_defaults.max_key_size),
                transaction_timeout: raw
                    .store
                    .transaction_timeout
                    .unwrap_or(store_defaults.transaction_timeout),
                max_retries: raw.store.max_retries.unwrap_or(store_defaults.max_retries),
                initial_backoff: raw
                    .store
                    .initial_backoff
                    .unwrap_or(store_defaults.initial_backoff),
                max_backoff: raw.store.max_backoff.unwrap_or(store_defaults.max_backoff),
            },
            stream: StreamConfig {
                partition_count: raw
                    .stream
                    .partition_count
                    .unwrap_or(StreamConfig::default().partition_count),
                group: ConsumerGroupConfig {
                    reconfigure_backoff: raw
                        .stream
                        .group
                        .reconfigure_backoff
                        .unwrap_or(group_defaults.reconfigure_backoff),
                    signal_wait_timeout: raw
                        .stream
                        .group
                        .signal_wait_timeout
                        .unwrap_or(group_defaults.signal_wait_timeout),
                    await_registration_ack: raw
                        .stream
                        .group
                        .await_registration_ack
                        .unwrap_or(group_defaults.await_registration_ack),
                },
            },
            demo: DemoConfig {
                namespace: raw.demo.namespace.unwrap_or(demo_defaults.namespace),
                topic: raw.demo.topic.unwrap_or(demo_defaults.topic),
                group: raw.demo.group.unwrap_or(demo_defaults.group),
                messages: raw.demo.messages.unwrap_or(demo_defaults.messages),
                keys: raw.demo.keys.unwrap_or(demo_defaults.keys),
            },
        }
    }

    /// Load config from a specific path (for testing)
    #[cfg(test)]
    pub fn load_from_path(path: &Path) -> Result<KeystreamConfig> {
        if path.exists() {
            Ok(Self::finalize(Self::read_raw(path)?))
        } else {
            Ok(KeystreamConfig::default())
        }
    }
}
