//! Synchronization engine configuration.
//!
//! This module handles loading and saving the engine configuration, which
//! controls subscription retry behaviour and the `wait_get` window.
//!
//! Configuration is stored at `~/.config/docsync/config.json`. Every field is
//! optional in the file; missing fields take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::sync::RetryPolicy;

/// Application name used for config directory paths
const APP_NAME: &str = "docsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// First reconnect delay after a subscription failure.
pub const DEFAULT_RETRY_INITIAL_MS: u64 = 1000;

/// Reconnect delays past this are not attempted; the subscription is dead.
pub const DEFAULT_RETRY_CEILING_MS: u64 = 60_000;

/// How long `wait_get` waits for an id to show up in a cache.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry_initial_ms: u64,
    pub retry_ceiling_ms: u64,
    pub auto_retry: bool,
    pub wait_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_initial_ms: DEFAULT_RETRY_INITIAL_MS,
            retry_ceiling_ms: DEFAULT_RETRY_CEILING_MS,
            auto_retry: true,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    /// Load from the default location, or defaults if no file exists there.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Retry policy used for subscriptions that ask for automatic reconnection.
    pub fn retry_policy(&self) -> RetryPolicy {
        if self.auto_retry {
            RetryPolicy::from_millis(self.retry_initial_ms as i64)
        } else {
            RetryPolicy::Disabled
        }
    }

    pub fn retry_ceiling(&self) -> Duration {
        Duration::from_millis(self.retry_ceiling_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.retry_initial_ms, 1000);
        assert_eq!(config.retry_ceiling(), Duration::from_secs(60));
        assert_eq!(config.wait_timeout(), Duration::from_secs(10));
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::Backoff {
                initial: Duration::from_millis(1000)
            }
        );
    }

    #[test]
    fn test_auto_retry_off_disables_policy() {
        let config = SyncConfig {
            auto_retry: false,
            ..SyncConfig::default()
        };
        assert_eq!(config.retry_policy(), RetryPolicy::Disabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"wait_timeout_ms": 250}"#)
            .expect("partial config should parse");
        assert_eq!(config.wait_timeout(), Duration::from_millis(250));
        assert_eq!(config.retry_ceiling_ms, DEFAULT_RETRY_CEILING_MS);
        assert!(config.auto_retry);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join(CONFIG_FILE);
        let config = SyncConfig::load_from(&path).expect("missing file is not an error");
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let config = SyncConfig {
            retry_initial_ms: 500,
            ..SyncConfig::default()
        };
        config.save_to(&path).expect("save config");
        let loaded = SyncConfig::load_from(&path).expect("load config");
        assert_eq!(loaded, config);
    }
}
