//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! base URL, request and probe timeouts, cache TTLs and retry tuning.
//!
//! Configuration is stored at `~/.config/mealmate/config.json`. Missing
//! fields fall back to their defaults, so partial files are fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Application name used for config/data directory paths
const APP_NAME: &str = "mealmate";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api";

/// Queued mutations are dropped after this many failed replays.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    /// Path probed by the connectivity monitor.
    pub health_path: String,
    pub request_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub probe_interval_secs: u64,
    /// TTL for cached read responses.
    pub cache_ttl_ms: u64,
    pub max_attempts: u32,
    pub retry: RetrySettings,
    /// Overrides the platform data directory.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            health_path: "/health".to_string(),
            request_timeout_secs: 30,
            probe_timeout_secs: 5,
            probe_interval_secs: 30,
            cache_ttl_ms: 5 * 60 * 1000,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: RetrySettings::default(),
            data_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub debounce_ms: u64,
    pub cache_ttl_ms: u64,
    pub base_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            cache_ttl_ms: 30_000,
            base_delay_ms: 2000,
            max_retries: 3,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
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

    /// Directory for the persistent key-value store.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn health_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            self.health_path.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            debounce: Duration::from_millis(self.retry.debounce_ms),
            cache_ttl: Duration::from_millis(self.retry.cache_ttl_ms),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_retries: self.retry.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"api_base_url": "https://mess.example.com", "retry": {"max_retries": 5}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_base_url, "https://mess.example.com");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.health_url(), "https://mess.example.com/health");
    }

    #[test]
    fn test_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            cache_ttl_ms: 1000,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = Config::default().retry_policy();
        assert_eq!(policy.debounce, Duration::from_secs(1));
        assert_eq!(policy.cache_ttl, Duration::from_secs(30));
        assert_eq!(policy.base_delay, Duration::from_secs(2));
        assert_eq!(policy.max_retries, 3);
    }
}
