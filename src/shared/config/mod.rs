//! Application configuration module
//!
//! Provides the validated configuration type for the data layer. Values come
//! from a TOML file, environment overrides (see `console::config`) or the
//! builder; all three end in `AppConfig::validate`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the remote document store (`memory:` for the in-process store)
    pub remote_url: Option<String>,
    /// Base URL of the resource (image) host
    pub resource_url: Option<String>,
    /// Bearer token sent to both services
    pub api_token: Option<String>,
    /// Directory holding the local database
    pub data_dir: Option<PathBuf>,
    /// Queue and flush tuning
    pub sync: SyncSettings,
    /// Connectivity monitor tuning
    pub network: NetworkSettings,
    /// Upload tuning
    pub resources: ResourceSettings,
}

/// Queue and flush tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Attempts before a queued item is marked failed
    pub max_attempts: u32,
    /// First retry delay in seconds
    pub backoff_base_secs: u64,
    /// Retry delay cap in seconds
    pub backoff_max_secs: u64,
    /// Interval of the periodic re-flush while stable
    pub retry_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_secs: 2,
            backoff_max_secs: 300,
            retry_interval_secs: 30,
        }
    }
}

/// Connectivity monitor tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// A new status must hold this long before it is announced
    pub debounce_ms: u64,
    /// Reachability probe interval
    pub probe_interval_ms: u64,
    /// Probe latency at or below which the link is stable
    pub stable_latency_ms: u64,
    /// Probe latency at or above which the link is poor
    pub poor_latency_ms: u64,
    /// Consecutive probe failures that mean offline
    pub offline_after_failures: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 1500,
            probe_interval_ms: 10_000,
            stable_latency_ms: 300,
            poor_latency_ms: 1500,
            offline_after_failures: 3,
        }
    }
}

/// Upload tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    /// Uploads in flight at once
    pub upload_concurrency: usize,
    /// Longest image edge after compression
    pub max_dimension: u32,
    /// JPEG re-encode quality (1-100)
    pub jpeg_quality: u8,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            upload_concurrency: 3,
            max_dimension: 1600,
            jpeg_quality: 80,
        }
    }
}

impl AppConfig {
    /// Create a new AppConfigBuilder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: AppConfig =
            toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&source)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        for url in [&self.remote_url, &self.resource_url].into_iter().flatten() {
            validate_url(url)?;
        }
        if self.sync.max_attempts == 0 {
            return Err(ConfigError::invalid("sync.max_attempts", "must be at least 1"));
        }
        if self.sync.backoff_base_secs > self.sync.backoff_max_secs {
            return Err(ConfigError::invalid(
                "sync.backoff_base_secs",
                "must not exceed sync.backoff_max_secs",
            ));
        }
        if self.network.stable_latency_ms >= self.network.poor_latency_ms {
            return Err(ConfigError::invalid(
                "network.stable_latency_ms",
                "must be below network.poor_latency_ms",
            ));
        }
        if self.network.offline_after_failures == 0 {
            return Err(ConfigError::invalid(
                "network.offline_after_failures",
                "must be at least 1",
            ));
        }
        if self.resources.upload_concurrency == 0 {
            return Err(ConfigError::invalid(
                "resources.upload_concurrency",
                "must be at least 1",
            ));
        }
        if !(1..=100).contains(&self.resources.jpeg_quality) {
            return Err(ConfigError::invalid(
                "resources.jpeg_quality",
                "must be between 1 and 100",
            ));
        }
        Ok(())
    }
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|_| ConfigError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "http" | "https" | "memory" => Ok(()),
        _ => Err(ConfigError::InvalidUrl(url.to_string())),
    }
}

/// Builder for AppConfig
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    config: AppConfig,
}

impl AppConfigBuilder {
    /// Start from an existing configuration
    pub fn from_config(config: AppConfig) -> Self {
        Self { config }
    }

    /// Set the remote store URL
    pub fn remote_url(mut self, url: impl Into<String>) -> Self {
        self.config.remote_url = Some(url.into());
        self
    }

    /// Set the resource host URL
    pub fn resource_url(mut self, url: impl Into<String>) -> Self {
        self.config.resource_url = Some(url.into());
        self
    }

    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.config.api_token = Some(token.into());
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.sync.max_attempts = attempts;
        self
    }

    pub fn upload_concurrency(mut self, limit: usize) -> Self {
        self.config.resources.upload_concurrency = limit;
        self
    }

    pub fn debounce_ms(mut self, millis: u64) -> Self {
        self.config.network.debounce_ms = millis;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<AppConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("failed to read config: {0}")]
    Io(String),
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            message: message.into(),
        }
    }
}
