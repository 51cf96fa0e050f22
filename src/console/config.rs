use crate::console::offline::retry::{BackoffStrategy, RetryPolicy};
use crate::console::sync::network_monitor::MonitorConfig;
use crate::shared::config::{AppConfig, AppConfigBuilder, ConfigError, ResourceSettings};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Remote URL that selects the in-process adapters
pub const MEMORY_URL: &str = "memory:";

/// File name of the local database inside the data directory
const DB_FILE_NAME: &str = "local.db";

/// Directory name under the platform data directory
const APP_DIR_NAME: &str = "stockpile";

/// Application configuration wrapper.
///
/// Applies `STOCKPILE_*` environment overrides on top of an [`AppConfig`] and
/// derives the settings each component takes.
#[derive(Debug, Clone)]
pub struct Config {
    app: AppConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builder(builder: AppConfigBuilder) -> Result<Self, ConfigError> {
        Ok(Self {
            app: builder.build()?,
        })
    }

    /// Load from an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => AppConfig::from_file(path)?,
            None => AppConfig::default(),
        };
        Self::with_builder(apply_env(AppConfigBuilder::from_config(base)))
    }

    pub fn app(&self) -> &AppConfig {
        &self.app
    }

    /// Remote store URL, `memory:` when unset
    pub fn remote_url(&self) -> &str {
        self.app.remote_url.as_deref().unwrap_or(MEMORY_URL)
    }

    /// Resource host URL, the remote store URL when unset
    pub fn resource_url(&self) -> &str {
        self.app
            .resource_url
            .as_deref()
            .unwrap_or_else(|| self.remote_url())
    }

    pub fn api_token(&self) -> Option<&str> {
        self.app.api_token.as_deref()
    }

    pub fn uses_memory_remote(&self) -> bool {
        self.remote_url().starts_with(MEMORY_URL)
    }

    /// Directory holding local state
    pub fn data_dir(&self) -> PathBuf {
        self.app.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME)
        })
    }

    /// Path of the local database file
    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join(DB_FILE_NAME)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let sync = &self.app.sync;
        RetryPolicy {
            max_attempts: sync.max_attempts,
            backoff: BackoffStrategy::Exponential {
                base_interval: sync.backoff_base_secs,
                max_interval: sync.backoff_max_secs,
            },
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        let network = &self.app.network;
        MonitorConfig {
            debounce: Duration::from_millis(network.debounce_ms),
            probe_interval: Duration::from_millis(network.probe_interval_ms),
            stable_latency: Duration::from_millis(network.stable_latency_ms),
            poor_latency: Duration::from_millis(network.poor_latency_ms),
            offline_after_failures: network.offline_after_failures,
            ..MonitorConfig::default()
        }
    }

    pub fn resource_settings(&self) -> ResourceSettings {
        self.app.resources.clone()
    }

    /// Interval of the periodic re-flush
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.app.sync.retry_interval_secs)
    }
}

fn apply_env(mut builder: AppConfigBuilder) -> AppConfigBuilder {
    if let Ok(url) = std::env::var("STOCKPILE_REMOTE_URL") {
        builder = builder.remote_url(url);
    }
    if let Ok(url) = std::env::var("STOCKPILE_RESOURCE_URL") {
        builder = builder.resource_url(url);
    }
    if let Ok(token) = std::env::var("STOCKPILE_API_TOKEN") {
        builder = builder.api_token(token);
    }
    if let Ok(dir) = std::env::var("STOCKPILE_DATA_DIR") {
        builder = builder.data_dir(dir);
    }
    builder
}
