//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Proxy server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
}

/// Upstream backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the authoritative backend (e.g., "https://scheduler.example.com")
    pub base_url: String,
    /// Path prefix that marks a request as an API call
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl UpstreamConfig {
    /// Absolute URL for an upstream path.
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            path_and_query
        )
    }
}

/// Durable store configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Sync orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Periodic drain interval in seconds (default: 300 = 5 minutes)
    pub drain_interval_seconds: u64,
    /// Retention sweep interval in seconds (default: 3600 = hourly)
    pub retention_interval_seconds: u64,
    /// Age after which drafts and queued operations are swept, in days
    pub retention_days: i64,
    /// Connectivity probe interval in seconds
    pub probe_interval_seconds: u64,
    /// Idle gap after which renewed client activity triggers a drain, in seconds
    pub visibility_idle_seconds: u64,
}

/// Response cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Version string baked into the shell cache name; bumping it expires
    /// the previous shell cache on activation
    pub shell_version: String,
    /// Shell URLs precached on install
    #[serde(default)]
    pub shell_manifest: Vec<String>,
    /// Maximum entries in the runtime cache
    pub runtime_max_entries: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (OUTPOST_*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::EngineError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("upstream.api_prefix", "/api")?
            .set_default("upstream.request_timeout_seconds", 30)?
            .set_default("store.path", "data/outpost.db")?
            .set_default("sync.drain_interval_seconds", 300)?
            .set_default("sync.retention_interval_seconds", 3600)?
            .set_default("sync.retention_days", 7)?
            .set_default("sync.probe_interval_seconds", 15)?
            .set_default("sync.visibility_idle_seconds", 60)?
            .set_default("cache.shell_version", "v1")?
            .set_default("cache.runtime_max_entries", 512)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (OUTPOST_*)
            .add_source(
                Environment::with_prefix("OUTPOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), crate::error::EngineError> {
        if self.upstream.base_url.trim().is_empty() {
            return Err(crate::error::EngineError::Config(
                "upstream.base_url must be set".to_string(),
            ));
        }

        url::Url::parse(&self.upstream.base_url).map_err(|e| {
            crate::error::EngineError::Config(format!("upstream.base_url is not a valid URL: {e}"))
        })?;

        if self.sync.drain_interval_seconds == 0 {
            return Err(crate::error::EngineError::Config(
                "sync.drain_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.sync.retention_interval_seconds == 0 {
            return Err(crate::error::EngineError::Config(
                "sync.retention_interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.sync.retention_days <= 0 {
            return Err(crate::error::EngineError::Config(
                "sync.retention_days must be greater than 0".to_string(),
            ));
        }

        if self.cache.shell_version.trim().is_empty() {
            return Err(crate::error::EngineError::Config(
                "cache.shell_version must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
