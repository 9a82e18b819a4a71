//! Configuration management for BundleBox
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use bundlebox::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Server listening on: {}", config.server.bind_addr);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `BUNDLEBOX__<section>__<key>`
//!
//! Examples:
//! - `BUNDLEBOX__SERVER__BIND_ADDR=0.0.0.0:9000`
//! - `BUNDLEBOX__WORKER__CONCURRENCY=8`
//! - `BUNDLEBOX__LIMITER__RATE_BUDGET=20MB`
//!
//! Provider credentials are read from `BUNDLEBOX_PROVIDER_USERNAME` and
//! `BUNDLEBOX_PROVIDER_PASSWORD` only.
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/bundlebox.toml`.
//! This can be overridden using the `BUNDLEBOX_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

// Re-export public types
pub use crate::humanize::ByteSize;
pub use models::{
    ApiConfig, Config, LimiterConfig, ProviderConfig, QueueConfig, ServerConfig, StorageConfig,
    WorkerConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`BUNDLEBOX__*`)
    /// 2. TOML file (default: `config/bundlebox.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or validation fails
    /// (zero rate budget, zero concurrency, ...).
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Render the resolved configuration as TOML. Secrets are skipped.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_minimal_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[worker]
concurrency = 2
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.queue.max_attempts, 5);
    }

    #[test]
    fn test_validation_rejects_zero_budget() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[limiter]
rate_budget = "0"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::ValidationError(ValidationError::ZeroRateBudget)
        ));
    }

    #[test]
    fn test_full_config_example() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[server]
bind_addr = "0.0.0.0:8080"
queue_path = "data/queue"

[api]
max_payload_bytes = "128KB"
max_urls_per_bundle = 20

[worker]
concurrency = 4
poll_interval_ms = 200
progress_interval_ms = 100
checkpoint_interval_ms = 100
stall_timeout_secs = 30

[queue]
max_attempts = 3
backoff_base_ms = 500
backoff_max_ms = 10000
retention_days = 14

[limiter]
rate_budget = "5MB"

[provider]
base_url = "https://provider.test/api"
link_hosts = ["files.provider.test"]

[storage]
download_dir = "data/downloads"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(config_path).unwrap();

        assert_eq!(config.api.max_urls_per_bundle, 20);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.limiter.rate_budget.as_u64(), 5 * 1024 * 1024);
        assert_eq!(config.provider.link_hosts.len(), 1);
    }

    #[test]
    fn test_to_toml_renders_sections() {
        let rendered = Config::default().to_toml().unwrap();
        assert!(rendered.contains("[limiter]"));
        assert!(rendered.contains("rate_budget = \"10MB\""));
        assert!(!rendered.contains("password"));
    }
}
