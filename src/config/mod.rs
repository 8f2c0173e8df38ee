//! Configuration management for logvault
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use logvault::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Storage backend: {:?}", config.storage.backend);
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `LOGVAULT__<section>__<key>`
//!
//! Examples:
//! - `LOGVAULT__STORAGE__BACKEND=sqlite`
//! - `LOGVAULT__STORAGE__DATABASE_URL=sqlite:///var/lib/logvault/logs.db`
//! - `LOGVAULT__RETENTION__RETENTION_DAYS=7`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/logvault.toml`.
//! This can be overridden using the `LOGVAULT_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use models::{Config, RedactionConfig, RetentionConfig, StorageBackend, StorageConfig};
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
    /// 1. Environment variables (`LOGVAULT__*`)
    /// 2. TOML file (default: `config/logvault.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file is malformed
    /// - Validation fails (missing backend target, bad redaction pattern)
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
}
