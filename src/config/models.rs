use crate::redaction::{RedactionError, Redactor};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

/// Storage backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    File,
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Directory holding one `{yyyy-MM-dd}.jsonl` file per day (file backend)
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Connection string, e.g. `sqlite://data/logs.db` or `sqlite::memory:`
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            root_dir: default_root_dir(),
            database_url: default_database_url(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("data/logs")
}

fn default_database_url() -> String {
    "sqlite://data/logs.db".to_string()
}

/// Retention configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RetentionConfig {
    /// Days of partitions to keep; absent or negative disables expiry
    #[serde(default)]
    pub retention_days: Option<i64>,
}

impl RetentionConfig {
    pub fn is_enabled(&self) -> bool {
        matches!(self.retention_days, Some(days) if days >= 0)
    }
}

/// Redaction configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RedactionConfig {
    /// Appended after the built-in patterns
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

impl RedactionConfig {
    /// Register every extra pattern with `redactor`
    pub fn install(&self, redactor: &Redactor) -> Result<(), RedactionError> {
        for pattern in &self.extra_patterns {
            redactor.add_pattern(pattern)?;
        }
        Ok(())
    }
}
