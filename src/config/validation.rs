use super::models::{Config, StorageBackend};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("File backend requires a non-empty storage.root_dir")]
    MissingRootDir,

    #[error("SQLite backend requires a non-empty storage.database_url")]
    MissingDatabaseUrl,

    #[error("Invalid redaction pattern '{pattern}': {reason}")]
    InvalidRedactionPattern { pattern: String, reason: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_storage(config)?;
    validate_redaction(config)?;
    Ok(())
}

/// The selected backend needs its target
fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    match config.storage.backend {
        StorageBackend::File if config.storage.root_dir.as_os_str().is_empty() => {
            Err(ValidationError::MissingRootDir)
        }
        StorageBackend::Sqlite if config.storage.database_url.trim().is_empty() => {
            Err(ValidationError::MissingDatabaseUrl)
        }
        _ => Ok(()),
    }
}

/// Compile every extra pattern up front so startup fails instead of the first write
fn validate_redaction(config: &Config) -> Result<(), ValidationError> {
    for pattern in &config.redaction.extra_patterns {
        if pattern.trim().is_empty() {
            continue;
        }
        if let Err(err) = Regex::new(pattern) {
            return Err(ValidationError::InvalidRedactionPattern {
                pattern: pattern.clone(),
                reason: err.to_string(),
            });
        }
    }
    Ok(())
}
