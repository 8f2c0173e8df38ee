//! Masking of secrets in free text and structured properties
//!
//! Every pattern has a prefix group (the label, kept) and a secret group (the
//! value, replaced by [`REDACTION_MARKER`]), so `password=hunter2` becomes
//! `password=[REDACTED]`. Patterns run in registration order over the whole
//! text and every match is replaced.
//!
//! A process-wide [`Redactor`] seeded with the built-in patterns backs the
//! free functions in this module. Producers call them before handing an
//! entry to a store; stores never redact on their own.

use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::entry::{Properties, PropertyValue};

pub const REDACTION_MARKER: &str = "[REDACTED]";

const REPLACEMENT: &str = "${1}[REDACTED]";

/// Built-in secret shapes
pub const DEFAULT_PATTERNS: &[&str] = &[
    r"(?i)(access_token\s*[=:]\s*)([^&\s]+)",
    r"(?i)(refresh_token\s*[=:]\s*)([^&\s]+)",
    r"(?i)(client_secret\s*[=:]\s*)([^&\s]+)",
    r"(?i)(password\s*[=:]\s*)([^&\s]+)",
    r"(?i)(pwd\s*[=:]\s*)([^&\s]+)",
    r"(?i)(bearer\s+)([A-Za-z0-9_\-\.]+)",
    r"(?i)(https?://\S*oauth\S*?[?&#](?:access_token|id_token|token|code)=)([^&\s#]+)",
];

#[derive(Debug, Error)]
pub enum RedactionError {
    #[error("Invalid redaction pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

pub type Result<T> = std::result::Result<T, RedactionError>;

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| RedactionError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

fn default_set() -> Vec<Regex> {
    DEFAULT_PATTERNS
        .iter()
        .filter_map(|pattern| compile(pattern).ok())
        .collect()
}

/// Ordered, shareable set of redaction patterns
///
/// Mutations swap in a new snapshot; a `redact` call that is already running
/// keeps using the snapshot it started with.
pub struct Redactor {
    patterns: RwLock<Arc<Vec<Regex>>>,
}

impl Redactor {
    /// Redactor holding exactly the built-in patterns
    pub fn with_defaults() -> Self {
        Self {
            patterns: RwLock::new(Arc::new(default_set())),
        }
    }

    /// Append a custom pattern after the existing ones
    ///
    /// Blank patterns are ignored. Syntax errors are reported immediately.
    pub fn add_pattern(&self, pattern: &str) -> Result<()> {
        if pattern.trim().is_empty() {
            return Ok(());
        }

        let regex = compile(pattern)?;
        let mut guard = self.patterns.write();
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(regex);
        *guard = Arc::new(next);
        debug!(pattern, "Registered redaction pattern");
        Ok(())
    }

    /// Drop every custom pattern and restore the built-in set
    pub fn reset_to_defaults(&self) {
        *self.patterns.write() = Arc::new(default_set());
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.read().len()
    }

    fn snapshot(&self) -> Arc<Vec<Regex>> {
        Arc::clone(&self.patterns.read())
    }

    pub fn redact(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let patterns = self.snapshot();
        let mut output = text.to_string();
        for regex in patterns.iter() {
            if regex.is_match(&output) {
                output = regex.replace_all(&output, REPLACEMENT).into_owned();
            }
        }
        output
    }

    /// Normalize a property map and redact its string values
    ///
    /// Keys become case-insensitive (first occurrence wins). Booleans,
    /// numbers, timestamps, UUIDs and nulls pass through untouched.
    pub fn redact_properties<I, K, V>(&self, properties: I) -> Properties
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        let mut normalized = Properties::new();
        for (key, value) in properties {
            let value = match value.into() {
                PropertyValue::String(text) => PropertyValue::String(self.redact(&text)),
                other => other,
            };
            normalized.insert(key, value);
        }
        normalized
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::with_defaults()
    }
}

static GLOBAL: LazyLock<Redactor> = LazyLock::new(Redactor::with_defaults);

/// The process-wide redactor
pub fn global() -> &'static Redactor {
    &GLOBAL
}

pub fn redact(text: &str) -> String {
    GLOBAL.redact(text)
}

pub fn redact_properties<I, K, V>(properties: I) -> Properties
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<PropertyValue>,
{
    GLOBAL.redact_properties(properties)
}

pub fn add_pattern(pattern: &str) -> Result<()> {
    GLOBAL.add_pattern(pattern)
}

pub fn reset_to_defaults() {
    GLOBAL.reset_to_defaults()
}
