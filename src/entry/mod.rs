//! Canonical log record and read request
//!
//! A `LogEntry` is built once by a producer and never mutated afterwards;
//! stores only serialize and deserialize it. Entries are grouped into
//! partitions by the UTC calendar date of their timestamp.

mod level;
mod properties;
mod query;

pub use level::{LogLevel, ParseLevelError};
pub use properties::{Properties, PropertyValue};
pub use query::LogQuery;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Text form of a partition key, e.g. `2024-05-10`
pub const PARTITION_DATE_FORMAT: &str = "%Y-%m-%d";

/// Partition key for a timestamp: its UTC calendar date
pub fn partition_date(timestamp: DateTime<Utc>) -> NaiveDate {
    timestamp.date_naive()
}

pub fn format_partition_date(date: NaiveDate) -> String {
    date.format(PARTITION_DATE_FORMAT).to_string()
}

/// Strict inverse of `format_partition_date`
///
/// Text that parses but does not re-format to itself (`2024-5-1`) is rejected
/// so that every key maps to exactly one stored name.
pub fn parse_partition_date(text: &str) -> Option<NaiveDate> {
    let date = NaiveDate::parse_from_str(text, PARTITION_DATE_FORMAT).ok()?;
    (format_partition_date(date) == text).then_some(date)
}

/// One immutable structured log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    timestamp: DateTime<Utc>,
    level: LogLevel,
    category: String,
    message_template: String,
    rendered_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exception_detail: Option<String>,
    #[serde(default)]
    properties: Properties,
}

impl LogEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        level: LogLevel,
        category: impl Into<String>,
        message_template: impl Into<String>,
        rendered_message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            level,
            category: category.into(),
            message_template: message_template.into(),
            rendered_message: rendered_message.into(),
            exception_detail: None,
            properties: Properties::new(),
        }
    }

    pub fn with_exception(mut self, detail: impl Into<String>) -> Self {
        self.exception_detail = Some(detail.into());
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn message_template(&self) -> &str {
        &self.message_template
    }

    pub fn rendered_message(&self) -> &str {
        &self.rendered_message
    }

    pub fn exception_detail(&self) -> Option<&str> {
        self.exception_detail.as_deref()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    pub fn partition_date(&self) -> NaiveDate {
        partition_date(self.timestamp)
    }
}
