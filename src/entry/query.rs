use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{LogEntry, LogLevel};

/// Read request targeting exactly one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    pub date: NaiveDate,
    pub min_level: Option<LogLevel>,
    /// Case-insensitive substring of the category
    pub category: Option<String>,
    /// Case-insensitive substring of the rendered message
    pub keyword: Option<String>,
    pub order_by_timestamp_descending: bool,
}

impl LogQuery {
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            date,
            min_level: None,
            category: None,
            keyword: None,
            order_by_timestamp_descending: false,
        }
    }

    pub fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = Some(level);
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    pub fn descending(mut self) -> Self {
        self.order_by_timestamp_descending = true;
        self
    }

    /// Category filter, or `None` when absent or blank
    pub fn category_filter(&self) -> Option<&str> {
        non_blank(self.category.as_deref())
    }

    /// Keyword filter, or `None` when absent or blank
    pub fn keyword_filter(&self) -> Option<&str> {
        non_blank(self.keyword.as_deref())
    }

    /// Apply the level/category/keyword predicates to one entry
    ///
    /// The partition date is not checked here; it selects the storage unit.
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(min) = self.min_level {
            if entry.level() < min {
                return false;
            }
        }
        if let Some(category) = self.category_filter() {
            if !contains_ignore_case(entry.category(), category) {
                return false;
            }
        }
        if let Some(keyword) = self.keyword_filter() {
            if !contains_ignore_case(entry.rendered_message(), keyword) {
                return false;
            }
        }
        true
    }

    /// Filter and order a materialized partition in memory
    pub fn apply(&self, entries: Vec<LogEntry>) -> Vec<LogEntry> {
        let mut selected: Vec<LogEntry> = entries.into_iter().filter(|e| self.matches(e)).collect();
        if self.order_by_timestamp_descending {
            selected.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        } else {
            selected.sort_by_key(|e| e.timestamp());
        }
        selected
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}
