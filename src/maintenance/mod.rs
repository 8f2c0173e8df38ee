//! Retention and explicit deletion of log partitions
//!
//! One [`LogMaintenance::execute`] pass:
//!
//! 1. takes a snapshot of the store's partitions,
//! 2. deletes, oldest first, every partition older than
//!    `today - retention_days` (when retention is enabled),
//! 3. deletes every explicitly marked date present in the snapshot and
//!    clears the mark, whether or not the deletion worked.
//!
//! Deletion failures are logged and collected in the report; they never stop
//! the remaining deletions. Partitions created after the snapshot are left
//! for the next pass.
//!
//! Nothing here schedules itself: a timer or CLI command calls `execute`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use dashmap::DashSet;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::observability::Metrics;
use crate::store::{LogStore, Result, StoreError};

/// Why a partition was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionReason {
    Retention,
    Explicit,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletionFailure {
    pub date: NaiveDate,
    pub reason: DeletionReason,
    pub error: String,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub retention_deleted: Vec<NaiveDate>,
    pub explicit_deleted: Vec<NaiveDate>,
    /// Marks consumed without a deletion (date absent from the snapshot)
    pub explicit_skipped: Vec<NaiveDate>,
    pub failures: Vec<DeletionFailure>,
}

impl MaintenanceReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn deleted_count(&self) -> usize {
        self.retention_deleted.len() + self.explicit_deleted.len()
    }
}

/// Retention window plus a queue of one-shot deletion requests
pub struct LogMaintenance {
    retention_days: Option<i64>,
    explicit_delete_dates: DashSet<NaiveDate>,
    metrics: Arc<Metrics>,
}

impl LogMaintenance {
    /// `None` or a negative value disables age-based expiry
    pub fn new(retention_days: Option<i64>) -> Self {
        Self {
            retention_days,
            explicit_delete_dates: DashSet::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn from_config(config: &RetentionConfig) -> Self {
        Self::new(config.retention_days)
    }

    /// Share counters with other components
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn retention_days(&self) -> Option<i64> {
        self.retention_days
    }

    /// First date that survives retention, or `None` when retention is off
    pub fn retention_threshold(&self, today: NaiveDate) -> Option<NaiveDate> {
        let days = u64::try_from(self.retention_days?).ok()?;
        Some(today.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN))
    }

    pub fn add_explicit_delete_date(&self, date: NaiveDate) {
        self.explicit_delete_dates.insert(date);
    }

    /// Returns whether the date was marked
    pub fn remove_explicit_delete_date(&self, date: NaiveDate) -> bool {
        self.explicit_delete_dates.remove(&date).is_some()
    }

    /// Pending marks, ascending
    pub fn explicit_delete_dates(&self) -> Vec<NaiveDate> {
        let dates: BTreeSet<NaiveDate> = self.explicit_delete_dates.iter().map(|d| *d).collect();
        dates.into_iter().collect()
    }

    /// Run one maintenance pass against `store`
    ///
    /// Fails only if the partition list cannot be read (no marks are consumed
    /// then) or if `cancel` fires, which stops the pass between deletions.
    pub async fn execute(
        &self,
        store: &dyn LogStore,
        today: NaiveDate,
        cancel: &CancellationToken,
    ) -> Result<MaintenanceReport> {
        let partitions = store.list_partitions(cancel).await?;
        let mut report = MaintenanceReport::default();

        if let Some(threshold) = self.retention_threshold(today) {
            for date in partitions.iter().copied().filter(|d| *d < threshold) {
                if cancel.is_cancelled() {
                    return Err(StoreError::Cancelled);
                }
                match self.delete(store, date, DeletionReason::Retention, cancel).await {
                    Ok(()) => report.retention_deleted.push(date),
                    Err(failure) => report.failures.push(failure),
                }
            }
        }

        for date in self.explicit_delete_dates() {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let present = partitions.contains(&date) && !report.retention_deleted.contains(&date);
            if present {
                match self.delete(store, date, DeletionReason::Explicit, cancel).await {
                    Ok(()) => report.explicit_deleted.push(date),
                    Err(failure) => report.failures.push(failure),
                }
            } else {
                report.explicit_skipped.push(date);
            }
            // One-shot: the mark is gone whatever happened above
            self.explicit_delete_dates.remove(&date);
        }

        info!(
            %today,
            retention_days = ?self.retention_days,
            partitions = partitions.len(),
            retention_deleted = report.retention_deleted.len(),
            explicit_deleted = report.explicit_deleted.len(),
            failures = report.failures.len(),
            "Log maintenance complete"
        );
        Ok(report)
    }

    async fn delete(
        &self,
        store: &dyn LogStore,
        date: NaiveDate,
        reason: DeletionReason,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), DeletionFailure> {
        match store.delete_partition(date, cancel).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.metrics.deletion_failed();
                warn!(%date, ?reason, error = %err, "Failed to delete log partition");
                Err(DeletionFailure {
                    date,
                    reason,
                    error: err.to_string(),
                })
            }
        }
    }
}
