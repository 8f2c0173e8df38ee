//! Tracing setup and store counters

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Counters shared by a store and the maintenance engine
#[derive(Debug, Default)]
pub struct Metrics {
    entries_written: AtomicU64,
    records_skipped: AtomicU64,
    partitions_deleted: AtomicU64,
    deletion_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_written(&self) {
        self.entries_written.fetch_add(1, Ordering::Relaxed);
    }

    /// A stored record could not be deserialized and was left out of a query
    pub fn record_skipped(&self) {
        self.records_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "records_skipped", "Metric incremented");
    }

    pub fn partition_deleted(&self) {
        self.partitions_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deletion_failed(&self) {
        self.deletion_failures.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "deletion_failures", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            entries_written: self.entries_written.load(Ordering::Relaxed),
            records_skipped: self.records_skipped.load(Ordering::Relaxed),
            partitions_deleted: self.partitions_deleted.load(Ordering::Relaxed),
            deletion_failures: self.deletion_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub entries_written: u64,
    pub records_skipped: u64,
    pub partitions_deleted: u64,
    pub deletion_failures: u64,
}
