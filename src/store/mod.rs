//! Day-partitioned log persistence
//!
//! Two interchangeable backends implement the same contract:
//!
//! - [`FileLogStore`]: one append-only JSON-lines file per UTC day
//! - [`SqliteLogStore`]: one embedded SQLite table with a partition-date column
//!
//! Every operation takes a [`CancellationToken`], checked on entry, while
//! waiting for the store's gate, and on each step of multi-item work. A write
//! is either fully appended or rejected before any byte reaches storage.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use logvault::store::{open_store, LogStore};
//!
//! let store = open_store(&config.storage).await?;
//! store.write(&entry, &cancel).await?;
//! let entries: Vec<_> = store.query(&query, &cancel).await?.try_collect().await?;
//! ```

pub mod error;
pub mod file;
pub mod sqlite;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::entry::{LogEntry, LogQuery};

pub use error::{Result, StoreError};
pub use file::FileLogStore;
pub use sqlite::SqliteLogStore;

/// Forward-only sequence of query results
///
/// Malformed stored records never appear here; only I/O, database,
/// cancellation and closed-store failures surface as `Err` items.
pub type EntryStream = BoxStream<'static, Result<LogEntry>>;

/// Producer-facing half of the store contract
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append one entry to the partition of its UTC date
    ///
    /// Returns once the entry is durably recorded.
    async fn write(&self, entry: &LogEntry, cancel: &CancellationToken) -> Result<()>;
}

/// Read, delete and teardown half of the store contract
#[async_trait]
pub trait LogStore: LogSink {
    /// Every partition holding at least one entry, ascending
    async fn list_partitions(&self, cancel: &CancellationToken) -> Result<BTreeSet<NaiveDate>>;

    /// Entries of one partition, filtered and ordered per the query
    ///
    /// An absent partition yields an empty stream.
    ///
    /// Backends differ in what an open stream holds. The file backend reads
    /// the partition up front and holds nothing. The SQLite backend keeps the
    /// store's gate until the stream is drained or dropped, so on SQLite every
    /// other call on the same store waits for it. Drain or drop a stream
    /// before writing to the store from the same task.
    async fn query(&self, query: &LogQuery, cancel: &CancellationToken) -> Result<EntryStream>;

    /// Remove a whole partition; absent partitions are a no-op
    async fn delete_partition(&self, date: NaiveDate, cancel: &CancellationToken) -> Result<()>;

    /// Release the underlying resource
    ///
    /// Later calls fail with [`StoreError::Closed`]. Closing twice is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Wait for `fut` (usually a gate acquisition) unless cancellation wins
pub(crate) async fn until_cancelled<F: Future>(
    fut: F,
    cancel: &CancellationToken,
) -> Result<F::Output> {
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        output = fut => Ok(output),
    }
}

/// Open the backend selected by configuration
pub async fn open_store(config: &StorageConfig) -> Result<Arc<dyn LogStore>> {
    let store: Arc<dyn LogStore> = match config.backend {
        StorageBackend::File => Arc::new(FileLogStore::open(&config.root_dir).await?),
        StorageBackend::Sqlite => Arc::new(SqliteLogStore::open(&config.database_url).await?),
    };
    info!(backend = ?config.backend, "Log store ready");
    Ok(store)
}
