//! JSON-lines backend: one append-only file per UTC day
//!
//! Layout under the root directory:
//!
//! - `{yyyy-MM-dd}.jsonl`: one serialized `LogEntry` per line
//!
//! Anything else in the directory is ignored. Writes and deletes go through
//! one gate; reads never take it and may observe a file mid-append, so an
//! unterminated last line is kept only if it parses as a whole record.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::StreamExt;
use futures::stream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entry::{LogEntry, LogQuery, format_partition_date, parse_partition_date};
use crate::observability::Metrics;

use super::error::{Result, StoreError};
use super::{EntryStream, LogSink, LogStore, until_cancelled};

pub const PARTITION_FILE_EXTENSION: &str = "jsonl";

#[cfg(windows)]
const LINE_ENDING: &str = "\r\n";
#[cfg(not(windows))]
const LINE_ENDING: &str = "\n";

/// File name of a partition: `2024-05-10.jsonl`
pub fn partition_file_name(date: NaiveDate) -> String {
    format!("{}.{}", format_partition_date(date), PARTITION_FILE_EXTENSION)
}

/// Inverse of `partition_file_name`; `None` for any other name
pub fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let stem = name.strip_suffix(PARTITION_FILE_EXTENSION)?.strip_suffix('.')?;
    parse_partition_date(stem)
}

/// File-per-day log store
pub struct FileLogStore {
    root: PathBuf,
    write_gate: Arc<Mutex<()>>,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl FileLogStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(StoreError::InvalidTarget("empty root directory".to_string()));
        }

        tokio::fs::create_dir_all(root).await?;
        info!("Opened file log store at: {}", root.display());

        Ok(Self {
            root: root.to_path_buf(),
            write_gate: Arc::new(Mutex::new(())),
            closed: AtomicBool::new(false),
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Share counters with other components
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(partition_file_name(date))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn parse_partition(&self, bytes: &[u8], cancel: &CancellationToken) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();

        for (index, raw) in bytes.split(|b| *b == b'\n').enumerate() {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let line = raw.trim_ascii();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<LogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    self.metrics.record_skipped();
                    debug!(line = index + 1, error = %err, "Skipping malformed log record");
                }
            }
        }

        Ok(entries)
    }
}

/// Append one record, sealing a torn last line left by an earlier crash
fn append_line(path: &Path, line: &[u8]) -> io::Result<()> {
    let created = !path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    let mut buf = Vec::with_capacity(line.len() + LINE_ENDING.len());
    if file.metadata()?.len() > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            buf.extend_from_slice(LINE_ENDING.as_bytes());
        }
    }
    buf.extend_from_slice(line);

    file.write_all(&buf)?;
    file.sync_data()?;

    if created {
        sync_parent_dir(path)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => std::fs::File::open(parent)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[async_trait]
impl LogSink for FileLogStore {
    async fn write(&self, entry: &LogEntry, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;

        let mut line = serde_json::to_string(entry)?;
        line.push_str(LINE_ENDING);
        let date = entry.partition_date();
        let path = self.partition_path(date);

        let guard = until_cancelled(Arc::clone(&self.write_gate).lock_owned(), cancel).await?;
        // Closing or cancelling while queued on the gate rejects the write untouched
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let root = self.root.clone();
        // The guard moves into the blocking task so a dropped caller cannot
        // release the gate before the append finishes.
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            std::fs::create_dir_all(&root)?;
            append_line(&path, line.as_bytes())
        })
        .await
        .map_err(io::Error::other)??;

        self.metrics.entry_written();
        debug!(%date, "Appended log entry");
        Ok(())
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn list_partitions(&self, cancel: &CancellationToken) -> Result<BTreeSet<NaiveDate>> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let mut dates = BTreeSet::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(dates),
            Err(err) => return Err(err.into()),
        };

        while let Some(item) = dir.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let Some(date) = item.file_name().to_str().and_then(date_from_file_name) else {
                continue;
            };
            // A file created by an append that never landed holds no entries
            let metadata = item.metadata().await?;
            if metadata.is_file() && metadata.len() > 0 {
                dates.insert(date);
            }
        }

        Ok(dates)
    }

    async fn query(&self, query: &LogQuery, cancel: &CancellationToken) -> Result<EntryStream> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        let path = self.partition_path(query.date);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(stream::empty().boxed());
            }
            Err(err) => return Err(err.into()),
        };

        let entries = self.parse_partition(&bytes, cancel)?;
        let selected = query.apply(entries);
        debug!(date = %query.date, matched = selected.len(), "Queried partition file");

        Ok(stream::iter(selected.into_iter().map(Ok)).boxed())
    }

    async fn delete_partition(&self, date: NaiveDate, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        let _guard = until_cancelled(self.write_gate.lock(), cancel).await?;
        self.ensure_open()?;

        match tokio::fs::remove_file(self.partition_path(date)).await {
            Ok(()) => {
                self.metrics.partition_deleted();
                info!(%date, "Deleted log partition file");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Wait out an append that already holds the gate
        let _guard = self.write_gate.lock().await;
        info!("Closed file log store at: {}", self.root.display());
        Ok(())
    }
}
