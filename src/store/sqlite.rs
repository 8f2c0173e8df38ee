//! Embedded SQLite backend
//!
//! All partitions live in one `logs` table keyed by a `partition_date` text
//! column (`yyyy-MM-dd`), indexed together with `level`. Filtering and
//! ordering run inside SQLite. The single connection sits behind a gate
//! that admits one operation at a time; a query cursor keeps the gate until
//! it is drained or dropped.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection, QueryBuilder, Row, Sqlite};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::entry::{
    LogEntry, LogLevel, LogQuery, ParseLevelError, Properties, format_partition_date,
    parse_partition_date,
};
use crate::observability::Metrics;

use super::error::{Result, StoreError};
use super::{EntryStream, LogSink, LogStore, until_cancelled};

/// Rows buffered between the cursor task and the consumer
const QUERY_CHANNEL_CAPACITY: usize = 64;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS logs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        partition_date   TEXT    NOT NULL,
        timestamp        TEXT    NOT NULL,
        level            INTEGER NOT NULL,
        category         TEXT    NOT NULL,
        message_template TEXT    NOT NULL,
        rendered_message TEXT    NOT NULL,
        exception_detail TEXT    NULL,
        properties       TEXT    NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_logs_partition_date ON logs(partition_date)",
    "CREATE INDEX IF NOT EXISTS ix_logs_level ON logs(level)",
];

const INSERT_ENTRY: &str = r#"
    INSERT INTO logs (
        partition_date, timestamp, level, category,
        message_template, rendered_message, exception_detail, properties
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
"#;

type Gate = Arc<Mutex<Option<SqliteConnection>>>;

#[derive(Debug, Error)]
enum RowError {
    #[error("column: {0}")]
    Column(#[from] sqlx::Error),
    #[error("timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("level: {0}")]
    Level(#[from] ParseLevelError),
    #[error("properties: {0}")]
    Properties(#[from] serde_json::Error),
}

/// Fixed-width UTC text, so lexical order equals chronological order
fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// `%needle%` with LIKE wildcards in the needle escaped by `\`
fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn select_statement(query: &LogQuery) -> QueryBuilder<'static, Sqlite> {
    let mut builder = QueryBuilder::new(
        "SELECT timestamp, level, category, message_template, rendered_message, \
         exception_detail, properties FROM logs WHERE partition_date = ",
    );
    builder.push_bind(format_partition_date(query.date));

    if let Some(min_level) = query.min_level {
        builder.push(" AND level >= ").push_bind(min_level.as_i64());
    }
    if let Some(category) = query.category_filter() {
        builder
            .push(" AND category LIKE ")
            .push_bind(like_pattern(category))
            .push(" ESCAPE '\\'");
    }
    if let Some(keyword) = query.keyword_filter() {
        builder
            .push(" AND rendered_message LIKE ")
            .push_bind(like_pattern(keyword))
            .push(" ESCAPE '\\'");
    }

    let direction = if query.order_by_timestamp_descending {
        "DESC"
    } else {
        "ASC"
    };
    builder.push(format!(" ORDER BY timestamp {direction}, id ASC"));
    builder
}

fn decode_row(row: &SqliteRow) -> std::result::Result<LogEntry, RowError> {
    let timestamp: String = row.try_get("timestamp")?;
    let level: i64 = row.try_get("level")?;
    let exception_detail: Option<String> = row.try_get("exception_detail")?;
    let properties: Option<String> = row.try_get("properties")?;

    let properties = match properties {
        Some(raw) => serde_json::from_str::<Properties>(&raw)?,
        None => Properties::new(),
    };

    let mut entry = LogEntry::new(
        DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
        LogLevel::try_from(level)?,
        row.try_get::<String, _>("category")?,
        row.try_get::<String, _>("message_template")?,
        row.try_get::<String, _>("rendered_message")?,
    )
    .with_properties(properties);
    if let Some(detail) = exception_detail {
        entry = entry.with_exception(detail);
    }
    Ok(entry)
}

/// Drive one query cursor, forwarding decoded rows until drained
///
/// Owning the guard keeps every other operation out until the cursor ends,
/// the consumer drops the stream, or cancellation is observed.
async fn stream_rows(
    mut guard: OwnedMutexGuard<Option<SqliteConnection>>,
    query: LogQuery,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
    tx: mpsc::Sender<Result<LogEntry>>,
) {
    let Some(conn) = guard.as_mut() else {
        let _ = tx.send(Err(StoreError::Closed)).await;
        return;
    };

    let mut builder = select_statement(&query);
    let mut rows = builder.build().fetch(conn);
    let mut yielded = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = tx.closed() => return,
            next = rows.try_next() => Some(next),
        };
        let Some(next) = next else {
            let _ = tx.send(Err(StoreError::Cancelled)).await;
            return;
        };

        match next {
            Ok(Some(row)) => match decode_row(&row) {
                Ok(entry) => {
                    if tx.send(Ok(entry)).await.is_err() {
                        return;
                    }
                    yielded += 1;
                }
                Err(err) => {
                    metrics.record_skipped();
                    debug!(error = %err, "Skipping malformed log row");
                }
            },
            Ok(None) => {
                debug!(date = %query.date, yielded, "Query cursor drained");
                return;
            }
            Err(err) => {
                let _ = tx.send(Err(err.into())).await;
                return;
            }
        }
    }
}

/// SQLite-backed log store over a single connection
pub struct SqliteLogStore {
    conn: Gate,
    metrics: Arc<Metrics>,
}

impl SqliteLogStore {
    /// Open (creating if missing) the database at `database_url`
    ///
    /// Accepts `sqlite://path`, `sqlite:path`, a bare path, or
    /// `sqlite::memory:`. The schema is created if absent.
    pub async fn open(database_url: &str) -> Result<Self> {
        if database_url.trim().is_empty() {
            return Err(StoreError::InvalidTarget("empty database url".to_string()));
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::InvalidTarget(format!("{database_url}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        if let Some(parent) = options
            .get_filename()
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut conn = options.connect().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut conn).await?;
        }

        info!("Opened SQLite log store at: {}", options.get_filename().display());
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
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
}

#[async_trait]
impl LogSink for SqliteLogStore {
    async fn write(&self, entry: &LogEntry, cancel: &CancellationToken) -> Result<()> {
        let properties = serde_json::to_string(entry.properties())?;
        let date = format_partition_date(entry.partition_date());

        let mut guard = until_cancelled(self.conn.lock(), cancel).await?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        sqlx::query(INSERT_ENTRY)
            .bind(&date)
            .bind(format_timestamp(entry.timestamp()))
            .bind(entry.level().as_i64())
            .bind(entry.category())
            .bind(entry.message_template())
            .bind(entry.rendered_message())
            .bind(entry.exception_detail())
            .bind(properties)
            .execute(&mut *conn)
            .await?;

        self.metrics.entry_written();
        debug!(date, "Inserted log entry");
        Ok(())
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn list_partitions(&self, cancel: &CancellationToken) -> Result<BTreeSet<NaiveDate>> {
        let mut guard = until_cancelled(self.conn.lock(), cancel).await?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;

        let mut dates = BTreeSet::new();
        let mut rows = sqlx::query("SELECT DISTINCT partition_date FROM logs ORDER BY partition_date")
            .fetch(&mut *conn);
        while let Some(row) = rows.try_next().await? {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let text: String = row.try_get(0)?;
            match parse_partition_date(&text) {
                Some(date) => {
                    dates.insert(date);
                }
                None => debug!(partition = %text, "Ignoring unparsable partition key"),
            }
        }

        Ok(dates)
    }

    async fn query(&self, query: &LogQuery, cancel: &CancellationToken) -> Result<EntryStream> {
        let guard = until_cancelled(Arc::clone(&self.conn).lock_owned(), cancel).await?;
        if guard.is_none() {
            return Err(StoreError::Closed);
        }

        let (tx, rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
        tokio::spawn(stream_rows(
            guard,
            query.clone(),
            cancel.clone(),
            Arc::clone(&self.metrics),
            tx,
        ));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn delete_partition(&self, date: NaiveDate, cancel: &CancellationToken) -> Result<()> {
        let mut guard = until_cancelled(self.conn.lock(), cancel).await?;
        let conn = guard.as_mut().ok_or(StoreError::Closed)?;

        let result = sqlx::query("DELETE FROM logs WHERE partition_date = ?")
            .bind(format_partition_date(date))
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() > 0 {
            self.metrics.partition_deleted();
            info!(%date, rows = result.rows_affected(), "Deleted log partition rows");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.close().await?;
            info!("Closed SQLite log store");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn create_test_store() -> SqliteLogStore {
        SqliteLogStore::open("sqlite::memory:").await.unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
    }

    fn create_test_entry(hour: u32, level: LogLevel, category: &str, message: &str) -> LogEntry {
        LogEntry::new(
            Utc.with_ymd_and_hms(2024, 7, 1, hour, 0, 0).unwrap(),
            level,
            category,
            message,
            message,
        )
    }

    async fn collect(store: &SqliteLogStore, query: LogQuery) -> Vec<LogEntry> {
        let cancel = CancellationToken::new();
        store.query(&query, &cancel).await.unwrap().try_collect().await.unwrap()
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("abc"), "%abc%");
        assert_eq!(like_pattern("50%_a\\b"), "%50\\%\\_a\\\\b%");
    }

    #[test]
    fn test_timestamp_text_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert_eq!(format_timestamp(a), "2024-07-01T09:00:00.000000000Z");
        assert!(format_timestamp(a) < format_timestamp(b));
    }

    #[tokio::test]
    async fn test_filter_by_min_level_and_order() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        store
            .write(&create_test_entry(1, LogLevel::Warning, "S", "warn"), &cancel)
            .await
            .unwrap();
        store
            .write(&create_test_entry(2, LogLevel::Error, "S", "err"), &cancel)
            .await
            .unwrap();
        store
            .write(&create_test_entry(3, LogLevel::Critical, "S", "crit"), &cancel)
            .await
            .unwrap();

        let found = collect(
            &store,
            LogQuery::for_date(day()).min_level(LogLevel::Error).descending(),
        )
        .await;

        let messages: Vec<_> = found.iter().map(|e| e.rendered_message()).collect();
        assert_eq!(messages, ["crit", "err"]);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_all_fields() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        let timestamp = Utc.with_ymd_and_hms(2024, 7, 1, 6, 30, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let entry = LogEntry::new(
            timestamp,
            LogLevel::Error,
            "Orders.Api",
            "Order {OrderId} failed",
            "Order 7 failed",
        )
        .with_exception("System.TimeoutException: upstream")
        .with_properties([("OrderId", 7)].into_iter().collect());

        store.write(&entry, &cancel).await.unwrap();

        assert_eq!(collect(&store, LogQuery::for_date(day())).await, vec![entry]);
    }

    #[tokio::test]
    async fn test_substring_filters() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        for (hour, category, message) in [
            (1, "Billing.Worker", "charged 50% upfront"),
            (2, "Billing.Worker", "charged 500 units"),
            (3, "Shipping", "charged 50% on delivery"),
        ] {
            store
                .write(&create_test_entry(hour, LogLevel::Information, category, message), &cancel)
                .await
                .unwrap();
        }

        let found = collect(&store, LogQuery::for_date(day()).category("billing").keyword("50%")).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].rendered_message(), "charged 50% upfront");

        let found = collect(&store, LogQuery::for_date(day()).category("  ")).await;
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn test_list_partitions_distinct_ascending() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        for (d, h) in [(3, 1), (1, 5), (3, 2), (2, 0)] {
            let entry = LogEntry::new(
                Utc.with_ymd_and_hms(2024, 7, d, h, 0, 0).unwrap(),
                LogLevel::Information,
                "c",
                "m",
                "m",
            );
            store.write(&entry, &cancel).await.unwrap();
        }

        let dates: Vec<_> = store.list_partitions(&cancel).await.unwrap().into_iter().collect();
        let expected: Vec<_> = (1..=3)
            .map(|d| NaiveDate::from_ymd_opt(2024, 7, d).unwrap())
            .collect();
        assert_eq!(dates, expected);
    }

    #[tokio::test]
    async fn test_delete_partition_is_idempotent() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        store
            .write(&create_test_entry(1, LogLevel::Error, "c", "m"), &cancel)
            .await
            .unwrap();

        store.delete_partition(day(), &cancel).await.unwrap();
        store.delete_partition(day(), &cancel).await.unwrap();
        store
            .delete_partition(NaiveDate::from_ymd_opt(1999, 1, 1).unwrap(), &cancel)
            .await
            .unwrap();

        assert!(store.list_partitions(&cancel).await.unwrap().is_empty());
        assert!(collect(&store, LogQuery::for_date(day())).await.is_empty());
        assert_eq!(store.metrics().snapshot().partitions_deleted, 1);
    }

    #[tokio::test]
    async fn test_malformed_row_is_skipped() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        let good = create_test_entry(2, LogLevel::Error, "c", "good");
        store.write(&good, &cancel).await.unwrap();
        {
            let mut guard = store.conn.lock().await;
            let conn = guard.as_mut().unwrap();
            sqlx::query(INSERT_ENTRY)
                .bind("2024-07-01")
                .bind("2024-07-01T01:00:00.000000000Z")
                .bind(LogLevel::Error.as_i64())
                .bind("c")
                .bind("t")
                .bind("bad properties")
                .bind(None::<String>)
                .bind("{not json")
                .execute(&mut *conn)
                .await
                .unwrap();
            sqlx::query(INSERT_ENTRY)
                .bind("2024-07-01")
                .bind("yesterday")
                .bind(99i64)
                .bind("c")
                .bind("t")
                .bind("bad level and time")
                .bind(None::<String>)
                .bind(None::<String>)
                .execute(&mut *conn)
                .await
                .unwrap();
        }

        assert_eq!(collect(&store, LogQuery::for_date(day())).await, vec![good]);
        assert_eq!(store.metrics().snapshot().records_skipped, 2);
    }

    #[tokio::test]
    async fn test_null_properties_read_as_empty() {
        let store = create_test_store().await;
        {
            let mut guard = store.conn.lock().await;
            sqlx::query(INSERT_ENTRY)
                .bind("2024-07-01")
                .bind("2024-07-01T01:00:00.000000000Z")
                .bind(LogLevel::Information.as_i64())
                .bind("c")
                .bind("t")
                .bind("r")
                .bind(None::<String>)
                .bind(None::<String>)
                .execute(guard.as_mut().unwrap())
                .await
                .unwrap();
        }

        let found = collect(&store, LogQuery::for_date(day())).await;
        assert_eq!(found.len(), 1);
        assert!(found[0].properties().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_cursor_releases_gate() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        for hour in 0..10 {
            store
                .write(&create_test_entry(hour, LogLevel::Information, "c", "m"), &cancel)
                .await
                .unwrap();
        }

        let mut stream = store.query(&LogQuery::for_date(day()), &cancel).await.unwrap();
        assert!(stream.next().await.is_some());
        drop(stream);

        let after = create_test_entry(11, LogLevel::Error, "c", "after");
        let write = store.write(&after, &cancel);
        tokio::time::timeout(Duration::from_secs(5), write)
            .await
            .expect("gate released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_undrained_cursor_holds_gate() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        for _ in 0..(QUERY_CHANNEL_CAPACITY * 2) {
            let entry = create_test_entry(1, LogLevel::Information, "c", "m");
            store.write(&entry, &cancel).await.unwrap();
        }

        let stream = store.query(&LogQuery::for_date(day()), &cancel).await.unwrap();
        let blocked = create_test_entry(2, LogLevel::Error, "c", "blocked");
        let attempt =
            tokio::time::timeout(Duration::from_millis(200), store.write(&blocked, &cancel)).await;
        assert!(attempt.is_err(), "write should wait for the open cursor");

        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), store.write(&blocked, &cancel))
            .await
            .expect("gate released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_operations_are_rejected() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let entry = create_test_entry(1, LogLevel::Error, "c", "m");
        assert!(matches!(store.write(&entry, &cancel).await, Err(StoreError::Cancelled)));
        assert!(matches!(
            store.query(&LogQuery::for_date(day()), &cancel).await,
            Err(StoreError::Cancelled)
        ));

        let live = CancellationToken::new();
        assert!(store.list_partitions(&live).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let store = create_test_store().await;
        let cancel = CancellationToken::new();
        store.close().await.unwrap();
        store.close().await.unwrap();

        let entry = create_test_entry(1, LogLevel::Error, "c", "m");
        assert!(matches!(store.write(&entry, &cancel).await, Err(StoreError::Closed)));
        assert!(matches!(store.list_partitions(&cancel).await, Err(StoreError::Closed)));
        assert!(matches!(
            store.query(&LogQuery::for_date(day()), &cancel).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.delete_partition(day(), &cancel).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_reopen_keeps_data_and_schema() {
        let temp_dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", temp_dir.path().join("db/logs.db").display());
        let cancel = CancellationToken::new();
        let entry = create_test_entry(4, LogLevel::Warning, "c", "persisted");

        let store = SqliteLogStore::open(&url).await.unwrap();
        store.write(&entry, &cancel).await.unwrap();
        store.close().await.unwrap();

        let reopened = SqliteLogStore::open(&url).await.unwrap();
        assert_eq!(collect(&reopened, LogQuery::for_date(day())).await, vec![entry]);
        reopened.close().await.unwrap();
    }
}
