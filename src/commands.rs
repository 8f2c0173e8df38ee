use chrono::Utc;
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use logvault::config::Config;
use logvault::entry::{LogEntry, LogQuery, PropertyValue};
use logvault::maintenance::LogMaintenance;
use logvault::redaction;
use logvault::store::{LogStore, open_store};

use crate::cli::{Commands, MaintainArgs, QueryArgs, WriteArgs};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(command: Commands) -> Result<(), AnyError> {
    let config = Config::load()?;
    config.redaction.install(redaction::global())?;

    let store = open_store(&config.storage).await?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    let result = match command {
        Commands::Partitions => partitions(store.as_ref(), &cancel).await,
        Commands::Query(args) => query(store.as_ref(), args, &cancel).await,
        Commands::Write(args) => write(store.as_ref(), args, &cancel).await,
        Commands::Maintain(args) => maintain(store.as_ref(), &config, args, &cancel).await,
    };

    finish(store.as_ref(), result).await
}

/// Close the store; the command's own error wins over a close failure
async fn finish(store: &dyn LogStore, result: Result<(), AnyError>) -> Result<(), AnyError> {
    let closed = store.close().await.map_err(AnyError::from);
    result.and(closed)
}

async fn partitions(store: &dyn LogStore, cancel: &CancellationToken) -> Result<(), AnyError> {
    for date in store.list_partitions(cancel).await? {
        println!("{date}");
    }
    Ok(())
}

async fn query(
    store: &dyn LogStore,
    args: QueryArgs,
    cancel: &CancellationToken,
) -> Result<(), AnyError> {
    let mut query = LogQuery::for_date(args.date);
    if let Some(level) = args.min_level {
        query = query.min_level(level);
    }
    if let Some(category) = args.category {
        query = query.category(category);
    }
    if let Some(keyword) = args.keyword {
        query = query.keyword(keyword);
    }
    if args.desc {
        query = query.descending();
    }

    let mut entries = store.query(&query, cancel).await?;
    while let Some(entry) = entries.try_next().await? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

async fn write(
    store: &dyn LogStore,
    args: WriteArgs,
    cancel: &CancellationToken,
) -> Result<(), AnyError> {
    let message = redaction::redact(&args.message);
    let properties = redaction::redact_properties(
        args.properties
            .into_iter()
            .map(|(key, raw)| (key, parse_property_value(&raw))),
    );

    let entry = LogEntry::new(Utc::now(), args.level, args.category, &message, &message)
        .with_properties(properties);
    store.write(&entry, cancel).await?;

    info!(partition = %entry.partition_date(), "Entry written");
    Ok(())
}

async fn maintain(
    store: &dyn LogStore,
    config: &Config,
    args: MaintainArgs,
    cancel: &CancellationToken,
) -> Result<(), AnyError> {
    let maintenance = LogMaintenance::from_config(&config.retention);
    for date in args.delete {
        maintenance.add_explicit_delete_date(date);
    }

    let today = args.today.unwrap_or_else(|| Utc::now().date_naive());
    let report = maintenance.execute(store, today, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Numbers, booleans and null keep their JSON type; anything else is text
fn parse_property_value(raw: &str) -> PropertyValue {
    use serde_json::Value;

    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => PropertyValue::from(value),
        _ => PropertyValue::from(raw),
    }
}

async fn cancel_on_shutdown(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Interrupt received, cancelling");
        cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use futures::StreamExt;
    use logvault::store::{EntryStream, LogSink, StoreError};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose close always fails
    #[derive(Default)]
    struct BrokenCloseStore {
        close_called: AtomicBool,
    }

    #[async_trait]
    impl LogSink for BrokenCloseStore {
        async fn write(
            &self,
            _entry: &LogEntry,
            _cancel: &CancellationToken,
        ) -> logvault::store::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl LogStore for BrokenCloseStore {
        async fn list_partitions(
            &self,
            _cancel: &CancellationToken,
        ) -> logvault::store::Result<BTreeSet<NaiveDate>> {
            Ok(BTreeSet::new())
        }

        async fn query(
            &self,
            _query: &LogQuery,
            _cancel: &CancellationToken,
        ) -> logvault::store::Result<EntryStream> {
            Ok(futures::stream::empty().boxed())
        }

        async fn delete_partition(
            &self,
            _date: NaiveDate,
            _cancel: &CancellationToken,
        ) -> logvault::store::Result<()> {
            Ok(())
        }

        async fn close(&self) -> logvault::store::Result<()> {
            self.close_called.store(true, Ordering::SeqCst);
            Err(StoreError::Io(std::io::Error::other("flush failed")))
        }
    }

    #[tokio::test]
    async fn test_finish_keeps_command_error() {
        let store = BrokenCloseStore::default();

        let result = finish(&store, Err("query failed".into())).await;

        assert_eq!(result.unwrap_err().to_string(), "query failed");
        assert!(store.close_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finish_reports_close_error_after_success() {
        let store = BrokenCloseStore::default();

        let result = finish(&store, Ok(())).await;

        assert!(result.unwrap_err().to_string().contains("flush failed"));
    }

    #[test]
    fn test_parse_property_value() {
        assert_eq!(parse_property_value("42"), PropertyValue::Integer(42));
        assert_eq!(parse_property_value("true"), PropertyValue::Bool(true));
        assert_eq!(parse_property_value("null"), PropertyValue::Null);
        assert_eq!(
            parse_property_value("hello"),
            PropertyValue::String("hello".to_string())
        );
        assert_eq!(
            parse_property_value("[1,2]"),
            PropertyValue::String("[1,2]".to_string())
        );
    }
}
