use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use logvault::entry::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "logvault")]
#[command(about = "Day-partitioned log store", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List every stored partition date
    Partitions,
    /// Print the entries of one day as JSON lines
    Query(QueryArgs),
    /// Redact and append one entry stamped now
    Write(WriteArgs),
    /// Run one retention and explicit-deletion pass
    Maintain(MaintainArgs),
}

#[derive(clap::Args, Debug)]
pub struct QueryArgs {
    /// Partition date (YYYY-MM-DD)
    #[arg(long)]
    pub date: NaiveDate,
    #[arg(long)]
    pub min_level: Option<LogLevel>,
    /// Case-insensitive substring of the category
    #[arg(long)]
    pub category: Option<String>,
    /// Case-insensitive substring of the rendered message
    #[arg(long)]
    pub keyword: Option<String>,
    /// Newest first
    #[arg(long)]
    pub desc: bool,
}

#[derive(clap::Args, Debug)]
pub struct WriteArgs {
    #[arg(long, default_value = "Information")]
    pub level: LogLevel,
    #[arg(long)]
    pub category: String,
    #[arg(long)]
    pub message: String,
    /// Structured property as key=value; repeatable
    #[arg(long = "property", value_parser = parse_property)]
    pub properties: Vec<(String, String)>,
}

#[derive(clap::Args, Debug)]
pub struct MaintainArgs {
    /// Reference date for retention (defaults to the current UTC date)
    #[arg(long)]
    pub today: Option<NaiveDate>,
    /// Partition to delete regardless of age; repeatable
    #[arg(long = "delete")]
    pub delete: Vec<NaiveDate>,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}
