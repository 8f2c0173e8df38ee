pub mod config;
pub mod entry;
pub mod maintenance;
pub mod observability;
pub mod redaction;
pub mod store;
