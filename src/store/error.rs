use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store is closed")]
    Closed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid storage target: {0}")]
    InvalidTarget(String),
}

impl StoreError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
