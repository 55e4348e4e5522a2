use thiserror::Error;

use crate::retry::is_retryable_error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected value {value:?} in column {column}")]
    InvalidValue { column: &'static str, value: String },
}

impl CacheError {
    /// SQLite BUSY/LOCKED/IOERR, which usually clear on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            CacheError::Database(e) => is_retryable_error(e),
            _ => false,
        }
    }
}
