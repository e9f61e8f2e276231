//! Error types for storage history operations

use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur while persisting or querying storage history
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to storage backend: {0}")]
    ConnectionFailed(String),

    #[error("storage query failed: {0}")]
    QueryFailed(String),

    #[error("database migration failed: {0}")]
    MigrationFailed(String),

    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend is not healthy
    #[error("storage backend unhealthy: {0}")]
    Unhealthy(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io_err) => StorageError::Io(io_err),
            sqlx::Error::RowNotFound => StorageError::QueryFailed("no rows found".to_string()),
            _ => StorageError::QueryFailed(err.to_string()),
        }
    }
}

#[cfg(feature = "storage-sqlite")]
impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::MigrationFailed(err.to_string())
    }
}
