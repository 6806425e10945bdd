//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file system).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Delimited text could not be read or written.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Remote service request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A value does not fit its declared field type.
    #[error("value error: {0}")]
    Value(#[from] fieldpack_types::Error),

    /// The source cannot be reached right now. Transient.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// No connector handles this kind of source.
    #[error("unsupported source type: {0}")]
    UnsupportedSourceType(String),

    /// The source field type has no container equivalent.
    #[error("unsupported type {native_type} for field {field}")]
    UnsupportedFieldType { field: String, native_type: String },

    /// A write batch against a source failed and was rolled back.
    #[error("source write failed: {0}")]
    SourceWriteFailed(String),

    /// The source or store does not accept writes.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// Feature or table not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid data.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl StorageError {
    /// Whether the failure means "try again later" rather than "never".
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SourceUnavailable(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
