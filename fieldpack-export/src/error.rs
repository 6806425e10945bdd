//! Error types for the packaging pipeline.

use fieldpack_model::ModelError;
use fieldpack_package::PackageError;
use fieldpack_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("project error: {0}")]
    Model(#[from] ModelError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("package error: {0}")]
    Package(#[from] PackageError),

    #[error("packaging cancelled")]
    Cancelled,
}

pub type ExportResult<T> = Result<T, ExportError>;
