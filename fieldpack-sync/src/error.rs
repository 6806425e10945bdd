//! Error types for synchronization.

use fieldpack_model::ModelError;
use fieldpack_package::PackageError;
use fieldpack_storage::StorageError;
use fieldpack_types::LayerId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value: {0}")]
    Value(#[from] fieldpack_types::Error),

    #[error("project error: {0}")]
    Model(#[from] ModelError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("package error: {0}")]
    Package(#[from] PackageError),

    /// A decision that cannot be applied to its conflict record.
    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("conflict report does not belong to package {0}")]
    ForeignReport(String),

    /// The package holds a layer the project no longer has.
    #[error("layer {0} is not part of the project")]
    UnknownLayer(LayerId),

    #[error("synchronization cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether the run as a whole has to stop rather than the one layer.
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Package(PackageError::PackageCorrupt(_))
        )
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
