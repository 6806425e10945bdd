//! Core type definitions for fieldpack.
//!
//! This crate defines the source-agnostic types shared by the packaging
//! pipeline and the synchronizer:
//! - Layer, package and feature identifiers
//! - Attribute values, field types and geometries
//! - Content fingerprints used by the base snapshot
//! - Diagnostics and cooperative cancellation
//!
//! Anything that knows about a concrete data source (SQLite, GeoJSON, CSV,
//! remote services) belongs in `fieldpack-storage`, not here.

mod cancel;
mod diagnostics;
mod fingerprint;
mod ids;
mod value;

pub use cancel::CancelToken;
pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use fingerprint::{feature_digest, geometry_digest, value_digest};
pub use ids::{FeatureKey, LayerId, PackageId};
pub use value::{Extent, Feature, FieldType, Geometry, GeometryType, Value};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("cannot convert {value} to {target}")]
    InvalidValue { value: String, target: FieldType },
}
