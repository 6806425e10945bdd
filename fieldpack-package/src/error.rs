//! Error types for the package crate.

use fieldpack_storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialize(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("missing required entry: {0}")]
    MissingEntry(String),

    #[error("manifest validation error: {0}")]
    ManifestInvalid(String),

    /// The manifest references files the package does not contain, or a
    /// referenced file does not match its recorded digest.
    #[error("package is corrupt: {0}")]
    PackageCorrupt(String),

    #[error("path escapes the package root: {0}")]
    UnsafePath(String),

    #[error("destination already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
}

pub type PackageResult<T> = Result<T, PackageError>;
