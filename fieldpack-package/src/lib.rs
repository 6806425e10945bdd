//! Fieldpack package format.
//!
//! A package is a self-contained directory:
//! - `manifest.toml` : layer id to container path to offline metadata,
//!   attachment mapping, base snapshot reference
//! - `data/`         : layer containers (SQLite)
//! - `files/`, `DCIM/`, `audio/`, `video/` : attachments
//! - `snapshot.sqlite` : immutable base snapshot used as the sync baseline
//!
//! Every path inside a package is relative to its root. Packages are
//! assembled atomically and may be shipped as a single zip archive.

mod archive;
mod assembler;
mod error;
mod manifest;
mod package;
mod paths;

pub use archive::{content_hash, extract, file_sha256, pack, package_files};
pub use assembler::PackageAssembler;
pub use error::{PackageError, PackageResult};
pub use manifest::{
    AttachmentEntry, AttachmentSettings, DEFAULT_MAX_VISIBLE, FORMAT_VERSION, FieldEntry, LayerEntry,
    MANIFEST_FILE, Manifest, OfflineSettings, PackagedAs, RelationKind, RelationshipEntry,
    SnapshotRef,
};
pub use package::Package;
pub use paths::{PathAllocator, check_relative, join, slugify};

/// Package directory holding layer containers.
pub const DATA_DIR: &str = "data";
/// Package path of the base snapshot.
pub const SNAPSHOT_FILE: &str = "snapshot.sqlite";
