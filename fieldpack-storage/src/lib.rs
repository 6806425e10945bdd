//! Storage layer for fieldpack.
//!
//! # Architecture
//!
//! - [`Container`]: the embeddable SQLite file a packaged layer lives in.
//!   One table per layer, geometry as GeoJSON text, plus metadata tables
//!   describing each layer's fields and key.
//! - [`Snapshot`]: the immutable base snapshot written at packaging time,
//!   holding per-feature and per-field digests and values.
//! - [`source`]: the connectors that read from and write back to original
//!   data sources, all behind the narrow [`FeatureSource`] contract.
//!
//! Every read is streamed in batches; nothing here loads a whole SQLite
//! layer into memory.

mod atomic;
mod container;
mod error;
mod mutation;
mod snapshot;
mod sql;

pub mod source;

pub use atomic::write_atomic;
pub use container::{Container, ContainerLayer, ContainerRow, unique_column};
pub use error::{StorageError, StorageResult};
pub use mutation::Mutation;
pub use snapshot::{BaseFeature, Snapshot};
pub use source::{
    Connector, ConnectorRegistry, DEFAULT_TIMEOUT, FeatureSource, FieldSpec, SourceBinding, probe_service,
};

/// Default number of features per streamed batch.
pub const DEFAULT_BATCH_SIZE: usize = 500;
