//! Project model for fieldpack.
//!
//! Plain data types describing a GIS project as the host application sees
//! it: ordered layers, their field schemas and data source descriptors,
//! inter-layer relationships and project metadata. The host populates these
//! (the CLI reads them from a TOML project description); the packaging and
//! synchronization pipelines only ever read them.

mod error;
mod field;
mod layer;
mod project;
mod source;

pub use error::{ModelError, ModelResult};
pub use field::{AttachmentKind, FieldConstraints, FieldDef, Widget};
pub use layer::{Capabilities, EditLocks, KeyResolution, Layer};
pub use project::{FieldPair, Project, RelationStrength, Relationship};
pub use source::{CsvOptions, DataSourceDescriptor, FileFormat, ServiceProtocol};
