//! Fieldpack packaging pipeline.
//!
//! Turns a [`Project`](fieldpack_model::Project) into a self-contained
//! offline package:
//!
//! 1. [`check_project`]: portability warnings before anything is written
//! 2. [`Classifier`]: one [`PlanEntry`] per layer (copy, convert, skip, link)
//! 3. [`Converter`]: stream each embedded layer into a container and the
//!    base snapshot
//! 4. [`OfflineConfigurator`]: editing metadata, attachments, relationships
//! 5. [`PackageAssembler`](fieldpack_package::PackageAssembler): atomic
//!    layout and manifest
//!
//! [`Packager`] runs all of it and returns an [`ExportSummary`] with the
//! outcome of every layer.

mod checker;
mod classifier;
mod config;
mod converter;
mod error;
mod offline;
mod packager;

pub use checker::check_project;
pub use classifier::{Classifier, PackagePlan, PlanAction, PlanEntry};
pub use config::{AreaOfInterest, ExportConfig};
pub use converter::{Converter, EmbeddedLayer, Staging};
pub use error::{ExportError, ExportResult};
pub use offline::{AttachmentRewriter, OfflineConfigurator};
pub use packager::{ArchiveInfo, ExportSummary, LayerOutcome, LayerReport, Packager};
