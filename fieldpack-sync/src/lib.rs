//! Synchronization of returned packages.
//!
//! A package comes back from the field with its containers edited. The
//! [`Synchronizer`] compares every editable layer three ways: the base
//! snapshot taken at packaging time, the edited container, and the source
//! as it is now. Fields changed on one side only merge automatically;
//! fields changed on both sides become [`ConflictRecord`]s in a
//! [`ConflictReport`]. Decisions on those records go back through
//! [`Synchronizer::apply_resolutions`], or are taken on the spot by a
//! [`ConflictPolicy`].
//!
//! Each layer's changes reach its source as one atomic batch.

mod attachments;
mod config;
mod conflict;
mod diff;
mod engine;
mod error;
mod report;

pub use attachments::AttachmentMapper;
pub use config::SyncConfig;
pub use conflict::{
    ConflictPolicy, ConflictRecord, ConflictTarget, Decision, ResolutionState, Resolved,
    feature_value, geometry_value, resolve,
};
pub use diff::{FieldState, classify};
pub use engine::Synchronizer;
pub use error::{SyncError, SyncResult};
pub use report::{
    Applied, CONFLICTS_FILE, ConflictReport, LayerSyncOutcome, LayerSyncReport, SyncSummary,
};
