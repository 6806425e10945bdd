//! Layer classification.
//!
//! Decides, for every project layer, how it gets into the package. The
//! classifier only reads the project and probes sources; it never changes
//! anything. Every layer yields exactly one plan entry, and every layer
//! that is not embedded yields a diagnostic saying why.

use crate::config::ExportConfig;
use fieldpack_model::{DataSourceDescriptor, FileFormat, KeyResolution, Layer, Project};
use fieldpack_package::slugify;
use fieldpack_storage::{ConnectorRegistry, SourceBinding, StorageError, probe_service};
use fieldpack_types::{Diagnostics, LayerId};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Raster formats that cannot be embedded.
const UNSUPPORTED_RASTER_EXTENSIONS: [&str; 1] = ["ecw"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// Already embeddable; copied verbatim.
    Copy,
    /// Materialized from its source into a new container.
    Convert,
    SkipUnavailable,
    SkipUnsupported,
    /// Kept as a live online reference.
    LinkBasemap,
    /// Left out by the caller's layer selection.
    Excluded,
}

impl PlanAction {
    /// Whether the layer's data ends up inside the package.
    #[must_use]
    pub const fn embeds(self) -> bool {
        matches!(self, Self::Copy | Self::Convert)
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Copy => "copy",
            Self::Convert => "convert",
            Self::SkipUnavailable => "skip-unavailable",
            Self::SkipUnsupported => "skip-unsupported",
            Self::LinkBasemap => "link-basemap",
            Self::Excluded => "excluded",
        })
    }
}

/// The decision for one layer.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub layer_id: LayerId,
    pub action: PlanAction,
    /// Suggested package name; the assembler makes it unique.
    pub target: String,
    /// Feature identity field, when the layer has a usable one.
    pub key_field: Option<String>,
    /// Offline editing is enabled for the packaged layer.
    pub editable: bool,
    /// Why the layer is not embedded, or why it is read-only.
    pub reason: Option<String>,
}

/// Per-layer decisions in project layer order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PackagePlan {
    entries: Vec<PlanEntry>,
}

impl PackagePlan {
    pub fn iter(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn entry(&self, layer_id: &LayerId) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| &e.layer_id == layer_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layers whose data is embedded in the package.
    pub fn embedded(&self) -> impl Iterator<Item = &LayerId> {
        self.entries
            .iter()
            .filter(|e| e.action.embeds())
            .map(|e| &e.layer_id)
    }
}

pub struct Classifier<'a> {
    registry: &'a ConnectorRegistry,
    config: &'a ExportConfig,
}

impl<'a> Classifier<'a> {
    #[must_use]
    pub fn new(registry: &'a ConnectorRegistry, config: &'a ExportConfig) -> Self {
        Self { registry, config }
    }

    /// Classifies every layer of the project.
    pub fn classify(&self, project: &Project, diagnostics: &mut Diagnostics) -> PackagePlan {
        let entries = project
            .layers
            .iter()
            .map(|layer| self.classify_layer(layer, &project.home, diagnostics))
            .collect();
        PackagePlan { entries }
    }

    fn classify_layer(&self, layer: &Layer, home: &Path, diagnostics: &mut Diagnostics) -> PlanEntry {
        let (action, reason) = self.decide(layer, home);
        let mut entry = PlanEntry {
            layer_id: layer.id.clone(),
            action,
            target: slugify(&layer.name),
            key_field: None,
            editable: false,
            reason,
        };

        match action {
            PlanAction::Copy | PlanAction::Convert => self.editing(layer, &mut entry, diagnostics),
            PlanAction::LinkBasemap => {
                diagnostics.info(&layer.id, "linked as online basemap");
            }
            PlanAction::Excluded => {
                diagnostics.info(&layer.id, "excluded by layer selection");
            }
            PlanAction::SkipUnavailable | PlanAction::SkipUnsupported => {
                let reason = entry.reason.clone().unwrap_or_default();
                warn!("Skipping layer {} ({}): {}", layer.id, action, reason);
                diagnostics.warning(&layer.id, format!("{action}: {reason}"));
            }
        }
        debug!("Layer {} classified as {}", layer.id, action);
        entry
    }

    fn decide(&self, layer: &Layer, home: &Path) -> (PlanAction, Option<String>) {
        if !self.config.is_selected(&layer.id) {
            return (PlanAction::Excluded, None);
        }
        match &layer.source {
            DataSourceDescriptor::RemoteService { url, protocol, .. } if protocol.is_tiled() => {
                if !layer.capabilities.basemap {
                    return (
                        PlanAction::SkipUnsupported,
                        Some(format!("{protocol} services can only be linked as basemaps")),
                    );
                }
                match probe_service(url, self.config.probe_timeout()) {
                    Ok(()) => (PlanAction::LinkBasemap, None),
                    Err(e) => (PlanAction::SkipUnavailable, Some(e.to_string())),
                }
            }
            DataSourceDescriptor::LocalFile {
                path,
                format: FileFormat::Raster,
                ..
            } => {
                let file = resolve(home, path);
                let extension = file
                    .extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase())
                    .unwrap_or_default();
                if UNSUPPORTED_RASTER_EXTENSIONS.contains(&extension.as_str()) {
                    (
                        PlanAction::SkipUnsupported,
                        Some(format!("{extension} rasters cannot be packaged")),
                    )
                } else if file.is_file() {
                    (PlanAction::Copy, None)
                } else {
                    (
                        PlanAction::SkipUnavailable,
                        Some(format!("{} does not exist", file.display())),
                    )
                }
            }
            descriptor => self.decide_feature_source(layer, descriptor, home),
        }
    }

    fn decide_feature_source(
        &self,
        layer: &Layer,
        descriptor: &DataSourceDescriptor,
        home: &Path,
    ) -> (PlanAction, Option<String>) {
        if self.registry.find(descriptor).is_none() {
            return (
                PlanAction::SkipUnsupported,
                Some(format!("no connector for {}", descriptor.kind_name())),
            );
        }
        let binding = SourceBinding::for_layer(layer, home).with_timeout(self.config.probe_timeout());
        match self.registry.probe(&binding) {
            Ok(()) => {}
            Err(StorageError::UnsupportedSourceType(kind)) => {
                return (PlanAction::SkipUnsupported, Some(format!("no connector for {kind}")));
            }
            Err(e) => return (PlanAction::SkipUnavailable, Some(e.to_string())),
        }
        if layer.capabilities.basemap && descriptor.is_remote() {
            return (PlanAction::LinkBasemap, None);
        }
        match descriptor {
            DataSourceDescriptor::LocalFile {
                format: FileFormat::Container,
                ..
            } => (PlanAction::Copy, None),
            _ => (PlanAction::Convert, None),
        }
    }

    /// Decides whether an embedded layer can be edited offline.
    fn editing(&self, layer: &Layer, entry: &mut PlanEntry, diagnostics: &mut Diagnostics) {
        let wanted = self
            .config
            .offline_override(&layer.id)
            .unwrap_or(layer.capabilities.offline_editing);
        if matches!(layer.source, DataSourceDescriptor::LocalFile { format: FileFormat::Raster, .. }) {
            return;
        }

        let key = layer.resolve_key();
        entry.key_field = key.field().map(str::to_string);
        let blocker = match &key {
            KeyResolution::Declared(_) | KeyResolution::Fallback(_) => None,
            KeyResolution::Composite(cols) => Some(format!("composite primary key ({}) is unsupported", cols.join(", "))),
            KeyResolution::Invalid(name) => Some(format!("primary key name {name:?} is invalid")),
            KeyResolution::Missing => Some("no primary key and no fid field".to_string()),
        };
        let blocker = blocker.or_else(|| {
            if layer.capabilities.read_only {
                Some("source is read-only".to_string())
            } else if layer.source.is_remote() {
                Some("remote sources are read-only".to_string())
            } else {
                None
            }
        });

        match (wanted, blocker) {
            (false, _) => {}
            (true, None) => entry.editable = true,
            (true, Some(reason)) => {
                info!("Layer {} packaged read-only: {}", layer.id, reason);
                diagnostics.warning(&layer.id, format!("packaged read-only: {reason}"));
                entry.reason = Some(reason);
            }
        }
    }
}

fn resolve(home: &Path, path: &str) -> std::path::PathBuf {
    let p = Path::new(path);
    if p.is_absolute() { p.to_path_buf() } else { home.join(p) }
}
