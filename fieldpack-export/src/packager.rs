//! The packaging pipeline.
//!
//! Classify, then embed every layer the plan keeps, then wire relationships
//! and finish the package atomically. A layer that cannot be packaged never
//! aborts the run: its outcome says why, and the diagnostics stream carries
//! the details. Only a failure of the package itself is an error.

use crate::checker::check_project;
use crate::classifier::{Classifier, PackagePlan, PlanAction, PlanEntry};
use crate::config::ExportConfig;
use crate::converter::{Converter, EmbeddedLayer, Staging};
use crate::error::{ExportError, ExportResult};
use crate::offline::OfflineConfigurator;
use fieldpack_model::{DataSourceDescriptor, FileFormat, Layer, Project};
use fieldpack_package::{
    LayerEntry, Manifest, PackageAssembler, PackagedAs, SNAPSHOT_FILE, check_relative, pack,
};
use fieldpack_storage::{ConnectorRegistry, Snapshot};
use fieldpack_types::{CancelToken, Diagnostics, LayerId, PackageId, Severity};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Package directory for auxiliary rasters.
const RASTER_DIR: &str = "rasters";

/// What happened to one layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerOutcome {
    Copied { features: u64 },
    Converted { features: u64 },
    /// Copied as a plain file.
    File,
    LinkedBasemap,
    SkippedUnavailable(String),
    SkippedUnsupported(String),
    Excluded,
    Failed(String),
}

impl LayerOutcome {
    /// Whether the layer's data is in the package.
    #[must_use]
    pub const fn is_packaged(&self) -> bool {
        matches!(self, Self::Copied { .. } | Self::Converted { .. } | Self::File)
    }
}

impl fmt::Display for LayerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copied { features } => write!(f, "copied ({features} features)"),
            Self::Converted { features } => write!(f, "converted ({features} features)"),
            Self::File => f.write_str("copied file"),
            Self::LinkedBasemap => f.write_str("linked basemap"),
            Self::SkippedUnavailable(reason) => write!(f, "skipped, unavailable: {reason}"),
            Self::SkippedUnsupported(reason) => write!(f, "skipped, unsupported: {reason}"),
            Self::Excluded => f.write_str("excluded"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerReport {
    pub layer_id: LayerId,
    pub name: String,
    pub outcome: LayerOutcome,
}

/// A zip archive written next to the package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    /// Content hash of the packaged files.
    pub sha256: String,
}

/// Result of a packaging run.
#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub package: PathBuf,
    pub package_id: PackageId,
    pub archive: Option<ArchiveInfo>,
    /// One report per project layer, in project order.
    pub layers: Vec<LayerReport>,
    pub diagnostics: Diagnostics,
}

impl ExportSummary {
    #[must_use]
    pub fn layer(&self, id: &LayerId) -> Option<&LayerReport> {
        self.layers.iter().find(|r| &r.layer_id == id)
    }
}

/// Runs packaging for one project.
pub struct Packager {
    config: ExportConfig,
    registry: ConnectorRegistry,
}

impl Packager {
    #[must_use]
    pub fn new(config: ExportConfig) -> Self {
        Self {
            config,
            registry: ConnectorRegistry::with_defaults(),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Classifies the project without writing anything.
    pub fn plan(&self, project: &Project) -> (PackagePlan, Diagnostics) {
        let mut diagnostics = check_project(project);
        let plan = Classifier::new(&self.registry, &self.config).classify(project, &mut diagnostics);
        (plan, diagnostics)
    }

    /// Packages `project` into the directory `out`.
    ///
    /// `out` must not exist or be empty. On error or cancellation nothing
    /// is left at `out`.
    pub fn package(&self, project: &Project, out: &Path, cancel: &CancelToken) -> ExportResult<ExportSummary> {
        project.validate()?;
        info!("Packaging project {:?} into {:?}", project.title, out);
        let (plan, mut diagnostics) = self.plan(project);

        let title = self.config.title.clone().unwrap_or_else(|| project.title.clone());
        let mut manifest = Manifest::new(title);
        manifest.crs = project.crs.clone();
        manifest.variables = project.variables.clone();
        let package_id = manifest.package_id;
        let mut assembler = PackageAssembler::begin(out, manifest)?;
        let mut snapshot = Snapshot::create(&assembler.staged_path(SNAPSHOT_FILE)?)?;

        if self.config.copy_attachment_dirs {
            copy_attachment_dirs(project, &mut assembler, &mut diagnostics)?;
        }

        let configurator = OfflineConfigurator::new(project, &plan);
        let mut reports = Vec::with_capacity(plan.len());
        let mut packaged = HashSet::new();

        for entry in plan.iter() {
            if cancel.is_cancelled() {
                warn!("Packaging cancelled before layer {}", entry.layer_id);
                return Err(ExportError::Cancelled);
            }
            let Some(layer) = project.layer(&entry.layer_id) else {
                continue;
            };
            let reason = || entry.reason.clone().unwrap_or_default();
            let outcome = match entry.action {
                PlanAction::Excluded => LayerOutcome::Excluded,
                PlanAction::SkipUnavailable => LayerOutcome::SkippedUnavailable(reason()),
                PlanAction::SkipUnsupported => LayerOutcome::SkippedUnsupported(reason()),
                PlanAction::LinkBasemap => {
                    let mut link = LayerEntry::new(layer.id.clone(), &layer.name, PackagedAs::LinkedBasemap);
                    link.geometry_type = layer.geometry_type;
                    link.crs = layer.crs.clone();
                    link.style = layer.style.clone();
                    link.link = Some(layer.source.clone());
                    assembler.manifest_mut().layers.push(link);
                    LayerOutcome::LinkedBasemap
                }
                PlanAction::Copy | PlanAction::Convert => {
                    let mut staging = Staging {
                        assembler: &mut assembler,
                        snapshot: &mut snapshot,
                        cancel,
                    };
                    let embedded = self.embed(
                        layer,
                        entry,
                        &project.home,
                        &configurator,
                        &mut staging,
                        &mut diagnostics,
                    );
                    match embedded {
                        Ok(outcome) => {
                            packaged.insert(layer.id.clone());
                            outcome
                        }
                        Err(ExportError::Cancelled) => {
                            warn!("Packaging cancelled during layer {}", layer.id);
                            return Err(ExportError::Cancelled);
                        }
                        Err(e) => {
                            error!("Layer {} could not be packaged: {}", layer.id, e);
                            diagnostics.error(&layer.id, e.to_string());
                            assembler.manifest_mut().attachments.retain(|a| a.layer != layer.id);
                            LayerOutcome::Failed(e.to_string())
                        }
                    }
                }
            };
            reports.push(LayerReport {
                layer_id: layer.id.clone(),
                name: layer.name.clone(),
                outcome,
            });
        }

        let relationships = configurator.relationships(&packaged, &mut diagnostics);
        assembler.manifest_mut().relationships = relationships;
        snapshot.seal()?;
        drop(snapshot);
        assembler.manifest_mut().snapshot.path = SNAPSHOT_FILE.to_string();
        let root = assembler.finish()?;

        let archive = if self.config.archive {
            let path = root.with_extension("zip");
            let sha256 = pack(&root, &path)?;
            Some(ArchiveInfo { path, sha256 })
        } else {
            None
        };

        info!(
            "Packaged {} of {} layers into {:?}",
            reports.iter().filter(|r| r.outcome.is_packaged()).count(),
            reports.len(),
            root
        );
        Ok(ExportSummary {
            package: root,
            package_id,
            archive,
            layers: reports,
            diagnostics,
        })
    }

    fn embed(
        &self,
        layer: &Layer,
        entry: &PlanEntry,
        home: &Path,
        configurator: &OfflineConfigurator<'_>,
        staging: &mut Staging<'_>,
        diagnostics: &mut Diagnostics,
    ) -> ExportResult<LayerOutcome> {
        if let DataSourceDescriptor::LocalFile {
            path,
            format: FileFormat::Raster,
            ..
        } = &layer.source
        {
            let package_path = staging.assembler.copy_file(&project_path(home, path), RASTER_DIR)?;
            let mut file = LayerEntry::new(layer.id.clone(), &layer.name, PackagedAs::File);
            file.crs = layer.crs.clone();
            file.style = layer.style.clone();
            file.path = Some(package_path);
            staging.assembler.manifest_mut().layers.push(file);
            return Ok(LayerOutcome::File);
        }

        let converter = Converter::new(&self.registry, &self.config);
        let (embedded, packaged_as) = match entry.action {
            PlanAction::Copy => (converter.copy(layer, home, staging)?, PackagedAs::Copied),
            _ => (
                converter.convert(layer, entry, home, staging, diagnostics)?,
                PackagedAs::Converted,
            ),
        };
        let EmbeddedLayer { path, table, features } = embedded;
        let mut manifest_entry = LayerEntry::new(layer.id.clone(), &layer.name, packaged_as);
        manifest_entry.geometry_type = table.geometry_type.or(layer.geometry_type);
        manifest_entry.crs = table.crs.clone().or_else(|| layer.crs.clone());
        manifest_entry.style = layer.style.clone();
        manifest_entry.path = Some(path);
        manifest_entry.table = Some(table.table.clone());
        manifest_entry.key_field = table.key_field.clone();
        manifest_entry.fid_column = Some(table.fid_column.clone());
        configurator.configure_layer(layer, entry, &table, &mut manifest_entry, diagnostics);
        staging.assembler.manifest_mut().layers.push(manifest_entry);

        Ok(match packaged_as {
            PackagedAs::Copied => LayerOutcome::Copied { features },
            _ => LayerOutcome::Converted { features },
        })
    }
}

fn project_path(home: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() { p.to_path_buf() } else { home.join(p) }
}

/// Copies the project's attachment directories. Relative directories keep
/// their path inside the package; absolute ones keep their last component.
fn copy_attachment_dirs(
    project: &Project,
    assembler: &mut PackageAssembler,
    diagnostics: &mut Diagnostics,
) -> ExportResult<()> {
    for dir in &project.attachment_dirs {
        let source = project_path(&project.home, dir);
        let package_dir = if Path::new(dir).is_absolute() {
            source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            dir.trim_end_matches('/').to_string()
        };
        if check_relative(&package_dir).is_err() {
            warn!("Attachment directory {} cannot be placed in the package", dir);
            diagnostics.push(
                None,
                Severity::Warning,
                format!("attachment directory {dir} cannot be placed in the package"),
            );
            continue;
        }
        if !source.is_dir() {
            warn!("Attachment directory {:?} does not exist", source);
            diagnostics.push(
                None,
                Severity::Warning,
                format!("attachment directory {dir} does not exist"),
            );
            continue;
        }
        assembler.copy_dir(&source, &package_dir)?;
    }
    Ok(())
}
