//! Data source conversion.
//!
//! Materializes an embedded layer into a package container and records
//! its source-side state in the base snapshot. Features are streamed
//! batch by batch from the source into both, so memory use does not grow
//! with layer size.

use crate::classifier::PlanEntry;
use crate::config::ExportConfig;
use crate::error::{ExportError, ExportResult};
use crate::offline::AttachmentRewriter;
use fieldpack_model::{DataSourceDescriptor, Layer};
use fieldpack_package::{DATA_DIR, PackageAssembler};
use fieldpack_storage::{
    Container, ContainerLayer, ConnectorRegistry, SourceBinding, Snapshot, StorageError,
};
use fieldpack_types::{CancelToken, Diagnostics, Extent, Feature, Geometry, Value};
use std::path::Path;
use tracing::{debug, info, warn};

/// A layer that now lives in a package container.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedLayer {
    /// Package-relative container path.
    pub path: String,
    pub table: ContainerLayer,
    pub features: u64,
}

/// Where a layer's data goes: the staged package and its base snapshot.
pub struct Staging<'a> {
    pub assembler: &'a mut PackageAssembler,
    pub snapshot: &'a mut Snapshot,
    pub cancel: &'a CancelToken,
}

pub struct Converter<'a> {
    registry: &'a ConnectorRegistry,
    config: &'a ExportConfig,
}

/// Why a streamed scan stopped early.
enum Stop {
    Cancelled,
    Failed(ExportError),
}

impl Stop {
    fn into_error(self) -> ExportError {
        match self {
            Self::Cancelled => ExportError::Cancelled,
            Self::Failed(e) => e,
        }
    }
}

impl<'a> Converter<'a> {
    #[must_use]
    pub fn new(registry: &'a ConnectorRegistry, config: &'a ExportConfig) -> Self {
        Self { registry, config }
    }

    /// Binds a layer for conversion, reporting every field that cannot be
    /// carried into the container.
    pub fn binding(&self, layer: &Layer, home: &Path, diagnostics: &mut Diagnostics) -> SourceBinding {
        for field in &layer.fields {
            if field.computed {
                debug!("Stripping computed field {}.{}", layer.id, field.name);
                diagnostics.info(&layer.id, format!("computed field {} is not packaged", field.name));
            } else if field.field_type().is_none() {
                let error = StorageError::UnsupportedFieldType {
                    field: field.name.clone(),
                    native_type: field.native_type.clone(),
                };
                warn!("Dropping field of layer {}: {}", layer.id, error);
                diagnostics.warning(&layer.id, format!("{error}; field dropped"));
            }
        }
        let mut binding = SourceBinding::for_layer(layer, home).with_timeout(self.config.probe_timeout());
        let dropped_key = binding
            .key_field
            .clone()
            .filter(|key| binding.field_type(key).is_none());
        if let Some(key) = dropped_key {
            diagnostics.warning(&layer.id, format!("key field {key} was not packaged"));
            binding.key_field = None;
        }
        binding
    }

    /// The area a layer's features are restricted to, if any.
    fn area_filter(&self, table: &ContainerLayer, diagnostics: &mut Diagnostics) -> Option<Extent> {
        let aoi = self.config.area_of_interest.as_ref()?;
        table.geometry_type?;
        let extent = aoi.extent();
        if !extent.is_valid() {
            diagnostics.warning(
                &table.layer_id,
                "area of interest is not a valid rectangle; layer packaged whole".to_string(),
            );
            return None;
        }
        if let (Some(area_crs), Some(layer_crs)) = (&aoi.crs, &table.crs) {
            if !area_crs.eq_ignore_ascii_case(layer_crs) {
                warn!(
                    "Area of interest is in {}, layer {} in {}; not filtering",
                    area_crs, table.layer_id, layer_crs
                );
                diagnostics.warning(
                    &table.layer_id,
                    format!("area of interest is in {area_crs} but the layer is in {layer_crs}; layer packaged whole"),
                );
                return None;
            }
        }
        Some(extent)
    }

    /// Converts a layer's features into a fresh container.
    pub fn convert(
        &self,
        layer: &Layer,
        entry: &PlanEntry,
        home: &Path,
        staging: &mut Staging<'_>,
        diagnostics: &mut Diagnostics,
    ) -> ExportResult<EmbeddedLayer> {
        let binding = self.binding(layer, home, diagnostics);
        let rewriter = AttachmentRewriter::for_layer(layer, home);
        let path = staging.assembler.allocate(DATA_DIR, &entry.target, "sqlite");
        let staged = staging.assembler.staged_path(&path)?;
        let table = ContainerLayer::new(entry.target.clone(), layer.id.clone(), binding.fields.clone(), layer.geometry_type)
            .with_key(binding.key_field.clone())
            .with_crs(layer.crs.clone());

        let result = self.fill(binding, &table, &staged, staging, &rewriter, diagnostics);
        match result {
            Ok(features) => {
                info!(
                    "Converted layer {} ({} features) into {}",
                    layer.id, features, path
                );
                Ok(EmbeddedLayer { path, table, features })
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&staged) {
                    debug!("No partial container to remove at {:?}: {}", staged, cleanup);
                }
                Err(e)
            }
        }
    }

    fn fill(
        &self,
        binding: SourceBinding,
        table: &ContainerLayer,
        staged: &Path,
        staging: &mut Staging<'_>,
        rewriter: &AttachmentRewriter,
        diagnostics: &mut Diagnostics,
    ) -> ExportResult<u64> {
        let Staging {
            assembler,
            snapshot,
            cancel,
        } = staging;
        let layer_id = binding.layer_id.clone();
        let keyed = binding.key_field.is_some();
        let area = self.area_filter(table, diagnostics);
        let mut container = Container::create(staged)?;
        container.create_layer(table)?;
        let mut source = self.registry.open(binding)?;

        let mut written = 0u64;
        let mut unkeyed = 0u64;
        let mut outside = 0u64;
        let mut stop = None;
        let scan = source.read_batches(self.config.batch_size(), &mut |batch| {
            if cancel.is_cancelled() {
                stop = Some(Stop::Cancelled);
                return Err(StorageError::InvalidData("scan stopped".into()));
            }
            let mut batch: Vec<Feature> = batch;
            if let Some(area) = &area {
                let before = batch.len();
                batch.retain(|f| {
                    f.geometry
                        .as_ref()
                        .and_then(Geometry::extent)
                        .is_some_and(|e| e.intersects(area))
                });
                outside += (before - batch.len()) as u64;
            }
            if keyed {
                let before = batch.len();
                batch.retain(|f| f.key.is_some());
                unkeyed += (before - batch.len()) as u64;
                snapshot.record(&layer_id, &batch)?;
            }
            for feature in &mut batch {
                if let Err(e) = rewriter.rewrite(assembler, feature) {
                    stop = Some(Stop::Failed(e));
                    return Err(StorageError::InvalidData("scan stopped".into()));
                }
            }
            container.insert_features(table, &batch)?;
            written += batch.len() as u64;
            Ok(())
        });
        if let Some(stop) = stop {
            return Err(stop.into_error());
        }
        scan?;

        if outside > 0 {
            info!("Layer {}: {} features outside the area of interest left out", layer_id, outside);
            diagnostics.info(
                &layer_id,
                format!("{outside} features outside the area of interest were not packaged"),
            );
        }
        if unkeyed > 0 {
            warn!("Layer {}: {} features without key left out", layer_id, unkeyed);
            diagnostics.warning(
                &layer_id,
                format!("{unkeyed} features have no key value and were not packaged"),
            );
        }
        Ok(written)
    }

    /// Copies an existing container verbatim and records its features in
    /// the snapshot. Attachment values in the copy are rewritten in place.
    pub fn copy(&self, layer: &Layer, home: &Path, staging: &mut Staging<'_>) -> ExportResult<EmbeddedLayer> {
        let rewriter = AttachmentRewriter::for_layer(layer, home);
        let Staging {
            assembler,
            snapshot,
            cancel,
        } = staging;
        let DataSourceDescriptor::LocalFile { path, layer_name, .. } = &layer.source else {
            return Err(StorageError::UnsupportedSourceType(layer.source.kind_name()).into());
        };
        let source = {
            let p = Path::new(path);
            if p.is_absolute() { p.to_path_buf() } else { home.join(p) }
        };
        let package_path = assembler.copy_container(&source, DATA_DIR)?;
        let staged = assembler.staged_path(&package_path)?;
        let mut container = Container::open(&staged)?;
        let table = match layer_name {
            Some(name) => container.layer(name)?,
            None => container.layer_for(&layer.id)?,
        };

        let keyed = table.key_field.is_some();
        let mut features = 0u64;
        let mut rewrites: Vec<(i64, String, Value)> = Vec::new();
        let mut stop = None;
        let scan = container.read_batches(&table, self.config.batch_size(), &mut |rows| {
            if cancel.is_cancelled() {
                stop = Some(Stop::Cancelled);
                return Err(StorageError::InvalidData("scan stopped".into()));
            }
            let mut base = Vec::with_capacity(rows.len());
            for row in rows {
                features += 1;
                let mut feature = row.feature;
                if keyed && feature.key.is_some() {
                    base.push(feature.clone());
                }
                if rewriter.is_empty() {
                    continue;
                }
                match rewriter.rewrite(assembler, &mut feature) {
                    Ok(changed) => {
                        for field in changed {
                            let value = feature.attribute(&field).clone();
                            rewrites.push((row.fid, field, value));
                        }
                    }
                    Err(e) => {
                        stop = Some(Stop::Failed(e));
                        return Err(StorageError::InvalidData("scan stopped".into()));
                    }
                }
            }
            if !base.is_empty() {
                snapshot.record(&layer.id, &base)?;
            }
            Ok(())
        });
        if let Some(stop) = stop {
            return Err(stop.into_error());
        }
        scan?;

        for (fid, field, value) in &rewrites {
            container.set_value(&table, *fid, field, value)?;
        }
        info!(
            "Copied container layer {} ({} features) as {}",
            layer.id, features, package_path
        );
        Ok(EmbeddedLayer {
            path: package_path,
            table,
            features,
        })
    }
}
