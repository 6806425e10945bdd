//! Offline editing metadata.
//!
//! Turns a layer's schema, capabilities and widgets into the manifest's
//! per-layer and per-field editing metadata, rewrites attachment values
//! to package paths, and wires relationships between packaged layers.

use crate::classifier::{PackagePlan, PlanEntry};
use crate::error::ExportResult;
use fieldpack_model::{AttachmentKind, Layer, Project, Widget};
use fieldpack_package::{
    AttachmentSettings, DEFAULT_MAX_VISIBLE, FieldEntry, LayerEntry, OfflineSettings,
    PackageAssembler, RelationKind, RelationshipEntry, slugify,
};
use fieldpack_storage::ContainerLayer;
use fieldpack_types::{Diagnostics, Feature, FieldType, LayerId, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct OfflineConfigurator<'a> {
    project: &'a Project,
    plan: &'a PackagePlan,
}

impl<'a> OfflineConfigurator<'a> {
    #[must_use]
    pub fn new(project: &'a Project, plan: &'a PackagePlan) -> Self {
        Self { project, plan }
    }

    /// Fills the offline metadata of an embedded layer's manifest entry.
    pub fn configure_layer(
        &self,
        layer: &Layer,
        entry: &PlanEntry,
        table: &ContainerLayer,
        manifest_entry: &mut LayerEntry,
        diagnostics: &mut Diagnostics,
    ) {
        let editable = entry.editable && table.key_field.is_some();
        manifest_entry.offline = OfflineSettings {
            editable,
            locks: layer.locks.clone(),
        };

        let mut fid = FieldEntry::new(&table.fid_column, FieldType::Integer);
        fid.hidden = true;
        manifest_entry.fields.push(fid);

        let slug = slugify(&layer.name);
        for spec in &table.fields {
            let mut field = FieldEntry::new(&spec.name, spec.field_type);
            let is_key = table.key_field.as_deref() == Some(spec.name.as_str());
            if let Some(def) = layer.field(&spec.name) {
                field.alias = def.alias.clone();
                field.editable = editable && !def.read_only && !def.computed && !is_key;
                field.constraints = def.constraints.clone();
                field.default_value = def.default_value.clone();
                field.widget = def.widget.clone();
                if let Some(Widget::Attachment { attachment, naming }) = &def.widget {
                    field.attachment = Some(AttachmentSettings {
                        kind: *attachment,
                        naming: naming
                            .clone()
                            .unwrap_or_else(|| attachment.default_naming(&slug)),
                    });
                }
                if let Some(Widget::ValueRelation { layer: target, .. }) = &def.widget {
                    self.check_value_relation(&layer.id, &spec.name, target, diagnostics);
                }
            } else {
                field.editable = editable && !is_key;
            }
            manifest_entry.fields.push(field);
        }
        debug!(
            "Configured layer {} (editable: {}, {} fields)",
            layer.id,
            editable,
            manifest_entry.fields.len()
        );
    }

    fn check_value_relation(
        &self,
        layer: &LayerId,
        field: &str,
        target: &LayerId,
        diagnostics: &mut Diagnostics,
    ) {
        let packaged = self.plan.entry(target).is_some_and(|e| e.action.embeds());
        if !packaged {
            warn!(
                "Value relation {}.{} points at layer {} which is not packaged",
                layer, field, target
            );
            diagnostics.warning(
                layer,
                format!("value relation of field {field} refers to layer {target}, which is not in the package"),
            );
        }
    }

    /// Relationship wiring for the package. `packaged` holds the layers
    /// whose data actually made it in; relationships with a side outside it
    /// are demoted to informational links.
    pub fn relationships(&self, packaged: &HashSet<LayerId>, diagnostics: &mut Diagnostics) -> Vec<RelationshipEntry> {
        let mut entries = Vec::new();
        for rel in &self.project.relationships {
            let child = packaged.contains(&rel.referencing_layer);
            let parent = packaged.contains(&rel.referenced_layer);
            let kind = match (child, parent) {
                (false, false) => continue,
                (true, true) => RelationKind::Embedded,
                (true, false) | (false, true) => {
                    let (owner, missing) = if child {
                        (&rel.referencing_layer, &rel.referenced_layer)
                    } else {
                        (&rel.referenced_layer, &rel.referencing_layer)
                    };
                    warn!("Relationship {} demoted: layer {} not packaged", rel.id, missing);
                    diagnostics.warning(
                        owner,
                        format!(
                            "relationship {} demoted to informational: layer {missing} is not in the package",
                            rel.name
                        ),
                    );
                    RelationKind::Informational
                }
            };
            entries.push(RelationshipEntry {
                id: rel.id.clone(),
                name: rel.name.clone(),
                referencing_layer: rel.referencing_layer.clone(),
                referenced_layer: rel.referenced_layer.clone(),
                field_pairs: rel.field_pairs.clone(),
                strength: rel.strength,
                kind,
                max_visible: DEFAULT_MAX_VISIBLE,
            });
        }
        entries
    }
}

/// Rewrites attachment values of a layer to package paths, copying the
/// referenced files into the package.
#[derive(Debug, Clone)]
pub struct AttachmentRewriter {
    layer_id: LayerId,
    home: PathBuf,
    fields: Vec<(String, AttachmentKind)>,
}

impl AttachmentRewriter {
    #[must_use]
    pub fn for_layer(layer: &Layer, home: &Path) -> Self {
        let fields = layer
            .fields
            .iter()
            .filter(|f| !f.computed)
            .filter_map(|f| f.attachment_kind().map(|kind| (f.name.clone(), kind)))
            .collect();
        Self {
            layer_id: layer.id.clone(),
            home: home.to_path_buf(),
            fields,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Rewrites one feature. Returns the fields whose value changed.
    pub fn rewrite(&self, assembler: &mut PackageAssembler, feature: &mut Feature) -> ExportResult<Vec<String>> {
        let mut changed = Vec::new();
        for (field, kind) in &self.fields {
            let Some(value) = feature.attribute(field).as_text().map(str::to_string) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            let file = {
                let p = Path::new(&value);
                if p.is_absolute() { p.to_path_buf() } else { self.home.join(p) }
            };
            let package_path = assembler.add_attachment(&self.layer_id, &value, &file, kind.directory())?;
            if package_path != value {
                feature.attributes.insert(field.clone(), Value::Text(package_path));
                changed.push(field.clone());
            }
        }
        Ok(changed)
    }
}
