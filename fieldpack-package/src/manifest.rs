//! Package manifest (`manifest.toml`).
//!
//! The manifest is the only index into a package: layer id to container
//! path to offline metadata, the attachment mapping and the base snapshot
//! reference. Fields added after format version 1 must carry
//! `#[serde(default)]` so older manifests keep loading.

use crate::error::{PackageError, PackageResult};
use crate::paths::check_relative;
use chrono::{DateTime, Utc};
use fieldpack_model::{
    AttachmentKind, DataSourceDescriptor, EditLocks, FieldConstraints, FieldPair, RelationStrength,
    Widget,
};
use fieldpack_types::{FieldType, GeometryType, LayerId, PackageId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

pub const MANIFEST_FILE: &str = "manifest.toml";
pub const FORMAT_VERSION: u32 = 1;

/// Top-level manifest of a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub package_id: PackageId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
    pub snapshot: SnapshotRef,
    /// Attachment directories copied as a whole, package-relative.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_dirs: Vec<String>,
    /// Project variables, available to expressions in the field app.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    #[serde(default, rename = "layer")]
    pub layers: Vec<LayerEntry>,
    #[serde(default, rename = "relationship")]
    pub relationships: Vec<RelationshipEntry>,
    #[serde(default, rename = "attachment")]
    pub attachments: Vec<AttachmentEntry>,
}

/// Location and digest of the base snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub path: String,
    /// SHA-256 of the snapshot file, hex encoded.
    #[serde(default)]
    pub sha256: String,
}

/// How a layer made it into the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackagedAs {
    /// Materialized from its source into a container.
    Converted,
    /// An existing container copied verbatim.
    Copied,
    /// An auxiliary file (raster) copied verbatim; never editable.
    File,
    /// A live reference to an online basemap; nothing embedded.
    LinkedBasemap,
}

impl PackagedAs {
    /// Whether the layer's features live in a package container.
    #[must_use]
    pub const fn has_container(self) -> bool {
        matches!(self, Self::Converted | Self::Copied)
    }
}

/// One packaged layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub id: LayerId,
    pub name: String,
    pub packaged_as: PackagedAs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_type: Option<GeometryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
    /// Package-relative container or file path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Table inside the container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fid_column: Option<String>,
    #[serde(default)]
    pub offline: OfflineSettings,
    /// Opaque styling blob, passed through unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Online source of a linked basemap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<DataSourceDescriptor>,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldEntry>,
}

impl LayerEntry {
    pub fn new(id: LayerId, name: impl Into<String>, packaged_as: PackagedAs) -> Self {
        Self {
            id,
            name: name.into(),
            packaged_as,
            geometry_type: None,
            crs: None,
            path: None,
            table: None,
            key_field: None,
            fid_column: None,
            offline: OfflineSettings::default(),
            style: None,
            link: None,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldEntry> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldEntry> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    /// Fields holding attachment paths.
    pub fn attachment_fields(&self) -> impl Iterator<Item = &FieldEntry> {
        self.fields.iter().filter(|f| f.attachment.is_some())
    }
}

/// Layer-level offline editing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineSettings {
    pub editable: bool,
    #[serde(default)]
    pub locks: EditLocks,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            editable: false,
            locks: EditLocks::default(),
        }
    }
}

/// One field of a packaged layer with its offline metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub editable: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default, skip_serializing_if = "FieldConstraints::is_empty")]
    pub constraints: FieldConstraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<Widget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentSettings>,
}

impl FieldEntry {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            alias: None,
            editable: false,
            hidden: false,
            constraints: FieldConstraints::default(),
            widget: None,
            default_value: None,
            attachment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentSettings {
    pub kind: AttachmentKind,
    /// Naming expression for files captured in the field.
    pub naming: String,
}

/// Whether a relationship can be navigated inside the package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// Both layers are in the package.
    Embedded,
    /// One side was not packaged; kept for reference only.
    Informational,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEntry {
    pub id: String,
    pub name: String,
    pub referencing_layer: LayerId,
    pub referenced_layer: LayerId,
    #[serde(rename = "field_pair")]
    pub field_pairs: Vec<FieldPair>,
    #[serde(default)]
    pub strength: RelationStrength,
    pub kind: RelationKind,
    /// Related features the field client shows before paging.
    #[serde(default = "default_max_visible")]
    pub max_visible: u32,
}

pub const DEFAULT_MAX_VISIBLE: u32 = 4;

fn default_max_visible() -> u32 {
    DEFAULT_MAX_VISIBLE
}

/// Where an attachment value of the source ended up in the package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentEntry {
    pub layer: LayerId,
    pub package_path: String,
    /// The value the source stored for this attachment.
    pub source_value: String,
    /// False when the referenced file did not exist at packaging time.
    #[serde(default = "default_present")]
    pub present: bool,
}

fn default_present() -> bool {
    true
}

impl Manifest {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            package_id: PackageId::new(),
            title: title.into(),
            created_at: Utc::now(),
            crs: None,
            snapshot: SnapshotRef::default(),
            attachment_dirs: Vec::new(),
            variables: BTreeMap::new(),
            layers: Vec::new(),
            relationships: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn from_toml_str(text: &str) -> PackageResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> PackageResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    #[must_use]
    pub fn layer(&self, id: &LayerId) -> Option<&LayerEntry> {
        self.layers.iter().find(|l| &l.id == id)
    }

    pub fn layer_mut(&mut self, id: &LayerId) -> Option<&mut LayerEntry> {
        self.layers.iter_mut().find(|l| &l.id == id)
    }

    /// Attachment mapping for a package path stored in a layer.
    #[must_use]
    pub fn attachment(&self, layer: &LayerId, package_path: &str) -> Option<&AttachmentEntry> {
        self.attachments
            .iter()
            .find(|a| &a.layer == layer && a.package_path == package_path)
    }

    /// Every package-relative path the manifest points at.
    pub fn referenced_paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.snapshot.path.as_str())
            .chain(self.layers.iter().filter_map(|l| l.path.as_deref()))
            .chain(self.attachment_dirs.iter().map(String::as_str))
            .chain(self.attachments.iter().map(|a| a.package_path.as_str()))
    }

    /// Validates the manifest for required fields and constraints.
    pub fn validate(&self) -> PackageResult<()> {
        let invalid = |msg: String| Err(PackageError::ManifestInvalid(msg));
        if self.format_version == 0 || self.format_version > FORMAT_VERSION {
            return invalid(format!(
                "unsupported format version {} (this build reads up to {FORMAT_VERSION})",
                self.format_version
            ));
        }
        if self.snapshot.path.is_empty() {
            return invalid("snapshot path is required".into());
        }
        for path in self.referenced_paths() {
            check_relative(path)?;
        }

        let mut ids = HashSet::new();
        for layer in &self.layers {
            if !ids.insert(&layer.id) {
                return invalid(format!("duplicate layer id {}", layer.id));
            }
            if layer.packaged_as.has_container() && (layer.path.is_none() || layer.table.is_none()) {
                return invalid(format!("layer {} has no container", layer.id));
            }
            if layer.packaged_as == PackagedAs::File && layer.path.is_none() {
                return invalid(format!("layer {} has no file", layer.id));
            }
        }
        for rel in &self.relationships {
            let both_present = ids.contains(&rel.referencing_layer) && ids.contains(&rel.referenced_layer);
            if rel.kind == RelationKind::Embedded && !both_present {
                return invalid(format!(
                    "relationship {} is embedded but a layer is missing",
                    rel.id
                ));
            }
        }
        for attachment in &self.attachments {
            if !ids.contains(&attachment.layer) {
                return invalid(format!(
                    "attachment {} belongs to unknown layer {}",
                    attachment.package_path, attachment.layer
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manifest() -> Manifest {
        let mut m = Manifest::new("Survey");
        m.snapshot.path = "snapshot.sqlite".into();
        let mut layer = LayerEntry::new(LayerId::new("trees"), "Trees", PackagedAs::Converted);
        layer.path = Some("data/trees.sqlite".into());
        layer.table = Some("trees".into());
        m.layers.push(layer);
        m
    }

    #[test]
    fn validate_valid_manifest() {
        assert!(test_manifest().validate().is_ok());
    }

    #[test]
    fn validate_rejects_escaping_path() {
        let mut m = test_manifest();
        m.layers[0].path = Some("../outside.sqlite".into());
        assert!(matches!(m.validate(), Err(PackageError::UnsafePath(_))));
    }

    #[test]
    fn validate_rejects_newer_format() {
        let mut m = test_manifest();
        m.format_version = FORMAT_VERSION + 1;
        assert!(m.validate().is_err());
    }

    #[test]
    fn validate_requires_container_for_converted_layers() {
        let mut m = test_manifest();
        m.layers[0].table = None;
        assert!(m.validate().is_err());
    }

    #[test]
    fn variables_survive_toml_and_default_to_empty() {
        let mut m = test_manifest();
        m.variables.insert("survey_year".into(), "2026".into());
        let back = Manifest::from_toml_str(&m.to_toml_string().unwrap()).unwrap();
        assert_eq!(back.variables.get("survey_year").map(String::as_str), Some("2026"));

        m.variables.clear();
        let text = m.to_toml_string().unwrap();
        assert!(!text.contains("variables"));
        assert!(Manifest::from_toml_str(&text).unwrap().variables.is_empty());
    }
}
