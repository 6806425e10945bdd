//! Attachment paths between package and project.
//!
//! Packaged attachment values are package-relative paths. Before features
//! are compared with the base snapshot they are mapped back to what the
//! source stored. Files captured offline have no mapping: they are noted
//! while features are compared and copied into the project home, at the
//! same relative path, once the layer's changes are committed.

use fieldpack_package::{LayerEntry, Manifest, check_relative};
use fieldpack_types::{Feature, LayerId, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct AttachmentMapper<'a> {
    layer_id: LayerId,
    manifest: &'a Manifest,
    package_root: PathBuf,
    home: PathBuf,
    fields: Vec<String>,
    captures: BTreeSet<String>,
}

impl<'a> AttachmentMapper<'a> {
    pub fn new(manifest: &'a Manifest, entry: &LayerEntry, package_root: &Path, home: &Path) -> Self {
        Self {
            layer_id: entry.id.clone(),
            manifest,
            package_root: package_root.to_path_buf(),
            home: home.to_path_buf(),
            fields: entry.attachment_fields().map(|f| f.name.clone()).collect(),
            captures: BTreeSet::new(),
        }
    }

    /// Maps a packaged feature's attachment values back to source values.
    /// Values with no mapping are noted for [`AttachmentMapper::import_captures`].
    pub fn to_source(&mut self, feature: &mut Feature) {
        for field in &self.fields {
            let Some(value) = feature.attribute(field).as_text().map(str::to_string) else {
                continue;
            };
            if let Some(entry) = self.manifest.attachment(&self.layer_id, &value) {
                feature
                    .attributes
                    .insert(field.clone(), Value::Text(entry.source_value.clone()));
                continue;
            }
            if check_relative(&value).is_ok() && self.package_root.join(&value).is_file() {
                self.captures.insert(value);
            }
        }
    }

    /// Maps source values in a set of attributes to their package paths,
    /// where the package holds the file.
    pub fn to_package(&self, attributes: &mut BTreeMap<String, Value>) {
        for field in &self.fields {
            let Some(Value::Text(value)) = attributes.get(field) else {
                continue;
            };
            let packaged = self
                .manifest
                .attachments
                .iter()
                .find(|a| a.layer == self.layer_id && &a.source_value == value);
            if let Some(entry) = packaged {
                attributes.insert(field.clone(), Value::Text(entry.package_path.clone()));
            }
        }
    }

    /// Copies the files captured offline into the project home. Returns
    /// how many were copied; files already in the project are left alone.
    pub fn import_captures(&mut self) -> std::io::Result<usize> {
        let mut imported = 0;
        for value in std::mem::take(&mut self.captures) {
            let target = self.home.join(&value);
            if target.exists() {
                debug!("Attachment {} already present in project", value);
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(self.package_root.join(&value), &target)?;
            info!("Imported attachment {} captured offline for layer {}", value, self.layer_id);
            imported += 1;
        }
        Ok(imported)
    }
}
