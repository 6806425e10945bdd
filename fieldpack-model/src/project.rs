use crate::error::{ModelError, ModelResult};
use crate::layer::Layer;
use fieldpack_types::LayerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A GIS project: ordered layers, relationships and project metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    /// Directories (relative to the project home) holding attachments,
    /// copied into packages as a whole.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_dirs: Vec<String>,
    #[serde(default, rename = "layer")]
    pub layers: Vec<Layer>,
    #[serde(default, rename = "relationship")]
    pub relationships: Vec<Relationship>,
    /// Directory relative paths resolve against. Set by [`Project::load`].
    #[serde(skip)]
    pub home: PathBuf,
}

/// A foreign-key-like link between two layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub name: String,
    /// Child layer holding the foreign key.
    pub referencing_layer: LayerId,
    /// Parent layer holding the referenced key.
    pub referenced_layer: LayerId,
    #[serde(rename = "field_pair")]
    pub field_pairs: Vec<FieldPair>,
    #[serde(default)]
    pub strength: RelationStrength,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPair {
    pub referencing: String,
    pub referenced: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationStrength {
    #[default]
    Association,
    Composition,
}

impl Project {
    pub fn new(title: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            title: title.into(),
            crs: None,
            variables: BTreeMap::new(),
            attachment_dirs: Vec::new(),
            layers: Vec::new(),
            relationships: Vec::new(),
            home: home.into(),
        }
    }

    /// Loads a project description. Relative paths inside it resolve
    /// against the file's directory.
    pub fn load(path: &Path) -> ModelResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let home = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let project = Self::from_toml_str(&text, home)?;
        info!(
            "Loaded project {:?} with {} layers from {:?}",
            project.title,
            project.layers.len(),
            path
        );
        Ok(project)
    }

    pub fn from_toml_str(text: &str, home: impl Into<PathBuf>) -> ModelResult<Self> {
        let mut project: Self = toml::from_str(text)?;
        project.home = home.into();
        project.validate()?;
        Ok(project)
    }

    pub fn save(&self, path: &Path) -> ModelResult<()> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        debug!("Wrote project description to {:?}", path);
        Ok(())
    }

    /// Checks layer id uniqueness and relationship endpoints.
    pub fn validate(&self) -> ModelResult<()> {
        if self.title.trim().is_empty() {
            return Err(ModelError::Invalid("title must not be empty".into()));
        }
        let mut seen = HashSet::new();
        for layer in &self.layers {
            if !seen.insert(&layer.id) {
                return Err(ModelError::DuplicateLayer(layer.id.clone()));
            }
        }
        for rel in &self.relationships {
            for layer in [&rel.referencing_layer, &rel.referenced_layer] {
                if !seen.contains(layer) {
                    return Err(ModelError::UnknownLayer {
                        relationship: rel.id.clone(),
                        layer: layer.clone(),
                    });
                }
            }
            if rel.field_pairs.is_empty() {
                return Err(ModelError::Invalid(format!(
                    "relationship {} has no field pairs",
                    rel.id
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn layer(&self, id: &LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| &l.id == id)
    }

    /// Resolves a possibly relative path against the project home.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.home.join(p)
        }
    }

    /// Relationships touching the given layer on either side.
    pub fn relationships_of<'a>(&'a self, id: &'a LayerId) -> impl Iterator<Item = &'a Relationship> {
        self.relationships
            .iter()
            .filter(move |r| &r.referencing_layer == id || &r.referenced_layer == id)
    }
}
