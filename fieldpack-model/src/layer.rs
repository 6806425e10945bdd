use crate::field::FieldDef;
use crate::source::DataSourceDescriptor;
use fieldpack_types::{GeometryType, LayerId};
use serde::{Deserialize, Serialize};

/// A layer of the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    /// `None` for tabular layers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_type: Option<GeometryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldDef>,
    pub source: DataSourceDescriptor,
    /// Declared primary key columns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
    /// Opaque styling blob, passed through unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub locks: EditLocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// The layer may be edited offline.
    #[serde(default = "default_true")]
    pub offline_editing: bool,
    /// Reference layer that does not need offline edits.
    #[serde(default)]
    pub basemap: bool,
    /// The source refuses all writes.
    #[serde(default)]
    pub read_only: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            offline_editing: true,
            basemap: false,
            read_only: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Per-layer editing locks for the field client. Each lock is either a
/// plain flag or, when an expression is set, evaluated per feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLocks {
    #[serde(default)]
    pub feature_addition: bool,
    #[serde(default)]
    pub attribute_editing: bool,
    #[serde(default)]
    pub geometry_editing: bool,
    #[serde(default)]
    pub feature_deletion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_addition_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_editing_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry_editing_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_deletion_expression: Option<String>,
}

/// Outcome of looking for a layer's feature identity field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    /// Single-column declared primary key.
    Declared(String),
    /// No declared key; a field named `fid` is used instead.
    Fallback(String),
    /// Declared key spans several columns.
    Composite(Vec<String>),
    /// Declared key name cannot be used as a column name.
    Invalid(String),
    Missing,
}

impl KeyResolution {
    /// Key field name, when one is usable.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::Declared(name) | Self::Fallback(name) => Some(name),
            _ => None,
        }
    }
}

impl Layer {
    pub fn new(id: impl Into<LayerId>, name: impl Into<String>, source: DataSourceDescriptor) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            geometry_type: None,
            crs: None,
            fields: Vec::new(),
            source,
            primary_key: Vec::new(),
            style: None,
            capabilities: Capabilities::default(),
            locks: EditLocks::default(),
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub const fn is_spatial(&self) -> bool {
        self.geometry_type.is_some()
    }

    /// Resolves the field that identifies features in the source.
    ///
    /// A single declared primary key wins; composite keys are unsupported.
    /// Without a declaration, a field named `fid` (any case) is used.
    #[must_use]
    pub fn resolve_key(&self) -> KeyResolution {
        match self.primary_key.as_slice() {
            [] => self
                .fields
                .iter()
                .find(|f| f.name.eq_ignore_ascii_case("fid"))
                .map_or(KeyResolution::Missing, |f| KeyResolution::Fallback(f.name.clone())),
            [single] if single.contains(',') || single.trim().is_empty() => {
                KeyResolution::Invalid(single.clone())
            }
            [single] => KeyResolution::Declared(single.clone()),
            many => KeyResolution::Composite(many.to_vec()),
        }
    }

    #[must_use]
    pub fn with_fields(mut self, fields: Vec<FieldDef>) -> Self {
        self.fields = fields;
        self
    }

    #[must_use]
    pub fn with_geometry(mut self, geometry_type: GeometryType) -> Self {
        self.geometry_type = Some(geometry_type);
        self
    }

    #[must_use]
    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = vec![key.into()];
        self
    }
}
