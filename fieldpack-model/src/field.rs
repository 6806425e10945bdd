use fieldpack_types::{FieldType, LayerId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One attribute field of a layer, as declared by its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    /// Type name in the source's own type system (`int4`, `varchar(20)`, ...).
    #[serde(rename = "type")]
    pub native_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// The source refuses writes to this field.
    #[serde(default)]
    pub read_only: bool,
    /// Virtual field evaluated from an expression; has no stored value.
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub constraints: FieldConstraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub widget: Option<Widget>,
    /// Default value expression, passed through to the field client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, native_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            native_type: native_type.into(),
            alias: None,
            read_only: false,
            computed: false,
            constraints: FieldConstraints::default(),
            widget: None,
            default_value: None,
        }
    }

    /// Container type for this field, or `None` if it has no equivalent.
    #[must_use]
    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_native(&self.native_type)
    }

    #[must_use]
    pub fn attachment_kind(&self) -> Option<AttachmentKind> {
        match &self.widget {
            Some(Widget::Attachment { attachment, .. }) => Some(*attachment),
            _ => None,
        }
    }

    #[must_use]
    pub fn with_widget(mut self, widget: Widget) -> Self {
        self.widget = Some(widget);
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }
}

/// Value constraints enforced by the field client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraints {
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Domain list; empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_values: Vec<String>,
    /// Constraint expression, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

impl FieldConstraints {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Editor widget configured for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Widget {
    /// Values are file paths to attachments.
    Attachment {
        #[serde(default)]
        attachment: AttachmentKind,
        /// Naming expression for files captured in the field.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        naming: Option<String>,
    },
    /// Values are keys into another layer.
    ValueRelation {
        layer: LayerId,
        key_field: String,
        value_field: String,
        #[serde(default)]
        allow_multi: bool,
    },
    ValueMap {
        entries: BTreeMap<String, String>,
    },
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<f64>,
    },
    Hidden,
}

/// Kind of document an attachment field stores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    #[default]
    File,
    Image,
    Web,
    Audio,
    Video,
}

impl AttachmentKind {
    /// Package directory that files of this kind are collected into.
    #[must_use]
    pub const fn directory(self) -> &'static str {
        match self {
            Self::File | Self::Web => "files",
            Self::Image => "DCIM",
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// Default naming expression for files captured in the field, rooted in
    /// this kind's directory and prefixed with the layer slug.
    #[must_use]
    pub fn default_naming(self, layer_slug: &str) -> String {
        format!(
            "'{}/{}_' || format_date(now(),'yyyyMMddhhmmsszzz') || '.{{extension}}'",
            self.directory(),
            layer_slug
        )
    }
}
