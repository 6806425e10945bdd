use fieldpack_types::{Feature, FeatureKey, Geometry, Value};
use std::collections::BTreeMap;

/// A single change to apply to a source layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Adds a feature. Without a key the source assigns one.
    Insert { feature: Feature },
    /// Changes some attributes and optionally the geometry of a feature.
    /// `geometry: Some(None)` clears the geometry.
    Update {
        key: FeatureKey,
        attributes: BTreeMap<String, Value>,
        geometry: Option<Option<Geometry>>,
    },
    Delete { key: FeatureKey },
}

impl Mutation {
    #[must_use]
    pub fn key(&self) -> Option<&FeatureKey> {
        match self {
            Self::Insert { feature } => feature.key.as_ref(),
            Self::Update { key, .. } | Self::Delete { key } => Some(key),
        }
    }

    /// An update that changes nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Update { attributes, geometry, .. } if attributes.is_empty() && geometry.is_none())
    }

    pub fn update(key: FeatureKey) -> Self {
        Self::Update {
            key,
            attributes: BTreeMap::new(),
            geometry: None,
        }
    }
}
