//! Identifier types used throughout fieldpack.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identifier of a layer.
///
/// Assigned by the host project and carried unchanged through packaging,
/// offline editing and synchronization; edits are matched back to their
/// layer by this value alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(String);

impl LayerId {
    /// Creates a layer ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LayerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier for a produced package.
/// Uses UUID v7 so packages sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(Uuid);

impl PackageId {
    /// Creates a new package ID with the current timestamp.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a package ID from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses a package ID from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for PackageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PackageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identity of a feature in its original source.
///
/// The canonical text form of the layer's primary key value. Integer keys
/// render without padding (`42`), text keys verbatim.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureKey(String);

impl FeatureKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives a key from the value of a layer's key field.
    ///
    /// `Null` (a feature not yet written to its source) has no key.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Integer(i) => Some(Self::from(*i)),
            Value::Real(r) if r.fract() == 0.0 && r.is_finite() => Some(Self::from(*r as i64)),
            Value::Text(s) => Some(Self(s.clone())),
            other => Some(Self(other.to_string())),
        }
    }

    /// The key as a value of the given key field type.
    #[must_use]
    pub fn to_value(&self, ty: crate::FieldType) -> Value {
        match (ty, self.as_i64()) {
            (crate::FieldType::Integer, Some(i)) => Value::Integer(i),
            _ => Value::Text(self.0.clone()),
        }
    }

    /// Interprets the key as an integer, for sources keyed by row ids.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for FeatureKey {
    fn from(v: i64) -> Self {
        Self(v.to_string())
    }
}

impl From<&str> for FeatureKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
