//! Content fingerprints for the base snapshot.
//!
//! Digests are SHA-256 over a tagged, canonical rendering of each value, so
//! `Text("1")` and `Integer(1)` never collide. Geometry text is hashed with
//! sorted object keys.

use crate::value::{Feature, Geometry, Value};
use sha2::{Digest, Sha256};

fn tag(value: &Value) -> &'static [u8] {
    match value {
        Value::Null => b"null",
        Value::Bool(_) => b"bool",
        Value::Integer(_) => b"integer",
        Value::Real(_) => b"real",
        Value::Text(_) => b"text",
        Value::Date(_) => b"date",
        Value::DateTime(_) => b"date_time",
        Value::Blob(_) => b"blob",
        Value::Json(_) => b"json",
    }
}

/// Hex-encoded SHA-256 digest of a single attribute value.
#[must_use]
pub fn value_digest(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag(value));
    hasher.update([0u8]);
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 digest of a geometry; `None` has a fixed digest.
#[must_use]
pub fn geometry_digest(geometry: Option<&Geometry>) -> String {
    let mut hasher = Sha256::new();
    match geometry {
        Some(g) => {
            hasher.update(b"geometry\0");
            hasher.update(g.to_text().as_bytes());
        }
        None => hasher.update(b"no-geometry"),
    }
    hex::encode(hasher.finalize())
}

/// Digest of a whole feature: geometry plus every attribute in name order.
/// The key is not part of the content.
#[must_use]
pub fn feature_digest(feature: &Feature) -> String {
    let mut hasher = Sha256::new();
    hasher.update(geometry_digest(feature.geometry.as_ref()).as_bytes());
    for (name, value) in &feature.attributes {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(value_digest(value).as_bytes());
    }
    hex::encode(hasher.finalize())
}
