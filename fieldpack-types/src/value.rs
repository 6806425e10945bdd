//! Attribute values, field types and geometries.
//!
//! Every connector and every container read funnels its raw values through
//! [`Value::coerce`] with the layer's declared [`FieldType`], so the same
//! logical value always has the same representation (and the same digest)
//! regardless of which source produced it.

use crate::ids::FeatureKey;
use crate::{Error, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"];

/// Container-level type of an attribute field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Boolean,
    Date,
    DateTime,
    Binary,
    /// Lists, maps and other structured values, stored as JSON text.
    Json,
}

impl FieldType {
    /// Maps a source's native type name onto the container type system.
    ///
    /// Length and precision modifiers (`varchar(20)`, `numeric(10,2)`) are
    /// ignored. Returns `None` for types with no container equivalent.
    #[must_use]
    pub fn from_native(native: &str) -> Option<Self> {
        let lowered = native.trim().to_ascii_lowercase();
        let base = lowered.split('(').next().unwrap_or_default().trim();
        let ty = match base {
            "text" | "string" | "varchar" | "char" | "character" | "character varying" | "nvarchar"
            | "nchar" | "clob" | "uuid" | "citext" => Self::Text,
            "integer" | "int" | "int2" | "int4" | "int8" | "smallint" | "bigint" | "tinyint"
            | "mediumint" | "serial" | "bigserial" | "integer64" => Self::Integer,
            "real" | "double" | "double precision" | "float" | "float4" | "float8" | "numeric"
            | "decimal" => Self::Real,
            "bool" | "boolean" => Self::Boolean,
            "date" => Self::Date,
            "datetime" | "timestamp" | "timestamptz" | "timestamp with time zone"
            | "timestamp without time zone" => Self::DateTime,
            "blob" | "binary" | "bytea" | "varbinary" => Self::Binary,
            "json" | "jsonb" | "list" | "stringlist" | "integerlist" | "array" => Self::Json,
            _ => return None,
        };
        Some(ty)
    }

    /// Column type used when declaring the field in a SQLite container.
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::Json => "TEXT",
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Real => "REAL",
            Self::Date => "DATE",
            Self::DateTime => "DATETIME",
            Self::Binary => "BLOB",
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::DateTime => "date_time",
            Self::Binary => "binary",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Blob(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Converts the value into the canonical representation for `ty`.
    ///
    /// Empty strings become `Null` for every non-text type, which is how
    /// delimited-text and JSON sources encode missing values.
    pub fn coerce(self, ty: FieldType) -> Result<Self> {
        if let Self::Text(s) = &self {
            if s.trim().is_empty() && ty != FieldType::Text {
                return Ok(Self::Null);
            }
        }
        let invalid = |v: &Value| Error::InvalidValue {
            value: v.to_string(),
            target: ty,
        };
        let coerced = match (ty, self) {
            (_, Self::Null) => Self::Null,
            (FieldType::Text, Self::Text(s)) => Self::Text(s),
            (FieldType::Text, Self::Blob(b)) => Self::Text(hex::encode(b)),
            (FieldType::Text, Self::Json(j)) => Self::Text(j.to_string()),
            (FieldType::Text, other) => Self::Text(other.to_string()),

            (FieldType::Integer, Self::Integer(i)) => Self::Integer(i),
            (FieldType::Integer, Self::Bool(b)) => Self::Integer(i64::from(b)),
            (FieldType::Integer, Self::Real(r)) if r.fract() == 0.0 && r.is_finite() => {
                Self::Integer(r as i64)
            }
            (FieldType::Integer, v @ Self::Text(_)) => match v.as_text().map(|s| s.trim().parse::<i64>()) {
                Some(Ok(i)) => Self::Integer(i),
                _ => return Err(invalid(&v)),
            },

            (FieldType::Real, Self::Real(r)) => Self::Real(r),
            (FieldType::Real, Self::Integer(i)) => Self::Real(i as f64),
            (FieldType::Real, v @ Self::Text(_)) => match v.as_text().map(|s| s.trim().parse::<f64>()) {
                Some(Ok(r)) => Self::Real(r),
                _ => return Err(invalid(&v)),
            },

            (FieldType::Boolean, Self::Bool(b)) => Self::Bool(b),
            (FieldType::Boolean, Self::Integer(i)) => Self::Bool(i != 0),
            (FieldType::Boolean, v @ Self::Text(_)) => {
                let parsed = v.as_text().map(|s| s.trim().to_ascii_lowercase());
                match parsed.as_deref() {
                    Some("true" | "t" | "1" | "yes" | "y") => Self::Bool(true),
                    Some("false" | "f" | "0" | "no" | "n") => Self::Bool(false),
                    _ => return Err(invalid(&v)),
                }
            }

            (FieldType::Date, Self::Date(d)) => Self::Date(d),
            (FieldType::Date, Self::DateTime(dt)) => Self::Date(dt.date()),
            (FieldType::Date, v @ Self::Text(_)) => {
                let s = v.as_text().map(str::trim).unwrap_or_default();
                if let Ok(d) = NaiveDate::parse_from_str(s, DATE_FORMAT) {
                    Self::Date(d)
                } else if let Some(dt) = parse_datetime(s) {
                    Self::Date(dt.date())
                } else {
                    return Err(invalid(&v));
                }
            }

            (FieldType::DateTime, Self::DateTime(dt)) => Self::DateTime(dt),
            (FieldType::DateTime, Self::Date(d)) => match d.and_hms_opt(0, 0, 0) {
                Some(dt) => Self::DateTime(dt),
                None => return Err(invalid(&Self::Date(d))),
            },
            (FieldType::DateTime, v @ Self::Text(_)) => {
                let s = v.as_text().map(str::trim).unwrap_or_default();
                match parse_datetime(s) {
                    Some(dt) => Self::DateTime(dt),
                    None => return Err(invalid(&v)),
                }
            }

            (FieldType::Binary, Self::Blob(b)) => Self::Blob(b),
            (FieldType::Binary, v @ Self::Text(_)) => {
                match v.as_text().map(|s| hex::decode(s.trim())) {
                    Some(Ok(b)) => Self::Blob(b),
                    _ => return Err(invalid(&v)),
                }
            }

            (FieldType::Json, Self::Json(j)) => Self::Json(j),
            (FieldType::Json, Self::Text(s)) => match serde_json::from_str(&s) {
                Ok(j) => Self::Json(j),
                Err(_) => Self::Json(serde_json::Value::String(s)),
            },
            (FieldType::Json, other) => Self::Json(other.to_json()),

            (_, other) => return Err(invalid(&other)),
        };
        Ok(coerced)
    }

    /// Renders the value as plain JSON, the way GeoJSON properties carry it.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null => J::Null,
            Self::Bool(b) => J::Bool(*b),
            Self::Integer(i) => J::from(*i),
            Self::Real(r) => serde_json::Number::from_f64(*r).map_or(J::Null, J::Number),
            Self::Text(s) => J::String(s.clone()),
            Self::Date(_) | Self::DateTime(_) => J::String(self.to_string()),
            Self::Blob(b) => J::String(hex::encode(b)),
            Self::Json(j) => j.clone(),
        }
    }

    /// Reads a plain JSON value. Pair with [`Value::coerce`] to apply a
    /// field type.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as J;
        match json {
            J::Null => Self::Null,
            J::Bool(b) => Self::Bool(*b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map_or(Self::Null, Self::Real),
            },
            J::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => f.write_str(s),
            Self::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
            Self::Blob(b) => f.write_str(&hex::encode(b)),
            Self::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Self::Real(r)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Geometry type of a layer, using GeoJSON names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
}

impl GeometryType {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let ty = match name {
            "Point" => Self::Point,
            "LineString" => Self::LineString,
            "Polygon" => Self::Polygon,
            "MultiPoint" => Self::MultiPoint,
            "MultiLineString" => Self::MultiLineString,
            "MultiPolygon" => Self::MultiPolygon,
            "GeometryCollection" => Self::GeometryCollection,
            _ => return None,
        };
        Some(ty)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Point => "Point",
            Self::LineString => "LineString",
            Self::Polygon => "Polygon",
            Self::MultiPoint => "MultiPoint",
            Self::MultiLineString => "MultiLineString",
            Self::MultiPolygon => "MultiPolygon",
            Self::GeometryCollection => "GeometryCollection",
        }
    }
}

/// A feature geometry, held as a GeoJSON geometry object.
///
/// Geometries are compared as a whole; there is no partial merge of
/// coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Geometry(serde_json::Value);

impl Geometry {
    /// Wraps a GeoJSON geometry object after checking its shape.
    pub fn from_geojson(json: serde_json::Value) -> Result<Self> {
        let ty = json
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::InvalidGeometry("missing \"type\" member".into()))?;
        let kind = GeometryType::parse(ty)
            .ok_or_else(|| Error::InvalidGeometry(format!("unknown geometry type {ty}")))?;
        let member = if kind == GeometryType::GeometryCollection {
            "geometries"
        } else {
            "coordinates"
        };
        if !json.get(member).is_some_and(serde_json::Value::is_array) {
            return Err(Error::InvalidGeometry(format!("{ty} without \"{member}\" array")));
        }
        Ok(Self(json))
    }

    /// Parses GeoJSON geometry text, as stored in containers.
    pub fn parse(text: &str) -> Result<Self> {
        Self::from_geojson(serde_json::from_str(text)?)
    }

    #[must_use]
    pub fn point(x: f64, y: f64) -> Self {
        Self(serde_json::json!({ "type": "Point", "coordinates": [x, y] }))
    }

    #[must_use]
    pub fn geometry_type(&self) -> Option<GeometryType> {
        self.0
            .get("type")
            .and_then(serde_json::Value::as_str)
            .and_then(GeometryType::parse)
    }

    #[must_use]
    pub fn as_geojson(&self) -> &serde_json::Value {
        &self.0
    }

    #[must_use]
    pub fn into_geojson(self) -> serde_json::Value {
        self.0
    }

    /// Compact GeoJSON text with object keys in sorted order.
    #[must_use]
    pub fn to_text(&self) -> String {
        self.0.to_string()
    }

    /// Bounding box over every coordinate. `None` for empty geometries.
    #[must_use]
    pub fn extent(&self) -> Option<Extent> {
        let mut extent: Option<Extent> = None;
        let mut grow = |x: f64, y: f64| {
            extent = Some(match extent {
                Some(e) => Extent::new(e.min_x.min(x), e.min_y.min(y), e.max_x.max(x), e.max_y.max(y)),
                None => Extent::new(x, y, x, y),
            });
        };
        visit_positions(&self.0, &mut grow);
        extent
    }
}

/// Calls `visit` for every position of a GeoJSON geometry object.
fn visit_positions(json: &serde_json::Value, visit: &mut dyn FnMut(f64, f64)) {
    if let Some(members) = json.get("geometries").and_then(serde_json::Value::as_array) {
        for member in members {
            visit_positions(member, visit);
        }
        return;
    }
    if let Some(coordinates) = json.get("coordinates") {
        visit_coordinates(coordinates, visit);
    }
}

fn visit_coordinates(value: &serde_json::Value, visit: &mut dyn FnMut(f64, f64)) {
    let Some(items) = value.as_array() else {
        return;
    };
    let x = items.first().and_then(serde_json::Value::as_f64);
    let y = items.get(1).and_then(serde_json::Value::as_f64);
    if let (Some(x), Some(y)) = (x, y) {
        visit(x, y);
        return;
    }
    for item in items {
        visit_coordinates(item, visit);
    }
}

/// An axis-aligned rectangle in layer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Extent {
    #[must_use]
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Whether the two rectangles share at least one point.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Min and max ordered on both axes, and every bound finite.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        [self.min_x, self.min_y, self.max_x, self.max_y]
            .iter()
            .all(|v| v.is_finite())
            && self.min_x <= self.max_x
            && self.min_y <= self.max_y
    }
}

/// A feature read from a source or a container.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Feature {
    /// Source identity. `None` for features created offline that have not
    /// been written to their source yet.
    pub key: Option<FeatureKey>,
    pub geometry: Option<Geometry>,
    pub attributes: BTreeMap<String, Value>,
}

impl Feature {
    #[must_use]
    pub fn new(key: Option<FeatureKey>) -> Self {
        Self {
            key,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Returns the attribute, treating a missing field as `Null`.
    #[must_use]
    pub fn attribute(&self, name: &str) -> &Value {
        self.attributes.get(name).unwrap_or(&Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_modifiers_are_ignored() {
        assert_eq!(FieldType::from_native("VARCHAR(20)"), Some(FieldType::Text));
        assert_eq!(FieldType::from_native("numeric(10,2)"), Some(FieldType::Real));
        assert_eq!(FieldType::from_native("interval"), None);
    }

    #[test]
    fn parse_datetime_accepts_space_separator() {
        assert!(parse_datetime("2024-05-01 10:11:12").is_some());
        assert!(parse_datetime("2024-05-01T10:11:12Z").is_some());
        assert!(parse_datetime("yesterday").is_none());
    }
}
