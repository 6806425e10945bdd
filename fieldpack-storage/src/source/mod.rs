//! Data source connectors.
//!
//! Every kind of source the pipelines can read (and, for synchronization,
//! write) implements the same narrow contract:
//!
//! - [`Connector::probe`]: bounded reachability check
//! - [`FeatureSource::read_batches`]: stream all features
//! - [`FeatureSource::fetch`]: look features up by key
//! - [`FeatureSource::apply`]: apply a mutation batch atomically
//!
//! Connectors are dispatched through a fixed [`ConnectorRegistry`] keyed on
//! the shape of the [`DataSourceDescriptor`].

mod csv;
mod geojson;
mod remote;
mod sqlite;

pub use self::csv::{CsvConnector, CsvSource};
pub use self::geojson::{GeoJsonConnector, GeoJsonSource};
pub use self::remote::{RemoteGeoJsonConnector, probe_service};
pub use self::sqlite::{SqliteConnector, SqliteSource};

use crate::error::{StorageError, StorageResult};
use crate::mutation::Mutation;
use fieldpack_model::{DataSourceDescriptor, KeyResolution, Layer};
use fieldpack_types::{Feature, FeatureKey, FieldType, LayerId, Value};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default bound on any probe or connection attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A field as the container and the connectors see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Everything a connector needs to open a layer's source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBinding {
    pub layer_id: LayerId,
    pub descriptor: DataSourceDescriptor,
    /// Fields to read and write, with the types values are coerced to.
    pub fields: Vec<FieldSpec>,
    pub key_field: Option<String>,
    pub spatial: bool,
    /// Directory relative paths resolve against.
    pub home: PathBuf,
    pub timeout: Duration,
}

impl SourceBinding {
    pub fn new(layer_id: LayerId, descriptor: DataSourceDescriptor, home: impl Into<PathBuf>) -> Self {
        Self {
            layer_id,
            descriptor,
            fields: Vec::new(),
            key_field: None,
            spatial: false,
            home: home.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Binds a project layer: every stored field with a container type,
    /// its resolved key and its geometry.
    ///
    /// Computed fields and fields of unsupported types are left out; the
    /// converter reports them.
    #[must_use]
    pub fn for_layer(layer: &Layer, home: &Path) -> Self {
        let fields = layer
            .fields
            .iter()
            .filter(|f| !f.computed)
            .filter_map(|f| f.field_type().map(|ty| FieldSpec::new(&f.name, ty)))
            .collect();
        let key = match layer.resolve_key() {
            KeyResolution::Declared(k) | KeyResolution::Fallback(k) => Some(k),
            _ => None,
        };
        Self::new(layer.id.clone(), layer.source.clone(), home)
            .with_fields(fields)
            .with_key(key)
            .with_spatial(layer.is_spatial())
    }

    #[must_use]
    pub fn with_fields(mut self, fields: Vec<FieldSpec>) -> Self {
        self.fields = fields;
        self
    }

    #[must_use]
    pub fn with_key(mut self, key_field: Option<String>) -> Self {
        self.key_field = key_field;
        self
    }

    #[must_use]
    pub fn with_spatial(mut self, spatial: bool) -> Self {
        self.spatial = spatial;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.field_type)
    }

    /// Type of the key field; text when unknown.
    #[must_use]
    pub fn key_type(&self) -> FieldType {
        self.key_field
            .as_deref()
            .and_then(|k| self.field_type(k))
            .unwrap_or(FieldType::Text)
    }

    /// Resolves a descriptor path against the project home.
    #[must_use]
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.home.join(p)
        }
    }

    /// Builds a feature from raw values, coercing each bound field and
    /// filling absent ones with `Null`.
    pub(crate) fn build_feature(
        &self,
        mut raw: impl FnMut(&str) -> Option<Value>,
        geometry: Option<fieldpack_types::Geometry>,
    ) -> StorageResult<Feature> {
        let mut feature = Feature::default();
        for field in &self.fields {
            let value = raw(&field.name).unwrap_or(Value::Null).coerce(field.field_type)?;
            feature.attributes.insert(field.name.clone(), value);
        }
        feature.geometry = if self.spatial { geometry } else { None };
        feature.key = self
            .key_field
            .as_deref()
            .and_then(|k| FeatureKey::from_value(feature.attribute(k)));
        Ok(feature)
    }
}

/// Read/write access to one layer's features in its source.
pub trait FeatureSource {
    fn binding(&self) -> &SourceBinding;

    /// Streams every feature matching the layer's filter, `batch_size` at a
    /// time. Returning an error from `visit` stops the scan.
    fn read_batches(
        &mut self,
        batch_size: usize,
        visit: &mut dyn FnMut(Vec<Feature>) -> StorageResult<()>,
    ) -> StorageResult<()>;

    /// Looks features up by key. Missing keys are simply absent.
    fn fetch(&mut self, keys: &[FeatureKey]) -> StorageResult<Vec<Feature>>;

    /// Applies all mutations or none of them. Returns the keys of inserted
    /// features, in insertion order.
    fn apply(&mut self, mutations: &[Mutation]) -> StorageResult<Vec<FeatureKey>>;

    fn is_writable(&self) -> bool {
        true
    }
}

/// Factory for one kind of source.
pub trait Connector: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, descriptor: &DataSourceDescriptor) -> bool;

    /// Checks the source can be reached, within the binding's timeout.
    fn probe(&self, binding: &SourceBinding) -> StorageResult<()>;

    fn open(&self, binding: SourceBinding) -> StorageResult<Box<dyn FeatureSource>>;
}

/// Fixed dispatch table from descriptors to connectors.
pub struct ConnectorRegistry {
    connectors: Vec<Box<dyn Connector>>,
}

impl ConnectorRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            connectors: Vec::new(),
        }
    }

    /// SQLite databases and containers, GeoJSON and CSV files, remote
    /// GeoJSON endpoints.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(SqliteConnector));
        registry.register(Box::new(GeoJsonConnector));
        registry.register(Box::new(CsvConnector));
        registry.register(Box::new(RemoteGeoJsonConnector));
        registry
    }

    /// Adds a connector. Earlier registrations win on overlap.
    pub fn register(&mut self, connector: Box<dyn Connector>) {
        debug!("Registered connector {}", connector.name());
        self.connectors.push(connector);
    }

    #[must_use]
    pub fn find(&self, descriptor: &DataSourceDescriptor) -> Option<&dyn Connector> {
        self.connectors
            .iter()
            .find(|c| c.supports(descriptor))
            .map(|c| &**c)
    }

    pub fn probe(&self, binding: &SourceBinding) -> StorageResult<()> {
        self.connector_for(&binding.descriptor)?.probe(binding)
    }

    pub fn open(&self, binding: SourceBinding) -> StorageResult<Box<dyn FeatureSource>> {
        self.connector_for(&binding.descriptor)?.open(binding)
    }

    fn connector_for(&self, descriptor: &DataSourceDescriptor) -> StorageResult<&dyn Connector> {
        self.find(descriptor)
            .ok_or_else(|| StorageError::UnsupportedSourceType(descriptor.kind_name()))
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Next key for a source that does not assign keys itself.
pub(crate) fn next_key<'a>(ty: FieldType, existing: impl Iterator<Item = &'a FeatureKey>) -> FeatureKey {
    match ty {
        FieldType::Integer => {
            let max = existing.filter_map(FeatureKey::as_i64).max().unwrap_or(0);
            FeatureKey::from(max + 1)
        }
        _ => FeatureKey::new(uuid::Uuid::new_v4().to_string()),
    }
}
