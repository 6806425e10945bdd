//! GeoJSON FeatureCollection files.
//!
//! Reads parse the file and hand features out in batches. A write batch is
//! applied to the parsed document in memory and the file is then replaced
//! atomically, so a failed batch never reaches the disk. Members the layer
//! does not bind (foreign properties, `bbox`, `crs`) are preserved.

use super::{Connector, FeatureSource, SourceBinding, next_key};
use crate::atomic::write_atomic;
use crate::error::{StorageError, StorageResult};
use crate::mutation::Mutation;
use fieldpack_model::{DataSourceDescriptor, FileFormat};
use fieldpack_types::{Feature, FeatureKey, Geometry, Value};
use serde_json::{Map, Value as Json, json};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info};

pub struct GeoJsonConnector;

impl Connector for GeoJsonConnector {
    fn name(&self) -> &'static str {
        "geojson"
    }

    fn supports(&self, descriptor: &DataSourceDescriptor) -> bool {
        matches!(
            descriptor,
            DataSourceDescriptor::LocalFile {
                format: FileFormat::GeoJson,
                ..
            }
        )
    }

    fn probe(&self, binding: &SourceBinding) -> StorageResult<()> {
        let path = source_path(binding)?;
        if !path.is_file() {
            return Err(StorageError::SourceUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Ok(())
    }

    fn open(&self, binding: SourceBinding) -> StorageResult<Box<dyn FeatureSource>> {
        Ok(Box::new(GeoJsonSource::open(binding)?))
    }
}

fn source_path(binding: &SourceBinding) -> StorageResult<PathBuf> {
    binding
        .descriptor
        .local_path()
        .map(|p| binding.resolve(p))
        .ok_or_else(|| StorageError::UnsupportedSourceType(binding.descriptor.kind_name()))
}

/// Extracts the features array of a FeatureCollection.
fn features_of(doc: &Json) -> StorageResult<&Vec<Json>> {
    if doc.get("type").and_then(Json::as_str) != Some("FeatureCollection") {
        return Err(StorageError::InvalidData("not a GeoJSON FeatureCollection".into()));
    }
    doc.get("features")
        .and_then(Json::as_array)
        .ok_or_else(|| StorageError::InvalidData("FeatureCollection without features".into()))
}

/// Key of a raw GeoJSON feature: the key property, else the `id` member.
fn raw_key(binding: &SourceBinding, raw: &Json) -> Option<FeatureKey> {
    let key_field = binding.key_field.as_deref()?;
    let from_props = raw
        .get("properties")
        .and_then(|p| p.get(key_field))
        .filter(|v| !v.is_null());
    let value = from_props.or_else(|| raw.get("id"))?;
    let coerced = Value::from_json(value).coerce(binding.key_type()).ok()?;
    FeatureKey::from_value(&coerced)
}

pub(crate) fn parse_feature(binding: &SourceBinding, raw: &Json) -> StorageResult<Feature> {
    let props = raw.get("properties").and_then(Json::as_object);
    let geometry = match raw.get("geometry") {
        None | Some(Json::Null) => None,
        Some(g) => Some(Geometry::from_geojson(g.clone())?),
    };
    let key_field = binding.key_field.as_deref();
    let id_member = raw.get("id");
    binding.build_feature(
        |name| {
            let value = props.and_then(|p| p.get(name)).filter(|v| !v.is_null());
            match value {
                Some(v) => Some(Value::from_json(v)),
                None if Some(name) == key_field => id_member.map(Value::from_json),
                None => None,
            }
        },
        geometry,
    )
}

pub(crate) fn parse_collection(binding: &SourceBinding, doc: &Json) -> StorageResult<Vec<Feature>> {
    features_of(doc)?
        .iter()
        .map(|raw| parse_feature(binding, raw))
        .collect()
}

/// A GeoJSON file exposed as a feature source.
pub struct GeoJsonSource {
    binding: SourceBinding,
    path: PathBuf,
}

impl GeoJsonSource {
    pub fn open(binding: SourceBinding) -> StorageResult<Self> {
        let path = source_path(&binding)?;
        if !path.is_file() {
            return Err(StorageError::SourceUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        Ok(Self { binding, path })
    }

    fn load(&self) -> StorageResult<Json> {
        let bytes = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn properties_for(&self, feature: &Feature) -> Map<String, Json> {
        self.binding
            .fields
            .iter()
            .map(|f| (f.name.clone(), feature.attribute(&f.name).to_json()))
            .collect()
    }

    fn apply_to_doc(&self, doc: &mut Json, mutations: &[Mutation]) -> StorageResult<Vec<FeatureKey>> {
        let key_type = self.binding.key_type();
        let key_field = self.binding.key_field.clone();
        let existing: Vec<FeatureKey> = features_of(doc)?
            .iter()
            .filter_map(|raw| raw_key(&self.binding, raw))
            .collect();
        let mut known: HashSet<FeatureKey> = existing.into_iter().collect();
        let mut inserted = Vec::new();
        let mut new_features = Vec::new();
        let mut deleted = HashSet::new();

        let features = doc
            .get_mut("features")
            .and_then(Json::as_array_mut)
            .ok_or_else(|| StorageError::InvalidData("FeatureCollection without features".into()))?;

        for mutation in mutations {
            match mutation {
                Mutation::Insert { feature } => {
                    let mut props = self.properties_for(feature);
                    let key = match (&feature.key, &key_field) {
                        (Some(k), _) => Some(k.clone()),
                        (None, Some(_)) => Some(next_key(key_type, known.iter())),
                        (None, None) => None,
                    };
                    if let (Some(k), Some(field)) = (&key, &key_field) {
                        props.insert(field.clone(), k.to_value(key_type).to_json());
                        known.insert(k.clone());
                    }
                    let geometry = feature
                        .geometry
                        .as_ref()
                        .map_or(Json::Null, |g| g.as_geojson().clone());
                    new_features.push(json!({
                        "type": "Feature",
                        "properties": props,
                        "geometry": geometry,
                    }));
                    inserted.push(key.unwrap_or_else(|| FeatureKey::from(known.len() as i64)));
                }
                Mutation::Update {
                    key,
                    attributes,
                    geometry,
                } => {
                    let raw = features
                        .iter_mut()
                        .find(|raw| raw_key(&self.binding, raw).as_ref() == Some(key))
                        .ok_or_else(|| StorageError::NotFound(format!("feature {key}")))?;
                    if let Some(obj) = raw.as_object_mut() {
                        let props = obj
                            .entry("properties")
                            .or_insert_with(|| Json::Object(Map::new()));
                        if !props.is_object() {
                            *props = Json::Object(Map::new());
                        }
                        if let Some(props) = props.as_object_mut() {
                            for (name, value) in attributes {
                                if Some(name) == key_field.as_ref() || self.binding.field_type(name).is_none() {
                                    continue;
                                }
                                props.insert(name.clone(), value.to_json());
                            }
                        }
                        if let Some(g) = geometry {
                            obj.insert(
                                "geometry".into(),
                                g.as_ref().map_or(Json::Null, |g| g.as_geojson().clone()),
                            );
                        }
                    }
                }
                Mutation::Delete { key } => {
                    deleted.insert(key.clone());
                }
            }
        }

        if !deleted.is_empty() {
            features.retain(|raw| {
                raw_key(&self.binding, raw).is_none_or(|k| !deleted.contains(&k))
            });
        }
        features.extend(new_features);
        Ok(inserted)
    }
}

impl FeatureSource for GeoJsonSource {
    fn binding(&self) -> &SourceBinding {
        &self.binding
    }

    fn read_batches(
        &mut self,
        batch_size: usize,
        visit: &mut dyn FnMut(Vec<Feature>) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let doc = self.load()?;
        let raw = features_of(&doc)?;
        debug!("Reading {} GeoJSON features from {:?}", raw.len(), self.path);
        for chunk in raw.chunks(batch_size.max(1)) {
            let batch = chunk
                .iter()
                .map(|r| parse_feature(&self.binding, r))
                .collect::<StorageResult<Vec<_>>>()?;
            visit(batch)?;
        }
        Ok(())
    }

    fn fetch(&mut self, keys: &[FeatureKey]) -> StorageResult<Vec<Feature>> {
        let wanted: HashSet<&FeatureKey> = keys.iter().collect();
        let doc = self.load()?;
        features_of(&doc)?
            .iter()
            .filter(|raw| raw_key(&self.binding, raw).is_some_and(|k| wanted.contains(&k)))
            .map(|raw| parse_feature(&self.binding, raw))
            .collect()
    }

    fn apply(&mut self, mutations: &[Mutation]) -> StorageResult<Vec<FeatureKey>> {
        let mut doc = self.load()?;
        let inserted = self
            .apply_to_doc(&mut doc, mutations)
            .map_err(|e| StorageError::SourceWriteFailed(format!("{e} (batch rolled back)")))?;
        let bytes = serde_json::to_vec_pretty(&doc)?;
        write_atomic(&self.path, &bytes).map_err(|e| StorageError::SourceWriteFailed(e.to_string()))?;
        info!(
            "Applied {} mutations to {:?} for layer {}",
            mutations.len(),
            self.path,
            self.binding.layer_id
        );
        Ok(inserted)
    }
}
