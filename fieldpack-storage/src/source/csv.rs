//! Delimited text point layers.
//!
//! Geometry is a point built from the configured x/y columns. Reads stream
//! records straight from the file; writes rewrite the whole file and swap it
//! in atomically.

use super::{Connector, FeatureSource, SourceBinding, next_key};
use crate::atomic::write_atomic;
use crate::error::{StorageError, StorageResult};
use crate::mutation::Mutation;
use fieldpack_model::{CsvOptions, DataSourceDescriptor, FileFormat};
use fieldpack_types::{Feature, FeatureKey, Geometry, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::info;

pub struct CsvConnector;

impl Connector for CsvConnector {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn supports(&self, descriptor: &DataSourceDescriptor) -> bool {
        matches!(
            descriptor,
            DataSourceDescriptor::LocalFile {
                format: FileFormat::Csv,
                ..
            }
        )
    }

    fn probe(&self, binding: &SourceBinding) -> StorageResult<()> {
        let source = CsvSource::open(binding.clone())?;
        let headers = source.reader()?.headers()?.clone();
        for column in [&source.options.x_field, &source.options.y_field].into_iter().flatten() {
            if !headers.iter().any(|h| h == column) {
                return Err(StorageError::InvalidData(format!(
                    "coordinate column {column} missing from {}",
                    source.path.display()
                )));
            }
        }
        Ok(())
    }

    fn open(&self, binding: SourceBinding) -> StorageResult<Box<dyn FeatureSource>> {
        Ok(Box::new(CsvSource::open(binding)?))
    }
}

/// A CSV file exposed as a feature source.
pub struct CsvSource {
    binding: SourceBinding,
    path: PathBuf,
    options: CsvOptions,
    delimiter: u8,
}

impl CsvSource {
    pub fn open(binding: SourceBinding) -> StorageResult<Self> {
        let DataSourceDescriptor::LocalFile { path, csv, .. } = &binding.descriptor else {
            return Err(StorageError::UnsupportedSourceType(binding.descriptor.kind_name()));
        };
        let path = binding.resolve(path);
        if !path.is_file() {
            return Err(StorageError::SourceUnavailable(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let options = csv.clone().unwrap_or_default();
        let delimiter = u8::try_from(u32::from(options.delimiter))
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| StorageError::InvalidData(format!("delimiter {:?} is not ASCII", options.delimiter)))?;
        Ok(Self {
            binding,
            path,
            options,
            delimiter,
        })
    }

    fn reader(&self) -> StorageResult<::csv::Reader<std::fs::File>> {
        Ok(::csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .from_path(&self.path)?)
    }

    fn point(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Option<Geometry> {
        let (x_field, y_field) = (self.options.x_field.as_deref()?, self.options.y_field.as_deref()?);
        let x = lookup(x_field)?.trim().parse::<f64>().ok()?;
        let y = lookup(y_field)?.trim().parse::<f64>().ok()?;
        Some(Geometry::point(x, y))
    }

    fn decode(&self, headers: &::csv::StringRecord, record: &::csv::StringRecord) -> StorageResult<Feature> {
        let lookup = |name: &str| -> Option<String> {
            headers
                .iter()
                .position(|h| h == name)
                .and_then(|i| record.get(i))
                .map(str::to_string)
        };
        let geometry = self.point(&lookup);
        self.binding
            .build_feature(|name| lookup(name).map(Value::Text), geometry)
    }

    fn row_key(&self, headers: &::csv::StringRecord, row: &[String]) -> Option<FeatureKey> {
        let key_field = self.binding.key_field.as_deref()?;
        let i = headers.iter().position(|h| h == key_field)?;
        let value = Value::Text(row.get(i)?.clone())
            .coerce(self.binding.key_type())
            .ok()?;
        FeatureKey::from_value(&value)
    }

    /// Values for the columns of one row, geometry written to x/y.
    fn write_columns(
        &self,
        headers: &::csv::StringRecord,
        row: &mut [String],
        attributes: &BTreeMap<String, Value>,
        geometry: Option<&Option<Geometry>>,
    ) {
        for (name, value) in attributes {
            if self.binding.field_type(name).is_none() {
                continue;
            }
            if let Some(i) = headers.iter().position(|h| h == name) {
                row[i] = value.to_string();
            }
        }
        let Some(geometry) = geometry else {
            return;
        };
        let coords = geometry
            .as_ref()
            .and_then(|g| g.as_geojson().get("coordinates"))
            .and_then(serde_json::Value::as_array)
            .map(|c| {
                (
                    c.first().and_then(serde_json::Value::as_f64),
                    c.get(1).and_then(serde_json::Value::as_f64),
                )
            });
        for (field, coord) in [
            (&self.options.x_field, coords.and_then(|c| c.0)),
            (&self.options.y_field, coords.and_then(|c| c.1)),
        ] {
            if let Some(i) = field.as_ref().and_then(|f| headers.iter().position(|h| h == f)) {
                row[i] = coord.map(|v| v.to_string()).unwrap_or_default();
            }
        }
    }

    fn apply_to_rows(
        &self,
        headers: &::csv::StringRecord,
        rows: &mut Vec<Vec<String>>,
        mutations: &[Mutation],
    ) -> StorageResult<Vec<FeatureKey>> {
        let key_type = self.binding.key_type();
        let key_field = self.binding.key_field.clone();
        let mut known: HashSet<FeatureKey> = rows.iter().filter_map(|r| self.row_key(headers, r)).collect();
        let mut inserted = Vec::new();
        let mut deleted = HashSet::new();

        for mutation in mutations {
            match mutation {
                Mutation::Insert { feature } => {
                    let key = match (&feature.key, &key_field) {
                        (Some(k), _) => Some(k.clone()),
                        (None, Some(_)) => Some(next_key(key_type, known.iter())),
                        (None, None) => None,
                    };
                    let mut attributes = feature.attributes.clone();
                    if let (Some(k), Some(field)) = (&key, &key_field) {
                        attributes.insert(field.clone(), k.to_value(key_type));
                        known.insert(k.clone());
                    }
                    let mut row = vec![String::new(); headers.len()];
                    self.write_columns(headers, &mut row, &attributes, Some(&feature.geometry));
                    rows.push(row);
                    inserted.push(key.unwrap_or_else(|| FeatureKey::from(rows.len() as i64)));
                }
                Mutation::Update {
                    key,
                    attributes,
                    geometry,
                } => {
                    let mut attributes = attributes.clone();
                    if let Some(field) = &key_field {
                        attributes.remove(field);
                    }
                    let row = rows
                        .iter_mut()
                        .find(|r| self.row_key(headers, r).as_ref() == Some(key))
                        .ok_or_else(|| StorageError::NotFound(format!("feature {key}")))?;
                    self.write_columns(headers, row, &attributes, geometry.as_ref());
                }
                Mutation::Delete { key } => {
                    deleted.insert(key.clone());
                }
            }
        }
        if !deleted.is_empty() {
            rows.retain(|r| self.row_key(headers, r).is_none_or(|k| !deleted.contains(&k)));
        }
        Ok(inserted)
    }
}

impl FeatureSource for CsvSource {
    fn binding(&self) -> &SourceBinding {
        &self.binding
    }

    fn read_batches(
        &mut self,
        batch_size: usize,
        visit: &mut dyn FnMut(Vec<Feature>) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut reader = self.reader()?;
        let headers = reader.headers()?.clone();
        let mut batch = Vec::with_capacity(batch_size);
        for record in reader.records() {
            batch.push(self.decode(&headers, &record?)?);
            if batch.len() >= batch_size.max(1) {
                visit(std::mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            visit(batch)?;
        }
        Ok(())
    }

    fn fetch(&mut self, keys: &[FeatureKey]) -> StorageResult<Vec<Feature>> {
        let wanted: HashSet<&FeatureKey> = keys.iter().collect();
        let mut reader = self.reader()?;
        let headers = reader.headers()?.clone();
        let mut found = Vec::new();
        for record in reader.records() {
            let feature = self.decode(&headers, &record?)?;
            if feature.key.as_ref().is_some_and(|k| wanted.contains(k)) {
                found.push(feature);
            }
        }
        Ok(found)
    }

    fn apply(&mut self, mutations: &[Mutation]) -> StorageResult<Vec<FeatureKey>> {
        let mut reader = self.reader()?;
        let headers = reader.headers()?.clone();
        let mut rows = reader
            .records()
            .map(|r| r.map(|rec| rec.iter().map(str::to_string).collect::<Vec<_>>()))
            .collect::<Result<Vec<_>, _>>()?;
        let inserted = self
            .apply_to_rows(&headers, &mut rows, mutations)
            .map_err(|e| StorageError::SourceWriteFailed(format!("{e} (batch rolled back)")))?;

        let mut writer = ::csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(Vec::new());
        writer.write_record(&headers)?;
        for row in &rows {
            writer.write_record(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?;
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
