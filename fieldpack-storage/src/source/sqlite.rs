//! SQLite tables: `sqlite` database sources and fieldpack containers.
//!
//! Geometry columns hold GeoJSON text. Writes go through one SQLite
//! transaction per batch, so a failed batch leaves the table untouched.

use super::{Connector, FeatureSource, SourceBinding, next_key};
use crate::container::Container;
use crate::error::{StorageError, StorageResult};
use crate::mutation::Mutation;
use crate::sql::{from_sql, key_to_sql, placeholders, quote_ident, to_sql};
use fieldpack_model::{DataSourceDescriptor, FileFormat};
use fieldpack_types::{Feature, FeatureKey, FieldType, Geometry, Value};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Connector for `driver = "sqlite"` databases and container files.
pub struct SqliteConnector;

struct Target {
    path: PathBuf,
    table: String,
    geometry_column: Option<String>,
    filter: Option<String>,
}

fn target(binding: &SourceBinding) -> StorageResult<Target> {
    match &binding.descriptor {
        DataSourceDescriptor::Database {
            connection,
            table,
            geometry_column,
            filter,
            ..
        } => Ok(Target {
            path: binding.resolve(connection),
            table: table.clone(),
            geometry_column: if binding.spatial {
                geometry_column.clone()
            } else {
                None
            },
            filter: filter.clone(),
        }),
        DataSourceDescriptor::LocalFile {
            path,
            format: FileFormat::Container,
            layer_name,
            ..
        } => {
            let path = binding.resolve(path);
            if !path.is_file() {
                return Err(StorageError::SourceUnavailable(format!(
                    "container {} does not exist",
                    path.display()
                )));
            }
            let container = Container::open(&path)?;
            let layer = match layer_name {
                Some(name) => container.layer(name)?,
                None => container.layer_for(&binding.layer_id)?,
            };
            Ok(Target {
                path,
                table: layer.table,
                geometry_column: layer.geometry_column,
                filter: None,
            })
        }
        other => Err(StorageError::UnsupportedSourceType(other.kind_name())),
    }
}

fn table_exists(conn: &Connection, table: &str) -> StorageResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

impl Connector for SqliteConnector {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports(&self, descriptor: &DataSourceDescriptor) -> bool {
        match descriptor {
            DataSourceDescriptor::Database { driver, .. } => driver.eq_ignore_ascii_case("sqlite"),
            DataSourceDescriptor::LocalFile { format, .. } => *format == FileFormat::Container,
            DataSourceDescriptor::RemoteService { .. } => false,
        }
    }

    fn probe(&self, binding: &SourceBinding) -> StorageResult<()> {
        let target = target(binding)?;
        if !target.path.is_file() {
            return Err(StorageError::SourceUnavailable(format!(
                "database {} does not exist",
                target.path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &target.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StorageError::SourceUnavailable(e.to_string()))?;
        conn.busy_timeout(binding.timeout)?;
        if !table_exists(&conn, &target.table)? {
            return Err(StorageError::SourceUnavailable(format!(
                "table {} not found in {}",
                target.table,
                target.path.display()
            )));
        }
        Ok(())
    }

    fn open(&self, binding: SourceBinding) -> StorageResult<Box<dyn FeatureSource>> {
        Ok(Box::new(SqliteSource::open(binding)?))
    }
}

/// One SQLite table exposed as a feature source.
pub struct SqliteSource {
    conn: Connection,
    binding: SourceBinding,
    table: String,
    geometry_column: Option<String>,
    filter: Option<String>,
    /// The key column is an `INTEGER PRIMARY KEY`, so SQLite assigns it.
    rowid_key: bool,
}

impl SqliteSource {
    pub fn open(binding: SourceBinding) -> StorageResult<Self> {
        let target = target(&binding)?;
        if !target.path.is_file() {
            return Err(StorageError::SourceUnavailable(format!(
                "database {} does not exist",
                target.path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            &target.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(binding.timeout)?;
        if !table_exists(&conn, &target.table)? {
            return Err(StorageError::NotFound(format!("table {}", target.table)));
        }
        let rowid_key = match &binding.key_field {
            Some(key) => is_rowid_alias(&conn, &target.table, key)?,
            None => false,
        };
        debug!(
            "Opened SQLite source {:?} table {} for layer {}",
            target.path, target.table, binding.layer_id
        );
        Ok(Self {
            conn,
            binding,
            table: target.table,
            geometry_column: target.geometry_column,
            filter: target.filter,
            rowid_key,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.conn.path().map(Path::new)
    }

    fn select_columns(&self) -> String {
        let mut cols: Vec<String> = self.binding.fields.iter().map(|f| quote_ident(&f.name)).collect();
        if let Some(g) = &self.geometry_column {
            cols.push(quote_ident(g));
        }
        if cols.is_empty() {
            cols.push("NULL".into());
        }
        cols.join(", ")
    }

    fn decode(&self, row: &rusqlite::Row<'_>, offset: usize) -> StorageResult<Feature> {
        let mut raw = Vec::with_capacity(self.binding.fields.len());
        for i in 0..self.binding.fields.len() {
            raw.push(row.get::<_, SqlValue>(offset + i)?);
        }
        let geometry = match &self.geometry_column {
            Some(_) => {
                let text: Option<String> = row.get(offset + self.binding.fields.len())?;
                text.as_deref().map(Geometry::parse).transpose()?
            }
            None => None,
        };
        let fields = &self.binding.fields;
        let mut values = raw.into_iter();
        let mut decoded = Vec::with_capacity(fields.len());
        for field in fields {
            let value = match values.next() {
                Some(v) => from_sql(v, field.field_type)?,
                None => Value::Null,
            };
            decoded.push((field.name.as_str(), value));
        }
        self.binding.build_feature(
            |name| {
                decoded
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, v)| v.clone())
            },
            geometry,
        )
    }
}

fn is_rowid_alias(conn: &Connection, table: &str, column: &str) -> StorageResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let pk_columns = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(_, _, pk)| *pk > 0)
        .collect::<Vec<_>>();
    Ok(matches!(
        pk_columns.as_slice(),
        [(name, ty, _)] if name.eq_ignore_ascii_case(column) && ty.eq_ignore_ascii_case("INTEGER")
    ))
}

impl FeatureSource for SqliteSource {
    fn binding(&self) -> &SourceBinding {
        &self.binding
    }

    fn read_batches(
        &mut self,
        batch_size: usize,
        visit: &mut dyn FnMut(Vec<Feature>) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let filter = self
            .filter
            .as_deref()
            .map(|f| format!("({f}) AND "))
            .unwrap_or_default();
        let sql = format!(
            "SELECT rowid, {} FROM {} WHERE {filter}rowid > ?1 ORDER BY rowid LIMIT ?2",
            self.select_columns(),
            quote_ident(&self.table),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut after = i64::MIN;
        loop {
            let mut rows = stmt.query(params![after, batch_size as i64])?;
            let mut batch = Vec::with_capacity(batch_size);
            while let Some(row) = rows.next()? {
                after = row.get(0)?;
                batch.push(self.decode(row, 1)?);
            }
            if batch.is_empty() {
                return Ok(());
            }
            let full = batch.len() == batch_size;
            visit(batch)?;
            if !full {
                return Ok(());
            }
        }
    }

    fn fetch(&mut self, keys: &[FeatureKey]) -> StorageResult<Vec<Feature>> {
        let Some(key_field) = self.binding.key_field.clone() else {
            return Ok(Vec::new());
        };
        let key_type = self.binding.key_type();
        let mut features = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(crate::DEFAULT_BATCH_SIZE) {
            let sql = format!(
                "SELECT {} FROM {} WHERE {} IN ({})",
                self.select_columns(),
                quote_ident(&self.table),
                quote_ident(&key_field),
                placeholders(chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(
                chunk.iter().map(|k| key_to_sql(k, key_type)),
            ))?;
            while let Some(row) = rows.next()? {
                features.push(self.decode(row, 0)?);
            }
        }
        Ok(features)
    }

    fn apply(&mut self, mutations: &[Mutation]) -> StorageResult<Vec<FeatureKey>> {
        let tx = self.conn.transaction()?;
        let writer = Writer {
            binding: &self.binding,
            table: &self.table,
            geometry_column: self.geometry_column.as_deref(),
            rowid_key: self.rowid_key,
        };
        let inserted = match writer.apply(&tx, mutations) {
            Ok(keys) => keys,
            Err(e) => {
                // Dropping the transaction rolls the batch back.
                return Err(StorageError::SourceWriteFailed(format!(
                    "{} (batch of {} rolled back)",
                    e,
                    mutations.len()
                )));
            }
        };
        tx.commit()
            .map_err(|e| StorageError::SourceWriteFailed(e.to_string()))?;
        info!(
            "Applied {} mutations to {} for layer {}",
            mutations.len(),
            self.table,
            self.binding.layer_id
        );
        Ok(inserted)
    }
}

struct Writer<'a> {
    binding: &'a SourceBinding,
    table: &'a str,
    geometry_column: Option<&'a str>,
    rowid_key: bool,
}

impl Writer<'_> {
    fn apply(&self, tx: &Transaction<'_>, mutations: &[Mutation]) -> StorageResult<Vec<FeatureKey>> {
        let mut inserted = Vec::new();
        for mutation in mutations {
            match mutation {
                Mutation::Insert { feature } => inserted.push(self.insert(tx, feature)?),
                Mutation::Update {
                    key,
                    attributes,
                    geometry,
                } => self.update(tx, key, attributes, geometry.as_ref())?,
                Mutation::Delete { key } => self.delete(tx, key)?,
            }
        }
        Ok(inserted)
    }

    fn insert(&self, tx: &Transaction<'_>, feature: &Feature) -> StorageResult<FeatureKey> {
        let key_field = self.binding.key_field.as_deref();
        let key_type = self.binding.key_type();
        let provided = feature
            .key
            .clone()
            .or_else(|| key_field.and_then(|k| FeatureKey::from_value(feature.attribute(k))));
        let key = match (provided, key_field) {
            (Some(k), _) => Some(k),
            (None, Some(_)) if self.rowid_key => None,
            (None, Some(k)) => Some(self.next_key(tx, k, key_type)?),
            (None, None) => None,
        };

        let mut columns = Vec::new();
        let mut values = Vec::new();
        for field in &self.binding.fields {
            if Some(field.name.as_str()) == key_field {
                if let Some(k) = &key {
                    columns.push(quote_ident(&field.name));
                    values.push(key_to_sql(k, key_type));
                }
                continue;
            }
            columns.push(quote_ident(&field.name));
            values.push(to_sql(feature.attribute(&field.name)));
        }
        if let Some(g) = self.geometry_column {
            columns.push(quote_ident(g));
            values.push(geometry_to_sql(feature.geometry.as_ref()));
        }
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(self.table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(self.table),
                columns.join(", "),
                placeholders(values.len())
            )
        };
        tx.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(key.unwrap_or_else(|| FeatureKey::from(tx.last_insert_rowid())))
    }

    fn next_key(&self, tx: &Transaction<'_>, key_field: &str, key_type: FieldType) -> StorageResult<FeatureKey> {
        if key_type != FieldType::Integer {
            return Ok(next_key(key_type, std::iter::empty()));
        }
        let max: Option<i64> = tx.query_row(
            &format!("SELECT MAX({}) FROM {}", quote_ident(key_field), quote_ident(self.table)),
            [],
            |row| row.get(0),
        )?;
        Ok(FeatureKey::from(max.unwrap_or(0) + 1))
    }

    fn update(
        &self,
        tx: &Transaction<'_>,
        key: &FeatureKey,
        attributes: &std::collections::BTreeMap<String, Value>,
        geometry: Option<&Option<Geometry>>,
    ) -> StorageResult<()> {
        let key_field = self.key_field()?;
        let mut sets = Vec::new();
        let mut values = Vec::new();
        for (name, value) in attributes {
            if name == key_field || self.binding.field_type(name).is_none() {
                continue;
            }
            sets.push(format!("{} = ?", quote_ident(name)));
            values.push(to_sql(value));
        }
        if let (Some(column), Some(g)) = (self.geometry_column, geometry) {
            sets.push(format!("{} = ?", quote_ident(column)));
            values.push(geometry_to_sql(g.as_ref()));
        }
        if sets.is_empty() {
            return Ok(());
        }
        values.push(key_to_sql(key, self.binding.key_type()));
        let changed = tx.execute(
            &format!(
                "UPDATE {} SET {} WHERE {} = ?",
                quote_ident(self.table),
                sets.join(", "),
                quote_ident(key_field)
            ),
            rusqlite::params_from_iter(values),
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(format!("feature {key}")));
        }
        Ok(())
    }

    fn delete(&self, tx: &Transaction<'_>, key: &FeatureKey) -> StorageResult<()> {
        let key_field = self.key_field()?;
        tx.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote_ident(self.table),
                quote_ident(key_field)
            ),
            params![key_to_sql(key, self.binding.key_type())],
        )?;
        Ok(())
    }

    fn key_field(&self) -> StorageResult<&str> {
        self.binding
            .key_field
            .as_deref()
            .ok_or_else(|| StorageError::ReadOnly(format!("layer {} has no key", self.binding.layer_id)))
    }
}

fn geometry_to_sql(geometry: Option<&Geometry>) -> SqlValue {
    geometry.map_or(SqlValue::Null, |g| SqlValue::Text(g.to_text()))
}
