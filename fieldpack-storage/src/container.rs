//! The embeddable layer container.
//!
//! A container is a plain SQLite file. Each packaged layer gets one table
//! with an internal row id column, its attribute columns and a GeoJSON
//! geometry column. Two metadata tables describe the layers so a container
//! can be read back without the project that produced it. A third, created
//! by the first sync that needs it, records the keys of features that
//! reached the source through a sync.

use crate::error::{StorageError, StorageResult};
use crate::mutation::Mutation;
use crate::source::{FieldSpec, SourceBinding};
use crate::sql::{from_sql, key_to_sql, placeholders, quote_ident, to_sql};
use fieldpack_model::{DataSourceDescriptor, FileFormat};
use fieldpack_types::{Feature, FeatureKey, FieldType, Geometry, GeometryType, LayerId, Value};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Metadata table listing every layer table in a container.
pub const CONTENTS_TABLE: &str = "fieldpack_contents";
const FIELDS_TABLE: &str = "fieldpack_fields";
/// Keys that reached the source through a sync of this container.
const SYNCED_TABLE: &str = "fieldpack_synced_keys";

/// Picks `base`, or `base_1`, `base_2`, ... so the result collides with no
/// existing column. Comparison ignores ASCII case like SQLite does.
#[must_use]
pub fn unique_column<'a>(base: &str, taken: impl IntoIterator<Item = &'a str>) -> String {
    let taken: Vec<String> = taken.into_iter().map(str::to_ascii_lowercase).collect();
    let is_taken = |name: &str| taken.iter().any(|t| t == &name.to_ascii_lowercase());
    if !is_taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|i| format!("{base}_{i}"))
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Description of one layer table inside a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerLayer {
    pub table: String,
    pub layer_id: LayerId,
    pub geometry_type: Option<GeometryType>,
    pub crs: Option<String>,
    /// Internal row id column; never a source field.
    pub fid_column: String,
    pub geometry_column: Option<String>,
    /// Field carrying the source key. `NULL` in rows created offline.
    pub key_field: Option<String>,
    pub fields: Vec<FieldSpec>,
}

impl ContainerLayer {
    /// Describes a layer table, choosing collision-free names for the row
    /// id and geometry columns.
    pub fn new(
        table: impl Into<String>,
        layer_id: LayerId,
        fields: Vec<FieldSpec>,
        geometry_type: Option<GeometryType>,
    ) -> Self {
        let fid_column = unique_column("fid", fields.iter().map(|f| f.name.as_str()));
        let geometry_column = geometry_type.map(|_| {
            unique_column(
                "geometry",
                fields
                    .iter()
                    .map(|f| f.name.as_str())
                    .chain(std::iter::once(fid_column.as_str())),
            )
        });
        Self {
            table: table.into(),
            layer_id,
            geometry_type,
            crs: None,
            fid_column,
            geometry_column,
            key_field: None,
            fields,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key_field: Option<String>) -> Self {
        self.key_field = key_field;
        self
    }

    #[must_use]
    pub fn with_crs(mut self, crs: Option<String>) -> Self {
        self.crs = crs;
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

    /// Binding that opens this table through the regular source
    /// connectors, for keyed reads and writes.
    #[must_use]
    pub fn binding(&self, container_path: &Path) -> SourceBinding {
        let descriptor = DataSourceDescriptor::LocalFile {
            path: container_path.to_string_lossy().into_owned(),
            format: FileFormat::Container,
            layer_name: Some(self.table.clone()),
            csv: None,
        };
        let home = container_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        SourceBinding::new(self.layer_id.clone(), descriptor, home)
            .with_fields(self.fields.clone())
            .with_key(self.key_field.clone())
            .with_spatial(self.geometry_column.is_some())
    }

    fn select_columns(&self) -> String {
        let mut cols = vec![quote_ident(&self.fid_column)];
        cols.extend(self.fields.iter().map(|f| quote_ident(&f.name)));
        if let Some(g) = &self.geometry_column {
            cols.push(quote_ident(g));
        }
        cols.join(", ")
    }
}

/// A container row: internal row id plus the feature it holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRow {
    pub fid: i64,
    pub feature: Feature,
}

/// An open container file.
pub struct Container {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Container {
    /// Creates a new, empty container. Fails if the file exists.
    pub fn create(path: &Path) -> StorageResult<Self> {
        if path.exists() {
            return Err(StorageError::InvalidData(format!(
                "container {} already exists",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        let container = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        container.init_schema()?;
        debug!("Created container {:?}", path);
        Ok(container)
    }

    /// Opens an existing container for reading and writing.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.is_file() {
            return Err(StorageError::NotFound(format!("container {}", path.display())));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let container = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        if !container.has_contents_table()? {
            return Err(StorageError::InvalidData(format!(
                "{} is not a fieldpack container",
                path.display()
            )));
        }
        Ok(container)
    }

    /// Opens an in-memory container (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let container = Self { conn, path: None };
        container.init_schema()?;
        Ok(container)
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {CONTENTS_TABLE} (
                table_name TEXT PRIMARY KEY,
                layer_id TEXT NOT NULL UNIQUE,
                geometry_type TEXT,
                geometry_column TEXT,
                crs TEXT,
                fid_column TEXT NOT NULL,
                key_field TEXT
            );

            CREATE TABLE IF NOT EXISTS {FIELDS_TABLE} (
                table_name TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                field_type TEXT NOT NULL,
                PRIMARY KEY (table_name, position)
            );
            "
        ))?;
        Ok(())
    }

    fn has_contents_table(&self) -> StorageResult<bool> {
        self.has_table(CONTENTS_TABLE)
    }

    fn has_table(&self, name: &str) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ── Layers ───────────────────────────────────────────────────

    /// Creates the table for a layer and records its metadata.
    pub fn create_layer(&mut self, layer: &ContainerLayer) -> StorageResult<()> {
        let mut columns = vec![format!("{} INTEGER PRIMARY KEY", quote_ident(&layer.fid_column))];
        for field in &layer.fields {
            columns.push(format!("{} {}", quote_ident(&field.name), field.field_type.sql_type()));
        }
        if let Some(g) = &layer.geometry_column {
            columns.push(format!("{} TEXT", quote_ident(g)));
        }

        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TABLE {} ({});",
            quote_ident(&layer.table),
            columns.join(", ")
        ))?;
        if let Some(key) = &layer.key_field {
            tx.execute_batch(&format!(
                "CREATE UNIQUE INDEX {} ON {} ({});",
                quote_ident(&format!("{}_key", layer.table)),
                quote_ident(&layer.table),
                quote_ident(key)
            ))?;
        }
        tx.execute(
            &format!(
                "INSERT INTO {CONTENTS_TABLE} (table_name, layer_id, geometry_type, geometry_column, crs, fid_column, key_field)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ),
            params![
                layer.table,
                layer.layer_id.as_str(),
                layer.geometry_type.map(GeometryType::name),
                layer.geometry_column,
                layer.crs,
                layer.fid_column,
                layer.key_field,
            ],
        )?;
        for (position, field) in layer.fields.iter().enumerate() {
            tx.execute(
                &format!(
                    "INSERT INTO {FIELDS_TABLE} (table_name, position, name, field_type) VALUES (?1, ?2, ?3, ?4)"
                ),
                params![layer.table, position as i64, field.name, field.field_type.name()],
            )?;
        }
        tx.commit()?;
        debug!("Created container table {} for layer {}", layer.table, layer.layer_id);
        Ok(())
    }

    /// All layer tables, in table name order.
    pub fn layers(&self) -> StorageResult<Vec<ContainerLayer>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT table_name FROM {CONTENTS_TABLE} ORDER BY table_name"))?;
        let tables = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        tables.iter().map(|t| self.layer(t)).collect()
    }

    /// Metadata for one layer table.
    pub fn layer(&self, table: &str) -> StorageResult<ContainerLayer> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT layer_id, geometry_type, geometry_column, crs, fid_column, key_field
                     FROM {CONTENTS_TABLE} WHERE table_name = ?1"
                ),
                params![table],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(format!("container table {table}")))?;
        let (layer_id, geometry_type, geometry_column, crs, fid_column, key_field) = row;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT name, field_type FROM {FIELDS_TABLE} WHERE table_name = ?1 ORDER BY position"
        ))?;
        let fields = stmt
            .query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(name, ty)| -> StorageResult<FieldSpec> {
                let field_type: FieldType = serde_json::from_value(serde_json::Value::String(ty))?;
                Ok(FieldSpec { name, field_type })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(ContainerLayer {
            table: table.to_string(),
            layer_id: LayerId::new(layer_id),
            geometry_type: geometry_type.as_deref().and_then(GeometryType::parse),
            crs,
            fid_column,
            geometry_column,
            key_field,
            fields,
        })
    }

    /// Metadata for the table holding the given layer.
    pub fn layer_for(&self, layer_id: &LayerId) -> StorageResult<ContainerLayer> {
        let table: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT table_name FROM {CONTENTS_TABLE} WHERE layer_id = ?1"),
                params![layer_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match table {
            Some(t) => self.layer(&t),
            None => Err(StorageError::NotFound(format!("layer {layer_id} in container"))),
        }
    }

    // ── Features ─────────────────────────────────────────────────

    /// Appends features in one transaction. Returns the number written.
    pub fn insert_features(&mut self, layer: &ContainerLayer, features: &[Feature]) -> StorageResult<usize> {
        let tx = self.conn.transaction()?;
        insert_rows(&tx, layer, features)?;
        tx.commit()?;
        Ok(features.len())
    }

    /// Streams rows in row id order, `batch_size` at a time.
    pub fn read_batches(
        &self,
        layer: &ContainerLayer,
        batch_size: usize,
        visit: &mut dyn FnMut(Vec<ContainerRow>) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} > ?1 ORDER BY {} LIMIT ?2",
            layer.select_columns(),
            quote_ident(&layer.table),
            quote_ident(&layer.fid_column),
            quote_ident(&layer.fid_column),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut after = i64::MIN;
        loop {
            let mut rows = stmt.query(params![after, batch_size as i64])?;
            let mut batch = Vec::with_capacity(batch_size);
            while let Some(row) = rows.next()? {
                batch.push(self.decode_row(layer, row)?);
            }
            let Some(last) = batch.last() else {
                return Ok(());
            };
            after = last.fid;
            let full = batch.len() == batch_size;
            visit(batch)?;
            if !full {
                return Ok(());
            }
        }
    }

    fn decode_row(&self, layer: &ContainerLayer, row: &rusqlite::Row<'_>) -> StorageResult<ContainerRow> {
        let fid: i64 = row.get(0)?;
        let mut feature = Feature::default();
        for (i, field) in layer.fields.iter().enumerate() {
            let raw: rusqlite::types::Value = row.get(i + 1)?;
            feature
                .attributes
                .insert(field.name.clone(), from_sql(raw, field.field_type)?);
        }
        if layer.geometry_column.is_some() {
            let text: Option<String> = row.get(layer.fields.len() + 1)?;
            feature.geometry = text.as_deref().map(Geometry::parse).transpose()?;
        }
        feature.key = layer
            .key_field
            .as_deref()
            .and_then(|k| FeatureKey::from_value(feature.attribute(k)));
        Ok(ContainerRow { fid, feature })
    }

    /// Which of `keys` still have a row in the layer table.
    pub fn keys_present(&self, layer: &ContainerLayer, keys: &[FeatureKey]) -> StorageResult<HashSet<FeatureKey>> {
        let Some(key_field) = &layer.key_field else {
            return Ok(HashSet::new());
        };
        let key_type = layer.key_type();
        let mut present = HashSet::new();
        for chunk in keys.chunks(crate::DEFAULT_BATCH_SIZE) {
            let sql = format!(
                "SELECT {k} FROM {t} WHERE {k} IN ({})",
                placeholders(chunk.len()),
                k = quote_ident(key_field),
                t = quote_ident(&layer.table),
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let values = chunk.iter().map(|k| key_to_sql(k, key_type));
            let mut rows = stmt.query(rusqlite::params_from_iter(values))?;
            while let Some(row) = rows.next()? {
                let raw: rusqlite::types::Value = row.get(0)?;
                if let Some(key) = FeatureKey::from_value(&from_sql(raw, key_type)?) {
                    present.insert(key);
                }
            }
        }
        Ok(present)
    }

    /// Writes source-assigned keys into rows created offline.
    pub fn assign_keys(&mut self, layer: &ContainerLayer, assignments: &[(i64, FeatureKey)]) -> StorageResult<()> {
        let Some(key_field) = &layer.key_field else {
            return Err(StorageError::InvalidData(format!(
                "layer {} has no key field",
                layer.layer_id
            )));
        };
        let key_type = layer.key_type();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                quote_ident(&layer.table),
                quote_ident(key_field),
                quote_ident(&layer.fid_column)
            ))?;
            for (fid, key) in assignments {
                stmt.execute(params![key_to_sql(key, key_type), fid])?;
            }
        }
        tx.commit()?;
        debug!(
            "Assigned {} source keys in container table {}",
            assignments.len(),
            layer.table
        );
        Ok(())
    }

    /// Records keys the source holds because a sync inserted or adopted
    /// them from this container. The ledger table is created on first use.
    pub fn mark_synced(&mut self, layer: &ContainerLayer, keys: &[FeatureKey]) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {SYNCED_TABLE} (
                table_name TEXT NOT NULL,
                key TEXT NOT NULL,
                PRIMARY KEY (table_name, key)
            );"
        ))?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR IGNORE INTO {SYNCED_TABLE} (table_name, key) VALUES (?1, ?2)"
            ))?;
            for key in keys {
                stmt.execute(params![layer.table, key.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Every key recorded by [`Container::mark_synced`] for the layer.
    pub fn synced_keys(&self, layer: &ContainerLayer) -> StorageResult<HashSet<FeatureKey>> {
        if !self.has_table(SYNCED_TABLE)? {
            return Ok(HashSet::new());
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT key FROM {SYNCED_TABLE} WHERE table_name = ?1"))?;
        let keys = stmt
            .query_map(params![layer.table], |row| row.get::<_, String>(0))?
            .map(|key| key.map(FeatureKey::new))
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(keys)
    }

    pub fn count(&self, layer: &ContainerLayer) -> StorageResult<u64> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&layer.table)),
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    /// Reads a single value, for inspection and tests.
    pub fn value(&self, layer: &ContainerLayer, fid: i64, field: &str) -> StorageResult<Value> {
        let ty = layer
            .field_type(field)
            .ok_or_else(|| StorageError::NotFound(format!("field {field}")))?;
        let raw: rusqlite::types::Value = self.conn.query_row(
            &format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                quote_ident(field),
                quote_ident(&layer.table),
                quote_ident(&layer.fid_column)
            ),
            params![fid],
            |row| row.get(0),
        )?;
        from_sql(raw, ty)
    }

    /// Overwrites one value of a row.
    pub fn set_value(&mut self, layer: &ContainerLayer, fid: i64, field: &str, value: &Value) -> StorageResult<()> {
        if layer.field_type(field).is_none() {
            return Err(StorageError::NotFound(format!("field {field}")));
        }
        self.conn.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE {} = ?2",
                quote_ident(&layer.table),
                quote_ident(field),
                quote_ident(&layer.fid_column)
            ),
            params![to_sql(value), fid],
        )?;
        Ok(())
    }

    /// Applies keyed mutations in one transaction.
    ///
    /// Updates and deletes address rows by key field; keys without a row
    /// are skipped. Attributes the table does not carry are ignored.
    pub fn apply(&mut self, layer: &ContainerLayer, mutations: &[Mutation]) -> StorageResult<()> {
        let Some(key_field) = layer.key_field.as_deref() else {
            return Err(StorageError::InvalidData(format!(
                "layer {} has no key field",
                layer.layer_id
            )));
        };
        let key_type = layer.key_type();
        let inserts: Vec<Feature> = mutations
            .iter()
            .filter_map(|m| match m {
                Mutation::Insert { feature } => Some(keyed(feature, key_field, key_type)),
                _ => None,
            })
            .collect();

        let tx = self.conn.transaction()?;
        for mutation in mutations {
            match mutation {
                Mutation::Insert { .. } => {}
                Mutation::Update {
                    key,
                    attributes,
                    geometry,
                } => {
                    let mut sets = Vec::new();
                    let mut values = Vec::new();
                    for (name, value) in attributes {
                        if name == key_field || layer.field_type(name).is_none() {
                            continue;
                        }
                        sets.push(format!("{} = ?", quote_ident(name)));
                        values.push(to_sql(value));
                    }
                    if let (Some(column), Some(geometry)) = (&layer.geometry_column, geometry) {
                        sets.push(format!("{} = ?", quote_ident(column)));
                        values.push(match geometry {
                            Some(g) => rusqlite::types::Value::Text(g.to_text()),
                            None => rusqlite::types::Value::Null,
                        });
                    }
                    if sets.is_empty() {
                        continue;
                    }
                    values.push(key_to_sql(key, key_type));
                    tx.execute(
                        &format!(
                            "UPDATE {} SET {} WHERE {} = ?",
                            quote_ident(&layer.table),
                            sets.join(", "),
                            quote_ident(key_field)
                        ),
                        rusqlite::params_from_iter(values),
                    )?;
                }
                Mutation::Delete { key } => {
                    tx.execute(
                        &format!(
                            "DELETE FROM {} WHERE {} = ?1",
                            quote_ident(&layer.table),
                            quote_ident(key_field)
                        ),
                        params![key_to_sql(key, key_type)],
                    )?;
                }
            }
        }
        insert_rows(&tx, layer, &inserts)?;
        tx.commit()?;
        debug!("Applied {} mutations to container table {}", mutations.len(), layer.table);
        Ok(())
    }
}

/// Inserts rows through any connection or open transaction.
fn insert_rows(conn: &Connection, layer: &ContainerLayer, features: &[Feature]) -> StorageResult<()> {
    let mut columns: Vec<String> = layer.fields.iter().map(|f| quote_ident(&f.name)).collect();
    if let Some(g) = &layer.geometry_column {
        columns.push(quote_ident(g));
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&layer.table),
        columns.join(", "),
        placeholders(columns.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    for feature in features {
        let mut values: Vec<rusqlite::types::Value> = layer
            .fields
            .iter()
            .map(|f| to_sql(feature.attribute(&f.name)))
            .collect();
        if layer.geometry_column.is_some() {
            values.push(match &feature.geometry {
                Some(g) => rusqlite::types::Value::Text(g.to_text()),
                None => rusqlite::types::Value::Null,
            });
        }
        stmt.execute(rusqlite::params_from_iter(values))?;
    }
    Ok(())
}

/// A copy of `feature` with its key written into the key field.
fn keyed(feature: &Feature, key_field: &str, key_type: FieldType) -> Feature {
    let mut feature = feature.clone();
    if let Some(key) = &feature.key {
        feature
            .attributes
            .insert(key_field.to_string(), key.to_value(key_type));
    }
    feature
}
