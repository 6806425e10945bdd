//! The base snapshot.
//!
//! Written once while a package is assembled and sealed before the package
//! is published. It records, per feature, a digest of the whole feature, of
//! its geometry and of every field, together with the values themselves so
//! a conflict report can show the base side without the original source.

use crate::error::{StorageError, StorageResult};
use crate::sql::placeholders;
use fieldpack_types::{
    Feature, FeatureKey, Geometry, LayerId, Value, feature_digest, geometry_digest, value_digest,
};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// One feature as it was at packaging time.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseFeature {
    pub key: FeatureKey,
    pub digest: String,
    pub geometry_digest: String,
    pub field_digests: BTreeMap<String, String>,
    pub feature: Feature,
}

impl BaseFeature {
    /// Digest of one field; a field unknown at packaging time digests as
    /// `Null`.
    #[must_use]
    pub fn field_digest(&self, field: &str) -> String {
        self.field_digests
            .get(field)
            .cloned()
            .unwrap_or_else(|| value_digest(&Value::Null))
    }
}

/// Base snapshot store backed by SQLite.
pub struct Snapshot {
    conn: Connection,
    read_only: bool,
}

impl Snapshot {
    /// Creates a new snapshot file for writing.
    pub fn create(path: &Path) -> StorageResult<Self> {
        if path.exists() {
            return Err(StorageError::InvalidData(format!(
                "snapshot {} already exists",
                path.display()
            )));
        }
        let snapshot = Self {
            conn: Connection::open(path)?,
            read_only: false,
        };
        snapshot.init_schema()?;
        Ok(snapshot)
    }

    /// Opens a sealed snapshot. The file is opened read-only.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.is_file() {
            return Err(StorageError::NotFound(format!("snapshot {}", path.display())));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            read_only: true,
        })
    }

    /// Opens an in-memory snapshot (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let snapshot = Self {
            conn: Connection::open_in_memory()?,
            read_only: false,
        };
        snapshot.init_schema()?;
        Ok(snapshot)
    }

    fn init_schema(&self) -> StorageResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS snapshot_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshot_features (
                layer_id TEXT NOT NULL,
                feature_key TEXT NOT NULL,
                digest TEXT NOT NULL,
                geometry_digest TEXT NOT NULL,
                geometry TEXT,
                PRIMARY KEY (layer_id, feature_key)
            );

            CREATE TABLE IF NOT EXISTS snapshot_values (
                layer_id TEXT NOT NULL,
                feature_key TEXT NOT NULL,
                field TEXT NOT NULL,
                digest TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (layer_id, feature_key, field)
            );
            ",
        )?;
        Ok(())
    }

    fn is_sealed(&self) -> StorageResult<bool> {
        let sealed: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM snapshot_meta WHERE key = 'sealed'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(sealed.is_some())
    }

    fn ensure_writable(&self) -> StorageResult<()> {
        if self.read_only || self.is_sealed()? {
            return Err(StorageError::ReadOnly("base snapshot is sealed".into()));
        }
        Ok(())
    }

    // ── Writing ──────────────────────────────────────────────────

    /// Records a batch of features for a layer. Every feature needs a key.
    pub fn record(&mut self, layer_id: &LayerId, features: &[Feature]) -> StorageResult<()> {
        self.ensure_writable()?;
        let tx = self.conn.transaction()?;
        {
            let mut feature_stmt = tx.prepare(
                "INSERT INTO snapshot_features (layer_id, feature_key, digest, geometry_digest, geometry)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut value_stmt = tx.prepare(
                "INSERT INTO snapshot_values (layer_id, feature_key, field, digest, value)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for feature in features {
                let key = feature.key.as_ref().ok_or_else(|| {
                    StorageError::InvalidData(format!("feature without key in layer {layer_id}"))
                })?;
                feature_stmt.execute(params![
                    layer_id.as_str(),
                    key.as_str(),
                    feature_digest(feature),
                    geometry_digest(feature.geometry.as_ref()),
                    feature.geometry.as_ref().map(Geometry::to_text),
                ])?;
                for (field, value) in &feature.attributes {
                    value_stmt.execute(params![
                        layer_id.as_str(),
                        key.as_str(),
                        field,
                        value_digest(value),
                        serde_json::to_string(value)?,
                    ])?;
                }
            }
        }
        tx.commit()?;
        debug!("Recorded {} base features for layer {}", features.len(), layer_id);
        Ok(())
    }

    /// Marks the snapshot immutable. Further writes fail.
    pub fn seal(&mut self) -> StorageResult<()> {
        self.ensure_writable()?;
        self.conn.execute(
            "INSERT INTO snapshot_meta (key, value) VALUES ('sealed', '1')",
            [],
        )?;
        info!("Sealed base snapshot");
        Ok(())
    }

    // ── Reading ──────────────────────────────────────────────────

    /// Looks up base features by key. Unknown keys are absent from the map.
    pub fn fetch(
        &self,
        layer_id: &LayerId,
        keys: &[FeatureKey],
    ) -> StorageResult<HashMap<FeatureKey, BaseFeature>> {
        let mut found = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(crate::DEFAULT_BATCH_SIZE) {
            let mut args: Vec<&str> = vec![layer_id.as_str()];
            args.extend(chunk.iter().map(FeatureKey::as_str));
            let mut stmt = self.conn.prepare(&format!(
                "SELECT feature_key, digest, geometry_digest, geometry FROM snapshot_features
                 WHERE layer_id = ? AND feature_key IN ({})",
                placeholders(chunk.len())
            ))?;
            let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
            while let Some(row) = rows.next()? {
                let key = FeatureKey::new(row.get::<_, String>(0)?);
                let geometry: Option<String> = row.get(3)?;
                let mut feature = Feature::new(Some(key.clone()));
                feature.geometry = geometry.as_deref().map(Geometry::parse).transpose()?;
                found.insert(
                    key.clone(),
                    BaseFeature {
                        key,
                        digest: row.get(1)?,
                        geometry_digest: row.get(2)?,
                        field_digests: BTreeMap::new(),
                        feature,
                    },
                );
            }

            let mut stmt = self.conn.prepare(&format!(
                "SELECT feature_key, field, digest, value FROM snapshot_values
                 WHERE layer_id = ? AND feature_key IN ({})",
                placeholders(chunk.len())
            ))?;
            let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
            while let Some(row) = rows.next()? {
                let key = FeatureKey::new(row.get::<_, String>(0)?);
                let Some(base) = found.get_mut(&key) else {
                    continue;
                };
                let field: String = row.get(1)?;
                let value: Value = serde_json::from_str(&row.get::<_, String>(3)?)?;
                base.field_digests.insert(field.clone(), row.get(2)?);
                base.feature.attributes.insert(field, value);
            }
        }
        Ok(found)
    }

    /// Streams the layer's base keys in key order.
    pub fn read_keys(
        &self,
        layer_id: &LayerId,
        batch_size: usize,
        visit: &mut dyn FnMut(Vec<FeatureKey>) -> StorageResult<()>,
    ) -> StorageResult<()> {
        let mut stmt = self.conn.prepare(
            "SELECT feature_key FROM snapshot_features
             WHERE layer_id = ?1 AND feature_key > ?2
             ORDER BY feature_key LIMIT ?3",
        )?;
        let mut after = String::new();
        loop {
            let batch = stmt
                .query_map(params![layer_id.as_str(), after, batch_size as i64], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            after = last.clone();
            let full = batch.len() == batch_size;
            visit(batch.into_iter().map(FeatureKey::new).collect())?;
            if !full {
                return Ok(());
            }
        }
    }

    pub fn count(&self, layer_id: &LayerId) -> StorageResult<u64> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM snapshot_features WHERE layer_id = ?1",
            params![layer_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(n).unwrap_or_default())
    }
}
