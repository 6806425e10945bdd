//! The synchronizer.
//!
//! Each layer is compared in two streamed passes. The first walks the
//! package container and diffs every keyed row against its base and its
//! current source feature; rows without a key are offline additions. The
//! second walks the base snapshot's keys to find features deleted offline.
//! Everything a layer needs to write is collected first and committed to
//! the source as one batch, then mirrored into the package. Attachments
//! captured offline are copied into the project only after that.
//!
//! A keyed row the snapshot never saw is either an offline addition or a
//! feature an earlier sync of the same package inserted. The container
//! keeps a ledger of the latter; only those are diffed against the source.
//! Any other row whose key the source already uses is a key collision.

use crate::attachments::AttachmentMapper;
use crate::config::SyncConfig;
use crate::conflict::{
    ConflictPolicy, ConflictRecord, ConflictTarget, Decision, ResolutionState, feature_value,
    geometry_value, resolve,
};
use crate::diff::{FieldState, classify};
use crate::error::{SyncError, SyncResult};
use crate::report::{
    Applied, CONFLICTS_FILE, ConflictReport, LayerSyncOutcome, LayerSyncReport, SyncSummary,
};
use fieldpack_model::{Layer, Project};
use fieldpack_package::{LayerEntry, Package};
use fieldpack_storage::{
    BaseFeature, ConnectorRegistry, Container, ContainerLayer, ContainerRow, FeatureSource,
    Mutation, Snapshot, SourceBinding, StorageError,
};
use fieldpack_types::{
    CancelToken, Feature, FeatureKey, Value, feature_digest, geometry_digest, value_digest,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Sentinel returned from a scan callback; the real cause is kept aside.
fn stopped() -> StorageError {
    StorageError::InvalidData("scan stopped".into())
}

/// Changes collected for one layer before they are committed.
#[derive(Default)]
struct Changes {
    source: Vec<Mutation>,
    /// Container row behind each source insert, when the row has no key yet.
    insert_rows: Vec<Option<i64>>,
    package: Vec<Mutation>,
    conflicts: Vec<ConflictRecord>,
    /// Keys whose source feature now belongs to this package.
    adopted: Vec<FeatureKey>,
}

impl Changes {
    fn to_source(&mut self, mutation: Mutation, fid: Option<i64>) {
        if mutation.is_noop() {
            return;
        }
        if matches!(mutation, Mutation::Insert { .. }) {
            self.insert_rows.push(fid);
        }
        self.source.push(mutation);
    }

    fn to_package(&mut self, mutation: Mutation) {
        if !mutation.is_noop() {
            self.package.push(mutation);
        }
    }

    fn applied(&self) -> Applied {
        let mut applied = Applied::default();
        for mutation in &self.source {
            match mutation {
                Mutation::Insert { .. } => applied.inserted += 1,
                Mutation::Update { .. } => applied.updated += 1,
                Mutation::Delete { .. } => applied.deleted += 1,
            }
        }
        applied
    }
}

/// Base state for a feature the snapshot never saw.
fn as_base(feature: &Feature) -> BaseFeature {
    BaseFeature {
        key: feature.key.clone().unwrap_or_else(|| FeatureKey::new("")),
        digest: feature_digest(feature),
        geometry_digest: geometry_digest(feature.geometry.as_ref()),
        field_digests: feature
            .attributes
            .iter()
            .map(|(name, value)| (name.clone(), value_digest(value)))
            .collect(),
        feature: feature.clone(),
    }
}

fn by_key(features: Vec<Feature>) -> HashMap<FeatureKey, Feature> {
    features
        .into_iter()
        .filter_map(|f| f.key.clone().map(|k| (k, f)))
        .collect()
}

/// One layer being compared.
struct LayerScan<'a> {
    table: ContainerLayer,
    snapshot: &'a Snapshot,
    source: Box<dyn FeatureSource>,
    mapper: AttachmentMapper<'a>,
    policy: ConflictPolicy,
    /// Keys earlier syncs of this package put into the source.
    synced: HashSet<FeatureKey>,
    changes: Changes,
}

impl LayerScan<'_> {
    /// Pass one: a batch of container rows.
    fn compare_rows(&mut self, rows: Vec<ContainerRow>) -> SyncResult<()> {
        let mut keyed = Vec::with_capacity(rows.len());
        for ContainerRow { fid, mut feature } in rows {
            self.mapper.to_source(&mut feature);
            match feature.key.clone() {
                Some(key) => keyed.push((key, feature)),
                None => self.changes.to_source(Mutation::Insert { feature }, Some(fid)),
            }
        }
        if keyed.is_empty() {
            return Ok(());
        }

        let keys: Vec<FeatureKey> = keyed.iter().map(|(k, _)| k.clone()).collect();
        let bases = self.snapshot.fetch(&self.table.layer_id, &keys)?;
        let mut remotes = by_key(self.source.fetch(&keys)?);

        for (key, local) in keyed {
            match (bases.get(&key), remotes.remove(&key)) {
                (Some(base), Some(remote)) => self.diff_feature(&local, base, &remote)?,
                (None, Some(remote)) if self.synced.contains(&key) => {
                    debug!("Feature {} was added by an earlier sync", key);
                    self.diff_feature(&local, &as_base(&remote), &remote)?;
                }
                (None, Some(remote)) => {
                    warn!("Feature {} was added offline under a key the source already uses", key);
                    let record = ConflictRecord::new(
                        self.table.layer_id.clone(),
                        key,
                        ConflictTarget::KeyCollision,
                        Value::Null,
                        feature_value(&local)?,
                        feature_value(&remote)?,
                    );
                    self.conflict(record)?;
                }
                (None, None) => self.changes.to_source(Mutation::Insert { feature: local }, None),
                (Some(base), None) if feature_digest(&local) == base.digest => {
                    debug!("Feature {} was deleted at the source", key);
                    self.changes.to_package(Mutation::Delete { key });
                }
                (Some(base), None) => {
                    let record = ConflictRecord::new(
                        self.table.layer_id.clone(),
                        key,
                        ConflictTarget::DeletedRemotely,
                        feature_value(&base.feature)?,
                        feature_value(&local)?,
                        Value::Null,
                    );
                    self.conflict(record)?;
                }
            }
        }
        Ok(())
    }

    /// Field-by-field three-way diff of one keyed feature.
    fn diff_feature(&mut self, local: &Feature, base: &BaseFeature, remote: &Feature) -> SyncResult<()> {
        let Some(key) = local.key.clone() else {
            return Ok(());
        };
        let mut attributes = BTreeMap::new();
        let mut conflicts = Vec::new();

        for field in &self.table.fields {
            let name = &field.name;
            if self.table.key_field.as_ref() == Some(name) {
                continue;
            }
            let local_value = local.attribute(name);
            let remote_value = remote.attribute(name);
            let state = classify(
                &base.field_digest(name),
                &value_digest(local_value),
                &value_digest(remote_value),
            );
            match state {
                FieldState::Conflicted => conflicts.push(ConflictRecord::new(
                    self.table.layer_id.clone(),
                    key.clone(),
                    ConflictTarget::Field(name.clone()),
                    base.feature.attribute(name).clone(),
                    local_value.clone(),
                    remote_value.clone(),
                )),
                state if state.needs_apply() => {
                    attributes.insert(name.clone(), local_value.clone());
                }
                _ => {}
            }
        }

        let mut geometry = None;
        if self.table.geometry_column.is_some() {
            let state = classify(
                &base.geometry_digest,
                &geometry_digest(local.geometry.as_ref()),
                &geometry_digest(remote.geometry.as_ref()),
            );
            match state {
                FieldState::Conflicted => conflicts.push(ConflictRecord::new(
                    self.table.layer_id.clone(),
                    key.clone(),
                    ConflictTarget::Geometry,
                    geometry_value(base.feature.geometry.as_ref()),
                    geometry_value(local.geometry.as_ref()),
                    geometry_value(remote.geometry.as_ref()),
                )),
                state if state.needs_apply() => geometry = Some(local.geometry.clone()),
                _ => {}
            }
        }

        self.changes.to_source(
            Mutation::Update {
                key,
                attributes,
                geometry,
            },
            None,
        );
        for record in conflicts {
            self.conflict(record)?;
        }
        Ok(())
    }

    /// Pass two: base keys that may have been deleted offline.
    fn find_deletions(&mut self, container: &Container, keys: &[FeatureKey]) -> SyncResult<()> {
        let present = container.keys_present(&self.table, keys)?;
        let missing: Vec<FeatureKey> = keys.iter().filter(|k| !present.contains(*k)).cloned().collect();
        if missing.is_empty() {
            return Ok(());
        }
        let bases = self.snapshot.fetch(&self.table.layer_id, &missing)?;
        let mut remotes = by_key(self.source.fetch(&missing)?);

        for key in missing {
            let Some(base) = bases.get(&key) else {
                continue;
            };
            let Some(remote) = remotes.remove(&key) else {
                debug!("Feature {} is gone on both sides", key);
                continue;
            };
            if feature_digest(&remote) == base.digest {
                self.changes.to_source(Mutation::Delete { key }, None);
            } else {
                let record = ConflictRecord::new(
                    self.table.layer_id.clone(),
                    key,
                    ConflictTarget::DeletedLocally,
                    feature_value(&base.feature)?,
                    Value::Null,
                    feature_value(&remote)?,
                );
                self.conflict(record)?;
            }
        }
        Ok(())
    }

    /// Records a conflict, settling it right away when a policy decides.
    fn conflict(&mut self, mut record: ConflictRecord) -> SyncResult<()> {
        if let Some(decision) = self.policy.decision() {
            let resolved = resolve(&record, &decision)?;
            if let Some(mutation) = resolved.source {
                self.changes.to_source(mutation, None);
            }
            if let Some(mutation) = resolved.package {
                self.changes.to_package(mutation);
            }
            if record.target == ConflictTarget::KeyCollision {
                self.changes.adopted.push(record.key.clone());
            }
            record.decision = Some(decision);
            record.state = ResolutionState::AutoResolved;
        } else {
            debug!(
                "Conflict on {} of feature {} in layer {}",
                record.target, record.key, record.layer_id
            );
        }
        self.changes.conflicts.push(record);
        Ok(())
    }
}

/// Maps attachment values of a package-bound mutation to package paths.
fn for_package(mapper: &AttachmentMapper<'_>, mutation: Mutation) -> Mutation {
    match mutation {
        Mutation::Insert { mut feature } => {
            mapper.to_package(&mut feature.attributes);
            Mutation::Insert { feature }
        }
        Mutation::Update {
            key,
            mut attributes,
            geometry,
        } => {
            mapper.to_package(&mut attributes);
            Mutation::Update {
                key,
                attributes,
                geometry,
            }
        }
        delete @ Mutation::Delete { .. } => delete,
    }
}

/// Synchronizes returned packages with their project's sources.
pub struct Synchronizer {
    config: SyncConfig,
    registry: ConnectorRegistry,
}

impl Synchronizer {
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            registry: ConnectorRegistry::with_defaults(),
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: ConnectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Synchronizes every editable layer of `package` into `project`'s
    /// sources.
    ///
    /// Layer failures are reported in the summary and never stop other
    /// layers. A corrupt package or a cancellation ends the run; layers
    /// committed before that stay committed.
    pub fn sync(&self, package: &Package, project: &Project, cancel: &CancelToken) -> SyncResult<SyncSummary> {
        let manifest = package.manifest();
        info!("Synchronizing package {} ({})", manifest.title, manifest.package_id);
        let snapshot = package.open_snapshot()?;
        let mut report = ConflictReport::new(manifest.package_id);
        let mut layers = Vec::with_capacity(manifest.layers.len());

        for entry in &manifest.layers {
            if cancel.is_cancelled() {
                warn!("Synchronization cancelled before layer {}", entry.id);
                return Err(SyncError::Cancelled);
            }
            let outcome = if !entry.packaged_as.has_container() {
                LayerSyncOutcome::Skipped("no packaged features".into())
            } else if !entry.offline.editable {
                LayerSyncOutcome::Skipped("not editable offline".into())
            } else {
                match self.sync_layer(package, entry, project, &snapshot, cancel) {
                    Ok(Some((applied, records))) => {
                        let conflicts = records.iter().filter(|r| r.is_unresolved()).count();
                        for record in records {
                            report.push(record);
                        }
                        if conflicts > 0 {
                            LayerSyncOutcome::Conflicted { applied, conflicts }
                        } else {
                            LayerSyncOutcome::Synced(applied)
                        }
                    }
                    Ok(None) => LayerSyncOutcome::Skipped("source is read-only".into()),
                    Err(e) if e.is_structural() => return Err(e),
                    Err(e) => {
                        error!("Layer {} could not be synchronized: {}", entry.id, e);
                        LayerSyncOutcome::Failed(e.to_string())
                    }
                }
            };
            info!("Layer {}: {}", entry.id, outcome);
            layers.push(LayerSyncReport {
                layer_id: entry.id.clone(),
                name: entry.name.clone(),
                outcome,
            });
        }

        if self.config.write_report {
            report.save(&package.root().join(CONFLICTS_FILE))?;
        }
        Ok(SyncSummary { layers, report })
    }

    /// Compares and commits one layer. `None` when the source does not
    /// accept writes.
    fn sync_layer(
        &self,
        package: &Package,
        entry: &LayerEntry,
        project: &Project,
        snapshot: &Snapshot,
        cancel: &CancelToken,
    ) -> SyncResult<Option<(Applied, Vec<ConflictRecord>)>> {
        let layer = project
            .layer(&entry.id)
            .ok_or_else(|| SyncError::UnknownLayer(entry.id.clone()))?;
        let (mut container, table) = package.open_container(entry)?;
        if table.key_field.is_none() {
            warn!("Layer {} has no key field and cannot be synchronized", entry.id);
            return Ok(None);
        }
        let source = self.open_source(layer, &table, &project.home)?;
        if !source.is_writable() {
            warn!("Source of layer {} does not accept writes", entry.id);
            return Ok(None);
        }

        let batch_size = self.config.batch_size();
        let synced = container.synced_keys(&table)?;
        let mut scan = LayerScan {
            table,
            snapshot,
            source,
            mapper: AttachmentMapper::new(package.manifest(), entry, package.root(), &project.home),
            policy: self.config.policy,
            synced,
            changes: Changes::default(),
        };

        let mut failure = None;
        let table = scan.table.clone();
        let scanned = container.read_batches(&table, batch_size, &mut |rows| {
            if cancel.is_cancelled() {
                failure = Some(SyncError::Cancelled);
                return Err(stopped());
            }
            scan.compare_rows(rows).map_err(|e| {
                failure = Some(e);
                stopped()
            })
        });
        if let Some(e) = failure.take() {
            return Err(e);
        }
        scanned?;

        let scanned = snapshot.read_keys(&entry.id, batch_size, &mut |keys| {
            if cancel.is_cancelled() {
                failure = Some(SyncError::Cancelled);
                return Err(stopped());
            }
            scan.find_deletions(&container, &keys).map_err(|e| {
                failure = Some(e);
                stopped()
            })
        });
        if let Some(e) = failure.take() {
            return Err(e);
        }
        scanned?;

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let LayerScan {
            table,
            mut source,
            mut mapper,
            mut changes,
            ..
        } = scan;
        let applied = changes.applied();
        if !changes.source.is_empty() {
            let keys = source.apply(&changes.source)?;
            info!("Committed {} to the source of layer {}", applied, entry.id);
            let assignments: Vec<(i64, FeatureKey)> = changes
                .insert_rows
                .iter()
                .zip(&keys)
                .filter_map(|(fid, key)| fid.map(|fid| (fid, key.clone())))
                .collect();
            if !assignments.is_empty() {
                container.assign_keys(&table, &assignments)?;
            }
            changes.adopted.extend(keys);
        }
        if !changes.adopted.is_empty() {
            container.mark_synced(&table, &changes.adopted)?;
        }
        if !changes.package.is_empty() {
            let mutations: Vec<Mutation> = changes
                .package
                .into_iter()
                .map(|m| for_package(&mapper, m))
                .collect();
            container.apply(&table, &mutations)?;
            debug!("Mirrored {} changes into the package for layer {}", mutations.len(), entry.id);
        }
        let imported = mapper.import_captures()?;
        if imported > 0 {
            debug!("Imported {} captured attachments for layer {}", imported, entry.id);
        }
        Ok(Some((applied, changes.conflicts)))
    }

    fn open_source(&self, layer: &Layer, table: &ContainerLayer, home: &Path) -> SyncResult<Box<dyn FeatureSource>> {
        let binding = SourceBinding::new(layer.id.clone(), layer.source.clone(), home)
            .with_fields(table.fields.clone())
            .with_key(table.key_field.clone())
            .with_spatial(table.geometry_column.is_some())
            .with_timeout(self.config.timeout());
        Ok(self.registry.open(binding)?)
    }

    /// Applies decided records of `report` and returns what is left.
    ///
    /// Records decided by hand are resolved layer by layer, each layer in
    /// one batch. Records of a layer whose batch fails stay in the report
    /// together with everything still undecided; the rest are dropped.
    pub fn apply_resolutions(
        &self,
        package: &Package,
        project: &Project,
        mut report: ConflictReport,
    ) -> SyncResult<SyncSummary> {
        let manifest = package.manifest();
        if report.package_id != manifest.package_id {
            return Err(SyncError::ForeignReport(manifest.package_id.to_string()));
        }
        let mut applied_ids = HashSet::new();
        let mut layers = Vec::new();

        for entry in &manifest.layers {
            let records: Vec<&ConflictRecord> = report
                .records
                .iter()
                .filter(|r| r.layer_id == entry.id && r.state == ResolutionState::ManuallyResolved)
                .collect();
            if records.is_empty() {
                continue;
            }
            let outcome = match self.resolve_layer(package, entry, project, &records) {
                Ok(applied) => {
                    applied_ids.extend(records.iter().map(|r| r.id));
                    LayerSyncOutcome::Synced(applied)
                }
                Err(e) if e.is_structural() => return Err(e),
                Err(e) => {
                    error!("Resolutions for layer {} could not be applied: {}", entry.id, e);
                    LayerSyncOutcome::Failed(e.to_string())
                }
            };
            info!("Layer {}: {}", entry.id, outcome);
            layers.push(LayerSyncReport {
                layer_id: entry.id.clone(),
                name: entry.name.clone(),
                outcome,
            });
        }

        report.records = report
            .pending()
            .filter(|r| !applied_ids.contains(&r.id))
            .cloned()
            .collect();
        info!("{} conflicts remain after applying resolutions", report.records.len());
        if self.config.write_report {
            report.save(&package.root().join(CONFLICTS_FILE))?;
        }
        Ok(SyncSummary { layers, report })
    }

    fn resolve_layer(
        &self,
        package: &Package,
        entry: &LayerEntry,
        project: &Project,
        records: &[&ConflictRecord],
    ) -> SyncResult<Applied> {
        let layer = project
            .layer(&entry.id)
            .ok_or_else(|| SyncError::UnknownLayer(entry.id.clone()))?;
        let (mut container, table) = package.open_container(entry)?;
        let mapper = AttachmentMapper::new(package.manifest(), entry, package.root(), &project.home);

        let mut changes = Changes::default();
        for record in records {
            let Some(decision) = &record.decision else {
                continue;
            };
            debug!("Applying {} to conflict {} ({})", decision_name(decision), record.id, record.target);
            let resolved = resolve(record, decision)?;
            if let Some(mutation) = resolved.source {
                changes.to_source(mutation, None);
            }
            if let Some(mutation) = resolved.package {
                changes.to_package(mutation);
            }
            if record.target == ConflictTarget::KeyCollision {
                changes.adopted.push(record.key.clone());
            }
        }

        let applied = changes.applied();
        if !changes.source.is_empty() {
            let mut source = self.open_source(layer, &table, &project.home)?;
            if !source.is_writable() {
                return Err(StorageError::ReadOnly(format!("source of layer {}", entry.id)).into());
            }
            let keys = source.apply(&changes.source)?;
            changes.adopted.extend(keys);
        }
        if !changes.adopted.is_empty() {
            container.mark_synced(&table, &changes.adopted)?;
        }
        if !changes.package.is_empty() {
            let mutations: Vec<Mutation> = changes
                .package
                .into_iter()
                .map(|m| for_package(&mapper, m))
                .collect();
            container.apply(&table, &mutations)?;
        }
        Ok(applied)
    }
}

fn decision_name(decision: &Decision) -> &'static str {
    match decision {
        Decision::KeepLocal => "keep-local",
        Decision::KeepRemote => "keep-remote",
        Decision::Overwrite(_) => "overwrite",
    }
}
