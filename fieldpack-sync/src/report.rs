//! Conflict report and per-layer outcomes.

use crate::conflict::{ConflictRecord, Decision, ResolutionState};
use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use fieldpack_storage::write_atomic;
use fieldpack_types::{LayerId, PackageId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// File name of the conflict report inside a package root.
pub const CONFLICTS_FILE: &str = "conflicts.json";

/// Ordered conflict records of one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub package_id: PackageId,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<ConflictRecord>,
}

impl ConflictReport {
    #[must_use]
    pub fn new(package_id: PackageId) -> Self {
        Self {
            package_id,
            generated_at: Utc::now(),
            records: Vec::new(),
        }
    }

    /// Appends a record, numbering it after the last one.
    pub fn push(&mut self, mut record: ConflictRecord) {
        record.id = self.records.last().map_or(1, |r| r.id + 1);
        self.records.push(record);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.records.iter().filter(|r| r.is_unresolved())
    }

    /// Records still waiting for a decision or for being applied.
    pub fn pending(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.records
            .iter()
            .filter(|r| r.state != ResolutionState::AutoResolved)
    }

    /// Decides one record by id.
    pub fn decide(&mut self, id: u64, decision: Decision) -> SyncResult<()> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| SyncError::InvalidResolution(format!("no conflict with id {id}")))?;
        record.decide(decision);
        Ok(())
    }

    /// Decides every record that is still unresolved. Returns how many.
    pub fn decide_all(&mut self, decision: &Decision) -> usize {
        let mut decided = 0;
        for record in self.records.iter_mut().filter(|r| r.is_unresolved()) {
            record.decide(decision.clone());
            decided += 1;
        }
        decided
    }

    pub fn load(path: &Path) -> SyncResult<Self> {
        let bytes = std::fs::read(path)?;
        let report: Self = serde_json::from_slice(&bytes)?;
        debug!("Loaded {} conflict records from {:?}", report.records.len(), path);
        Ok(report)
    }

    pub fn save(&self, path: &Path) -> SyncResult<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)?;
        info!("Wrote {} conflict records to {:?}", self.records.len(), path);
        Ok(())
    }
}

/// Mutations committed to one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl Applied {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}

impl fmt::Display for Applied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} inserted, {} updated, {} deleted",
            self.inserted, self.updated, self.deleted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSyncOutcome {
    Synced(Applied),
    /// Non-conflicting changes were applied; `conflicts` records wait for a
    /// decision.
    Conflicted { applied: Applied, conflicts: usize },
    /// Not synchronized, by design (read-only layer, linked basemap).
    Skipped(String),
    /// Nothing was written to the source.
    Failed(String),
}

impl fmt::Display for LayerSyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synced(applied) => write!(f, "synced ({applied})"),
            Self::Conflicted { applied, conflicts } => {
                write!(f, "conflicted ({conflicts} conflicts; {applied})")
            }
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerSyncReport {
    pub layer_id: LayerId,
    pub name: String,
    pub outcome: LayerSyncOutcome,
}

/// Result of a synchronization or resolution run.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    pub layers: Vec<LayerSyncReport>,
    pub report: ConflictReport,
}

impl SyncSummary {
    #[must_use]
    pub fn layer(&self, id: &LayerId) -> Option<&LayerSyncReport> {
        self.layers.iter().find(|r| &r.layer_id == id)
    }

    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.layers
            .iter()
            .any(|r| matches!(r.outcome, LayerSyncOutcome::Failed(_)))
    }

    /// Total mutations committed across layers.
    #[must_use]
    pub fn applied(&self) -> Applied {
        self.layers.iter().fold(Applied::default(), |mut total, r| {
            if let LayerSyncOutcome::Synced(a) | LayerSyncOutcome::Conflicted { applied: a, .. } = &r.outcome {
                total.inserted += a.inserted;
                total.updated += a.updated;
                total.deleted += a.deleted;
            }
            total
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictTarget;
    use fieldpack_types::{FeatureKey, Value};
    use pretty_assertions::assert_eq;

    fn record(field: &str) -> ConflictRecord {
        ConflictRecord::new(
            LayerId::new("trees"),
            FeatureKey::from(1),
            ConflictTarget::Field(field.into()),
            Value::from(1i64),
            Value::from(2i64),
            Value::from(3i64),
        )
    }

    #[test]
    fn records_are_numbered_in_order() {
        let mut report = ConflictReport::new(PackageId::new());
        report.push(record("a"));
        report.push(record("b"));
        let ids: Vec<u64> = report.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn report_survives_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFLICTS_FILE);
        let mut report = ConflictReport::new(PackageId::new());
        report.push(record("height"));
        report.decide(1, Decision::Overwrite(Value::from(2.5))).unwrap();
        report.save(&path).unwrap();

        let loaded = ConflictReport::load(&path).unwrap();
        assert_eq!(loaded, report);
        assert_eq!(loaded.records[0].state, ResolutionState::ManuallyResolved);
        assert_eq!(loaded.unresolved().count(), 0);
    }

    #[test]
    fn decide_all_skips_decided_records() {
        let mut report = ConflictReport::new(PackageId::new());
        report.push(record("a"));
        report.push(record("b"));
        report.decide(2, Decision::KeepRemote).unwrap();
        assert_eq!(report.decide_all(&Decision::KeepLocal), 1);
        assert_eq!(report.records[1].decision, Some(Decision::KeepRemote));
        assert!(report.decide(9, Decision::KeepLocal).is_err());
    }
}
