//! Conflict records and their resolution.
//!
//! [`resolve`] is a pure function: given a record and a decision it returns
//! the change to make at the source and the change to make in the package
//! so both end up holding the chosen value. How the decision is obtained
//! (a policy, a person, a script) is up to the caller.

use crate::error::{SyncError, SyncResult};
use fieldpack_storage::Mutation;
use fieldpack_types::{Feature, FeatureKey, Geometry, LayerId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// What a conflict is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "field", rename_all = "snake_case")]
pub enum ConflictTarget {
    /// One attribute, edited on both sides.
    Field(String),
    /// The geometry, edited on both sides.
    Geometry,
    /// Deleted offline, modified at the source.
    DeletedLocally,
    /// Deleted at the source, modified offline.
    DeletedRemotely,
    /// Added offline under a key the source gave to a different feature
    /// in the meantime.
    KeyCollision,
}

impl ConflictTarget {
    const fn is_feature(&self) -> bool {
        matches!(self, Self::DeletedLocally | Self::DeletedRemotely | Self::KeyCollision)
    }
}

impl fmt::Display for ConflictTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Geometry => f.write_str("geometry"),
            Self::DeletedLocally => f.write_str("(deleted offline)"),
            Self::DeletedRemotely => f.write_str("(deleted at source)"),
            Self::KeyCollision => f.write_str("(key taken at source)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionState {
    /// Waiting for a decision.
    #[default]
    Unresolved,
    /// Decided by the configured policy and already applied.
    AutoResolved,
    /// Decided externally; applied by the next resolution pass.
    ManuallyResolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "value", rename_all = "snake_case")]
pub enum Decision {
    KeepLocal,
    KeepRemote,
    /// Write this value on both sides. For deletion conflicts the value is
    /// a whole feature, or `Null` to delete it everywhere.
    Overwrite(Value),
}

/// How conflicts are decided during a sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Leave every conflict for an external decision.
    #[default]
    Manual,
    PreferLocal,
    PreferRemote,
}

impl ConflictPolicy {
    #[must_use]
    pub const fn decision(self) -> Option<Decision> {
        match self {
            Self::Manual => None,
            Self::PreferLocal => Some(Decision::KeepLocal),
            Self::PreferRemote => Some(Decision::KeepRemote),
        }
    }
}

/// One conflicting change, with everything needed to decide it.
///
/// Field conflicts carry plain values; the geometry travels as its GeoJSON
/// in a `Json` value. Deletion conflicts carry whole features, with `Null`
/// on the side that deleted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Position in the report; assigned when the record is added.
    #[serde(default)]
    pub id: u64,
    pub layer_id: LayerId,
    pub key: FeatureKey,
    pub target: ConflictTarget,
    pub base: Value,
    pub local: Value,
    pub remote: Value,
    #[serde(default)]
    pub state: ResolutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

impl ConflictRecord {
    pub fn new(
        layer_id: LayerId,
        key: FeatureKey,
        target: ConflictTarget,
        base: Value,
        local: Value,
        remote: Value,
    ) -> Self {
        Self {
            id: 0,
            layer_id,
            key,
            target,
            base,
            local,
            remote,
            state: ResolutionState::Unresolved,
            decision: None,
        }
    }

    /// Records an external decision.
    pub fn decide(&mut self, decision: Decision) {
        self.decision = Some(decision);
        self.state = ResolutionState::ManuallyResolved;
    }

    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        self.state == ResolutionState::Unresolved
    }
}

/// The two writes that settle a conflict. `None` means that side already
/// holds the chosen value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolved {
    pub source: Option<Mutation>,
    pub package: Option<Mutation>,
}

/// A feature as a conflict value.
pub fn feature_value(feature: &Feature) -> SyncResult<Value> {
    let mut feature = feature.clone();
    feature.key = None;
    Ok(Value::Json(serde_json::to_value(&feature)?))
}

fn value_feature(key: &FeatureKey, value: &Value) -> SyncResult<Option<Feature>> {
    match value {
        Value::Null => Ok(None),
        Value::Json(json) => {
            let mut feature: Feature = serde_json::from_value(json.clone())?;
            feature.key = Some(key.clone());
            Ok(Some(feature))
        }
        other => Err(SyncError::InvalidResolution(format!(
            "{other} is not a feature"
        ))),
    }
}

/// A geometry as a conflict value.
#[must_use]
pub fn geometry_value(geometry: Option<&Geometry>) -> Value {
    geometry.map_or(Value::Null, |g| Value::Json(g.as_geojson().clone()))
}

fn value_geometry(value: &Value) -> SyncResult<Option<Geometry>> {
    match value {
        Value::Null => Ok(None),
        Value::Json(json) => Ok(Some(Geometry::from_geojson(json.clone())?)),
        Value::Text(text) => Ok(Some(Geometry::parse(text)?)),
        other => Err(SyncError::InvalidResolution(format!(
            "{other} is not a geometry"
        ))),
    }
}

fn chosen<'a>(record: &'a ConflictRecord, decision: &'a Decision) -> &'a Value {
    match decision {
        Decision::KeepLocal => &record.local,
        Decision::KeepRemote => &record.remote,
        Decision::Overwrite(value) => value,
    }
}

/// Brings one side of a feature conflict to the chosen feature.
fn settle_feature(key: &FeatureKey, current: Option<Feature>, chosen: Option<&Feature>) -> Option<Mutation> {
    match (current, chosen) {
        (None, None) => None,
        (Some(_), None) => Some(Mutation::Delete { key: key.clone() }),
        (None, Some(f)) => Some(Mutation::Insert { feature: f.clone() }),
        (Some(c), Some(f)) if c.attributes == f.attributes && c.geometry == f.geometry => None,
        (Some(_), Some(f)) => Some(Mutation::Update {
            key: key.clone(),
            attributes: f.attributes.clone(),
            geometry: Some(f.geometry.clone()),
        }),
    }
}

/// Brings one side of a field conflict to the chosen value.
fn settle_field(record: &ConflictRecord, current: &Value, chosen: &Value) -> SyncResult<Option<Mutation>> {
    if current == chosen {
        return Ok(None);
    }
    let key = record.key.clone();
    Ok(Some(match &record.target {
        ConflictTarget::Field(name) => Mutation::Update {
            key,
            attributes: BTreeMap::from([(name.clone(), chosen.clone())]),
            geometry: None,
        },
        _ => Mutation::Update {
            key,
            attributes: BTreeMap::new(),
            geometry: Some(value_geometry(chosen)?),
        },
    }))
}

/// Turns a decided conflict into the writes that apply it.
pub fn resolve(record: &ConflictRecord, decision: &Decision) -> SyncResult<Resolved> {
    let chosen = chosen(record, decision);
    if record.target.is_feature() {
        let key = &record.key;
        let target = value_feature(key, chosen)?;
        return Ok(Resolved {
            source: settle_feature(key, value_feature(key, &record.remote)?, target.as_ref()),
            package: settle_feature(key, value_feature(key, &record.local)?, target.as_ref()),
        });
    }
    Ok(Resolved {
        source: settle_field(record, &record.remote, chosen)?,
        package: settle_field(record, &record.local, chosen)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field_conflict() -> ConflictRecord {
        ConflictRecord::new(
            LayerId::new("trees"),
            FeatureKey::from(7),
            ConflictTarget::Field("species".into()),
            Value::from("oak"),
            Value::from("elm"),
            Value::from("ash"),
        )
    }

    fn species(key: i64, value: &str) -> Mutation {
        Mutation::Update {
            key: FeatureKey::from(key),
            attributes: BTreeMap::from([("species".to_string(), Value::from(value))]),
            geometry: None,
        }
    }

    #[test]
    fn keep_local_writes_the_source_only() {
        let resolved = resolve(&field_conflict(), &Decision::KeepLocal).unwrap();
        assert_eq!(resolved.source, Some(species(7, "elm")));
        assert_eq!(resolved.package, None);
    }

    #[test]
    fn keep_remote_writes_the_package_only() {
        let resolved = resolve(&field_conflict(), &Decision::KeepRemote).unwrap();
        assert_eq!(resolved.source, None);
        assert_eq!(resolved.package, Some(species(7, "ash")));
    }

    #[test]
    fn overwrite_writes_both_sides() {
        let resolved = resolve(&field_conflict(), &Decision::Overwrite(Value::from("birch"))).unwrap();
        assert_eq!(resolved.source, Some(species(7, "birch")));
        assert_eq!(resolved.package, Some(species(7, "birch")));
    }

    #[test]
    fn geometry_conflict_sets_geometry() {
        let record = ConflictRecord::new(
            LayerId::new("trees"),
            FeatureKey::from(1),
            ConflictTarget::Geometry,
            geometry_value(Some(&Geometry::point(0.0, 0.0))),
            geometry_value(Some(&Geometry::point(1.0, 1.0))),
            geometry_value(None),
        );
        let resolved = resolve(&record, &Decision::KeepLocal).unwrap();
        let Some(Mutation::Update { geometry, attributes, .. }) = resolved.source else {
            panic!("expected an update");
        };
        assert!(attributes.is_empty());
        assert_eq!(geometry, Some(Some(Geometry::point(1.0, 1.0))));

        let resolved = resolve(&record, &Decision::KeepRemote).unwrap();
        let Some(Mutation::Update { geometry, .. }) = resolved.package else {
            panic!("expected an update");
        };
        assert_eq!(geometry, Some(None));
    }

    #[test]
    fn offline_deletion_conflict() {
        let key = FeatureKey::from(3);
        let remote = Feature::new(None).with_attribute("species", "ash");
        let record = ConflictRecord::new(
            LayerId::new("trees"),
            key.clone(),
            ConflictTarget::DeletedLocally,
            feature_value(&Feature::new(None).with_attribute("species", "oak")).unwrap(),
            Value::Null,
            feature_value(&remote).unwrap(),
        );

        let keep_local = resolve(&record, &Decision::KeepLocal).unwrap();
        assert_eq!(keep_local.source, Some(Mutation::Delete { key: key.clone() }));
        assert_eq!(keep_local.package, None);

        let keep_remote = resolve(&record, &Decision::KeepRemote).unwrap();
        assert_eq!(keep_remote.source, None);
        let Some(Mutation::Insert { feature }) = keep_remote.package else {
            panic!("expected an insert");
        };
        assert_eq!(feature.key, Some(key));
        assert_eq!(feature.attribute("species"), &Value::from("ash"));
    }

    #[test]
    fn source_deletion_conflict_can_restore_the_feature() {
        let key = FeatureKey::from(4);
        let local = Feature::new(None).with_attribute("species", "elm");
        let record = ConflictRecord::new(
            LayerId::new("trees"),
            key.clone(),
            ConflictTarget::DeletedRemotely,
            feature_value(&Feature::new(None).with_attribute("species", "oak")).unwrap(),
            feature_value(&local).unwrap(),
            Value::Null,
        );
        let resolved = resolve(&record, &Decision::KeepLocal).unwrap();
        assert!(matches!(resolved.source, Some(Mutation::Insert { .. })));
        assert_eq!(resolved.package, None);

        let resolved = resolve(&record, &Decision::Overwrite(Value::Null)).unwrap();
        assert_eq!(resolved.source, None);
        assert_eq!(resolved.package, Some(Mutation::Delete { key }));
    }

    #[test]
    fn key_collision_settles_whole_features() {
        let key = FeatureKey::from(2);
        let local = Feature::new(None).with_attribute("species", "elm");
        let remote = Feature::new(None).with_attribute("species", "ash");
        let record = ConflictRecord::new(
            LayerId::new("trees"),
            key.clone(),
            ConflictTarget::KeyCollision,
            Value::Null,
            feature_value(&local).unwrap(),
            feature_value(&remote).unwrap(),
        );

        let keep_remote = resolve(&record, &Decision::KeepRemote).unwrap();
        assert_eq!(keep_remote.source, None);
        let Some(Mutation::Update { key: updated, attributes, .. }) = keep_remote.package else {
            panic!("expected an update");
        };
        assert_eq!(updated, key);
        assert_eq!(attributes["species"], Value::from("ash"));

        let keep_local = resolve(&record, &Decision::KeepLocal).unwrap();
        assert!(matches!(keep_local.source, Some(Mutation::Update { .. })));
        assert_eq!(keep_local.package, None);
    }

    #[test]
    fn text_is_not_a_feature() {
        let mut record = field_conflict();
        record.target = ConflictTarget::DeletedLocally;
        record.remote = Value::Null;
        record.local = Value::Null;
        let err = resolve(&record, &Decision::Overwrite(Value::from("nope"))).unwrap_err();
        assert!(matches!(err, SyncError::InvalidResolution(_)));
    }

    #[test]
    fn policies_map_to_decisions() {
        assert_eq!(ConflictPolicy::Manual.decision(), None);
        assert_eq!(ConflictPolicy::PreferLocal.decision(), Some(Decision::KeepLocal));
        assert_eq!(ConflictPolicy::PreferRemote.decision(), Some(Decision::KeepRemote));
    }
}
