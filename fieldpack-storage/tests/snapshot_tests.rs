use fieldpack_storage::{Snapshot, StorageError};
use fieldpack_types::{Feature, FeatureKey, Geometry, LayerId, Value, value_digest};
use pretty_assertions::assert_eq;

fn make_feature(key: i64, name: &str) -> Feature {
    Feature::new(Some(FeatureKey::from(key)))
        .with_attribute("name", name)
        .with_attribute("count", key)
        .with_geometry(Geometry::point(key as f64, 0.0))
}

// ── Recording ─────────────────────────────────────────────────────

#[test]
fn fetch_returns_recorded_values_and_digests() {
    let layer = LayerId::new("roads");
    let mut snap = Snapshot::open_in_memory().unwrap();
    snap.record(&layer, &[make_feature(1, "main"), make_feature(2, "side")])
        .unwrap();

    let found = snap
        .fetch(&layer, &[FeatureKey::from(2), FeatureKey::from(7)])
        .unwrap();
    assert_eq!(found.len(), 1);
    let base = &found[&FeatureKey::from(2)];
    assert_eq!(base.feature.attribute("name"), &Value::from("side"));
    assert_eq!(base.feature.geometry, Some(Geometry::point(2.0, 0.0)));
    assert_eq!(base.field_digest("name"), value_digest(&Value::from("side")));
    assert_eq!(base.field_digest("unknown"), value_digest(&Value::Null));
}

#[test]
fn features_without_key_are_rejected() {
    let mut snap = Snapshot::open_in_memory().unwrap();
    let result = snap.record(&LayerId::new("l"), &[Feature::new(None)]);
    assert!(matches!(result, Err(StorageError::InvalidData(_))));
}

#[test]
fn layers_are_isolated() {
    let mut snap = Snapshot::open_in_memory().unwrap();
    snap.record(&LayerId::new("a"), &[make_feature(1, "x")]).unwrap();
    assert_eq!(snap.count(&LayerId::new("a")).unwrap(), 1);
    assert_eq!(snap.count(&LayerId::new("b")).unwrap(), 0);
    assert!(snap.fetch(&LayerId::new("b"), &[FeatureKey::from(1)]).unwrap().is_empty());
}

// ── Immutability ──────────────────────────────────────────────────

#[test]
fn sealed_snapshot_rejects_writes() {
    let mut snap = Snapshot::open_in_memory().unwrap();
    snap.seal().unwrap();
    let result = snap.record(&LayerId::new("a"), &[make_feature(1, "x")]);
    assert!(matches!(result, Err(StorageError::ReadOnly(_))));
}

#[test]
fn reopened_snapshot_is_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.sqlite");
    let mut snap = Snapshot::create(&path).unwrap();
    snap.record(&LayerId::new("a"), &[make_feature(1, "x")]).unwrap();
    snap.seal().unwrap();
    drop(snap);

    let mut reopened = Snapshot::open(&path).unwrap();
    assert_eq!(reopened.count(&LayerId::new("a")).unwrap(), 1);
    assert!(reopened.record(&LayerId::new("a"), &[make_feature(2, "y")]).is_err());
}

// ── Streaming ─────────────────────────────────────────────────────

#[test]
fn read_keys_streams_in_batches() {
    let layer = LayerId::new("a");
    let mut snap = Snapshot::open_in_memory().unwrap();
    let features: Vec<_> = (1..=7).map(|i| make_feature(i, "x")).collect();
    snap.record(&layer, &features).unwrap();

    let mut batches = Vec::new();
    snap.read_keys(&layer, 3, &mut |keys| {
        batches.push(keys.len());
        Ok(())
    })
    .unwrap();
    assert_eq!(batches, vec![3, 3, 1]);
}
