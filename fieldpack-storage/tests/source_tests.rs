use fieldpack_model::{CsvOptions, DataSourceDescriptor, FileFormat, ServiceProtocol};
use fieldpack_storage::{
    ConnectorRegistry, FeatureSource, FieldSpec, Mutation, SourceBinding, StorageError,
};
use fieldpack_types::{Feature, FeatureKey, FieldType, Geometry, LayerId, Value};
use pretty_assertions::assert_eq;
use std::path::Path;
use tempfile::TempDir;

fn read_all(source: &mut dyn FeatureSource) -> Vec<Feature> {
    let mut all = Vec::new();
    source
        .read_batches(2, &mut |batch| {
            all.extend(batch);
            Ok(())
        })
        .unwrap();
    all
}

fn rename(key: i64, name: &str) -> Mutation {
    let Mutation::Update {
        key,
        mut attributes,
        geometry,
    } = Mutation::update(FeatureKey::from(key))
    else {
        unreachable!()
    };
    attributes.insert("name".into(), Value::from(name));
    Mutation::Update {
        key,
        attributes,
        geometry,
    }
}

fn names(features: &[Feature]) -> Vec<String> {
    features
        .iter()
        .map(|f| f.attribute("name").to_string())
        .collect()
}

// ── SQLite ────────────────────────────────────────────────────────

fn make_sqlite(dir: &Path) -> SourceBinding {
    let conn = rusqlite::Connection::open(dir.join("parcels.sqlite")).unwrap();
    conn.execute_batch(
        "CREATE TABLE parcels (id INTEGER PRIMARY KEY, name TEXT, area REAL, geom TEXT);
         INSERT INTO parcels VALUES (1, 'north', 10.5, '{\"type\":\"Point\",\"coordinates\":[1.0,2.0]}');
         INSERT INTO parcels VALUES (2, 'south', 20.0, NULL);
         INSERT INTO parcels VALUES (3, 'east', 30.0, NULL);",
    )
    .unwrap();
    SourceBinding::new(
        LayerId::new("parcels"),
        DataSourceDescriptor::Database {
            driver: "sqlite".into(),
            connection: "parcels.sqlite".into(),
            table: "parcels".into(),
            geometry_column: Some("geom".into()),
            filter: None,
        },
        dir,
    )
    .with_fields(vec![
        FieldSpec::new("id", FieldType::Integer),
        FieldSpec::new("name", FieldType::Text),
        FieldSpec::new("area", FieldType::Real),
    ])
    .with_key(Some("id".into()))
    .with_spatial(true)
}

#[test]
fn sqlite_reads_all_features_with_keys() {
    let dir = TempDir::new().unwrap();
    let binding = make_sqlite(dir.path());
    let mut source = ConnectorRegistry::with_defaults().open(binding).unwrap();
    let features = read_all(source.as_mut());
    assert_eq!(names(&features), vec!["north", "south", "east"]);
    assert_eq!(features[0].key, Some(FeatureKey::from(1)));
    assert_eq!(features[0].geometry, Some(Geometry::point(1.0, 2.0)));
    assert_eq!(features[1].geometry, None);
}

#[test]
fn sqlite_filter_limits_reads_but_not_fetch() {
    let dir = TempDir::new().unwrap();
    let mut binding = make_sqlite(dir.path());
    if let DataSourceDescriptor::Database { filter, .. } = &mut binding.descriptor {
        *filter = Some("area > 15".into());
    }
    let mut source = ConnectorRegistry::with_defaults().open(binding).unwrap();
    assert_eq!(names(&read_all(source.as_mut())), vec!["south", "east"]);
    let fetched = source.fetch(&[FeatureKey::from(1)]).unwrap();
    assert_eq!(names(&fetched), vec!["north"]);
}

#[test]
fn sqlite_apply_inserts_updates_and_deletes() {
    let dir = TempDir::new().unwrap();
    let binding = make_sqlite(dir.path());
    let mut source = ConnectorRegistry::with_defaults().open(binding).unwrap();
    let new = Feature::new(None).with_attribute("name", "west").with_attribute("area", 5.0);
    let inserted = source
        .apply(&[
            Mutation::Insert { feature: new },
            rename(1, "north-2"),
            Mutation::Delete {
                key: FeatureKey::from(3),
            },
        ])
        .unwrap();
    assert_eq!(inserted, vec![FeatureKey::from(4)]);
    assert_eq!(names(&read_all(source.as_mut())), vec!["north-2", "south", "west"]);
}

#[test]
fn sqlite_failed_batch_rolls_back() {
    let dir = TempDir::new().unwrap();
    let binding = make_sqlite(dir.path());
    let mut source = ConnectorRegistry::with_defaults().open(binding).unwrap();
    let result = source.apply(&[rename(1, "changed"), rename(42, "ghost")]);
    assert!(matches!(result, Err(StorageError::SourceWriteFailed(_))));
    assert_eq!(names(&read_all(source.as_mut())), vec!["north", "south", "east"]);
}

#[test]
fn sqlite_source_reports_missing_table() {
    let dir = TempDir::new().unwrap();
    let mut binding = make_sqlite(dir.path());
    if let DataSourceDescriptor::Database { table, .. } = &mut binding.descriptor {
        *table = "missing".into();
    }
    let result = ConnectorRegistry::with_defaults().probe(&binding);
    assert!(matches!(result, Err(StorageError::SourceUnavailable(_))));
}

// ── GeoJSON ───────────────────────────────────────────────────────

fn make_geojson(dir: &Path) -> SourceBinding {
    let doc = serde_json::json!({
        "type": "FeatureCollection",
        "name": "wells",
        "features": [
            {"type": "Feature", "id": 1, "properties": {"name": "a", "depth": 12, "note": "keep"},
             "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}},
            {"type": "Feature", "id": 2, "properties": {"name": "b", "depth": 8},
             "geometry": {"type": "Point", "coordinates": [1.0, 1.0]}}
        ]
    });
    std::fs::write(dir.join("wells.geojson"), serde_json::to_vec(&doc).unwrap()).unwrap();
    SourceBinding::new(
        LayerId::new("wells"),
        DataSourceDescriptor::LocalFile {
            path: "wells.geojson".into(),
            format: FileFormat::GeoJson,
            layer_name: None,
            csv: None,
        },
        dir,
    )
    .with_fields(vec![
        FieldSpec::new("id", FieldType::Integer),
        FieldSpec::new("name", FieldType::Text),
        FieldSpec::new("depth", FieldType::Integer),
    ])
    .with_key(Some("id".into()))
    .with_spatial(true)
}

#[test]
fn geojson_key_falls_back_to_id_member() {
    let dir = TempDir::new().unwrap();
    let mut source = ConnectorRegistry::with_defaults()
        .open(make_geojson(dir.path()))
        .unwrap();
    let features = read_all(source.as_mut());
    assert_eq!(features[1].key, Some(FeatureKey::from(2)));
    assert_eq!(features[1].attribute("depth"), &Value::Integer(8));
}

#[test]
fn geojson_apply_preserves_foreign_members() {
    let dir = TempDir::new().unwrap();
    let mut source = ConnectorRegistry::with_defaults()
        .open(make_geojson(dir.path()))
        .unwrap();
    let inserted = source
        .apply(&[
            rename(1, "a2"),
            Mutation::Delete {
                key: FeatureKey::from(2),
            },
            Mutation::Insert {
                feature: Feature::new(None)
                    .with_attribute("name", "c")
                    .with_geometry(Geometry::point(3.0, 3.0)),
            },
        ])
        .unwrap();
    assert_eq!(inserted, vec![FeatureKey::from(3)]);
    assert_eq!(names(&read_all(source.as_mut())), vec!["a2", "c"]);

    let raw: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("wells.geojson")).unwrap()).unwrap();
    assert_eq!(raw["name"], "wells");
    assert_eq!(raw["features"][0]["properties"]["note"], "keep");
}

#[test]
fn geojson_failed_batch_leaves_file_untouched() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wells.geojson");
    let mut source = ConnectorRegistry::with_defaults()
        .open(make_geojson(dir.path()))
        .unwrap();
    let before = std::fs::read(&path).unwrap();
    let result = source.apply(&[rename(1, "x"), rename(9, "y")]);
    assert!(matches!(result, Err(StorageError::SourceWriteFailed(_))));
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn geojson_missing_file_is_unavailable() {
    let dir = TempDir::new().unwrap();
    let binding = make_geojson(dir.path());
    std::fs::remove_file(dir.path().join("wells.geojson")).unwrap();
    let result = ConnectorRegistry::with_defaults().probe(&binding);
    assert!(matches!(result, Err(StorageError::SourceUnavailable(_))));
}

// ── CSV ───────────────────────────────────────────────────────────

fn make_csv(dir: &Path, delimiter: char) -> SourceBinding {
    let d = delimiter;
    std::fs::write(
        dir.join("trees.csv"),
        format!("id{d}name{d}lon{d}lat\n1{d}oak{d}7.5{d}46.1\n2{d}ash{d}7.6{d}46.2\n"),
    )
    .unwrap();
    SourceBinding::new(
        LayerId::new("trees"),
        DataSourceDescriptor::LocalFile {
            path: "trees.csv".into(),
            format: FileFormat::Csv,
            layer_name: None,
            csv: Some(CsvOptions {
                x_field: Some("lon".into()),
                y_field: Some("lat".into()),
                delimiter,
                encoding: None,
            }),
        },
        dir,
    )
    .with_fields(vec![
        FieldSpec::new("id", FieldType::Integer),
        FieldSpec::new("name", FieldType::Text),
    ])
    .with_key(Some("id".into()))
    .with_spatial(true)
}

#[test]
fn csv_builds_points_from_coordinate_columns() {
    let dir = TempDir::new().unwrap();
    let mut source = ConnectorRegistry::with_defaults()
        .open(make_csv(dir.path(), ';'))
        .unwrap();
    let features = read_all(source.as_mut());
    assert_eq!(names(&features), vec!["oak", "ash"]);
    assert_eq!(features[0].geometry, Some(Geometry::point(7.5, 46.1)));
    assert_eq!(features[0].key, Some(FeatureKey::from(1)));
}

#[test]
fn csv_apply_rewrites_rows() {
    let dir = TempDir::new().unwrap();
    let mut source = ConnectorRegistry::with_defaults()
        .open(make_csv(dir.path(), ','))
        .unwrap();
    let mut moved = Mutation::update(FeatureKey::from(2));
    if let Mutation::Update { geometry, .. } = &mut moved {
        *geometry = Some(Some(Geometry::point(8.0, 47.0)));
    }
    let inserted = source
        .apply(&[
            moved,
            Mutation::Delete {
                key: FeatureKey::from(1),
            },
            Mutation::Insert {
                feature: Feature::new(None)
                    .with_attribute("name", "elm")
                    .with_geometry(Geometry::point(9.0, 48.0)),
            },
        ])
        .unwrap();
    assert_eq!(inserted, vec![FeatureKey::from(3)]);

    let features = read_all(source.as_mut());
    assert_eq!(names(&features), vec!["ash", "elm"]);
    assert_eq!(features[0].geometry, Some(Geometry::point(8.0, 47.0)));
    assert_eq!(features[1].key, Some(FeatureKey::from(3)));
}

#[test]
fn csv_source_requires_coordinate_columns() {
    let dir = TempDir::new().unwrap();
    let mut binding = make_csv(dir.path(), ',');
    if let DataSourceDescriptor::LocalFile { csv: Some(opts), .. } = &mut binding.descriptor {
        opts.x_field = Some("easting".into());
    }
    assert!(ConnectorRegistry::with_defaults().probe(&binding).is_err());
}

// ── Registry ──────────────────────────────────────────────────────

#[test]
fn unknown_driver_is_unsupported() {
    let binding = SourceBinding::new(
        LayerId::new("roads"),
        DataSourceDescriptor::Database {
            driver: "postgres".into(),
            connection: "host=db".into(),
            table: "roads".into(),
            geometry_column: None,
            filter: None,
        },
        "/tmp",
    );
    let result = ConnectorRegistry::with_defaults().probe(&binding);
    assert!(matches!(result, Err(StorageError::UnsupportedSourceType(_))));
}

#[test]
fn tiled_services_have_no_connector() {
    let registry = ConnectorRegistry::with_defaults();
    let wms = DataSourceDescriptor::RemoteService {
        url: "https://tiles.example.org/wms".into(),
        protocol: ServiceProtocol::Wms,
        filter: None,
    };
    assert!(registry.find(&wms).is_none());
}

#[test]
fn unreachable_remote_host_fails_within_timeout() {
    let binding = SourceBinding::new(
        LayerId::new("remote"),
        DataSourceDescriptor::RemoteService {
            url: "http://127.0.0.1:9/features".into(),
            protocol: ServiceProtocol::GeoJson,
            filter: None,
        },
        "/tmp",
    )
    .with_timeout(std::time::Duration::from_millis(500));
    let started = std::time::Instant::now();
    let result = ConnectorRegistry::with_defaults().probe(&binding);
    assert!(matches!(result, Err(StorageError::SourceUnavailable(_))));
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}
