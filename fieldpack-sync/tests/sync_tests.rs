use fieldpack_export::{ExportConfig, Packager};
use fieldpack_model::{
    AttachmentKind, CsvOptions, DataSourceDescriptor, FieldDef, FileFormat, Layer, Project, Widget,
};
use fieldpack_package::Package;
use fieldpack_storage::{Container, ContainerLayer, FieldSpec, Mutation};
use fieldpack_sync::{
    Applied, CONFLICTS_FILE, ConflictPolicy, ConflictReport, ConflictTarget, Decision,
    LayerSyncOutcome, ResolutionState, SyncConfig, SyncError, Synchronizer,
};
use fieldpack_types::{
    CancelToken, Feature, FeatureKey, FieldType, Geometry, GeometryType, LayerId, Value,
};
use pretty_assertions::assert_eq;
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const TREES: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {"type": "Feature", "properties": {"id": 1, "species": "oak", "photo": "photos/oak.jpg"},
     "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}},
    {"type": "Feature", "properties": {"id": 2, "species": "elm", "photo": null},
     "geometry": {"type": "Point", "coordinates": [3.0, 4.0]}}
  ]
}"#;

/// A project with an editable GeoJSON layer and an editable SQLite table.
fn make_project(dir: &Path) -> Project {
    let home = dir.join("project");
    std::fs::create_dir_all(home.join("photos")).unwrap();
    std::fs::write(home.join("trees.geojson"), TREES).unwrap();
    std::fs::write(home.join("photos/oak.jpg"), b"jpeg bytes").unwrap();

    let conn = rusqlite::Connection::open(home.join("inspections.sqlite")).unwrap();
    conn.execute_batch(
        "CREATE TABLE inspections (id INTEGER PRIMARY KEY, tree_id INTEGER, note TEXT);
         INSERT INTO inspections VALUES (1, 1, 'healthy');
         INSERT INTO inspections VALUES (2, 2, 'needs pruning');
         INSERT INTO inspections VALUES (3, 2, 'leaning');",
    )
    .unwrap();

    let mut trees = Layer::new(
        "trees",
        "Trees",
        DataSourceDescriptor::LocalFile {
            path: "trees.geojson".into(),
            format: FileFormat::GeoJson,
            layer_name: None,
            csv: None,
        },
    )
    .with_geometry(GeometryType::Point)
    .with_primary_key("id")
    .with_fields(vec![
        FieldDef::new("id", "integer"),
        FieldDef::new("species", "text"),
        FieldDef::new("photo", "text").with_widget(Widget::Attachment {
            attachment: AttachmentKind::Image,
            naming: None,
        }),
    ]);
    trees.capabilities.offline_editing = true;

    let mut inspections = Layer::new(
        "inspections",
        "Inspections",
        DataSourceDescriptor::Database {
            driver: "sqlite".into(),
            connection: "inspections.sqlite".into(),
            table: "inspections".into(),
            geometry_column: None,
            filter: None,
        },
    )
    .with_primary_key("id")
    .with_fields(vec![
        FieldDef::new("id", "integer"),
        FieldDef::new("tree_id", "integer"),
        FieldDef::new("note", "text"),
    ]);
    inspections.capabilities.offline_editing = true;

    let mut project = Project::new("Urban trees", &home);
    project.layers.push(trees);
    project.layers.push(inspections);
    project
}

fn package(project: &Project, dir: &Path, config: ExportConfig) -> Package {
    let out = dir.join("field");
    let summary = Packager::new(config)
        .package(project, &out, &CancelToken::new())
        .unwrap();
    Package::open(&summary.package).unwrap()
}

fn sync(package: &Package, project: &Project, policy: ConflictPolicy) -> fieldpack_sync::SyncSummary {
    let config = SyncConfig {
        policy,
        ..SyncConfig::default()
    };
    Synchronizer::new(config)
        .sync(package, project, &CancelToken::new())
        .unwrap()
}

fn open_layer(package: &Package, id: &str) -> (Container, ContainerLayer) {
    let entry = package.manifest().layer(&LayerId::new(id)).unwrap();
    package.open_container(entry).unwrap()
}

/// Offline edit: sets one attribute of one packaged feature.
fn edit(package: &Package, id: &str, key: i64, field: &str, value: impl Into<Value>) {
    let (mut container, table) = open_layer(package, id);
    container
        .apply(
            &table,
            &[Mutation::Update {
                key: FeatureKey::from(key),
                attributes: BTreeMap::from([(field.to_string(), value.into())]),
                geometry: None,
            }],
        )
        .unwrap();
}

fn delete_offline(package: &Package, id: &str, key: i64) {
    let (mut container, table) = open_layer(package, id);
    container
        .apply(&table, &[Mutation::Delete { key: FeatureKey::from(key) }])
        .unwrap();
}

fn packaged(package: &Package, id: &str) -> Vec<Feature> {
    let (container, table) = open_layer(package, id);
    let mut rows = Vec::new();
    container
        .read_batches(&table, 100, &mut |batch| {
            rows.extend(batch.into_iter().map(|r| r.feature));
            Ok(())
        })
        .unwrap();
    rows
}

fn packaged_value(package: &Package, id: &str, key: i64, field: &str) -> Option<Value> {
    packaged(package, id)
        .into_iter()
        .find(|f| f.key == Some(FeatureKey::from(key)))
        .map(|f| f.attribute(field).clone())
}

fn source_db(project: &Project) -> rusqlite::Connection {
    rusqlite::Connection::open(project.home.join("inspections.sqlite")).unwrap()
}

fn note(project: &Project, id: i64) -> Option<String> {
    source_db(project)
        .query_row("SELECT note FROM inspections WHERE id = ?1", [id], |row| row.get(0))
        .ok()
}

fn tree(project: &Project, id: i64) -> Option<Json> {
    let doc: Json = serde_json::from_slice(&std::fs::read(project.home.join("trees.geojson")).unwrap()).unwrap();
    doc["features"]
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["properties"]["id"] == Json::from(id))
        .cloned()
}

fn outcome<'a>(summary: &'a fieldpack_sync::SyncSummary, id: &str) -> &'a LayerSyncOutcome {
    &summary.layer(&LayerId::new(id)).unwrap().outcome
}

fn files(paths: &[PathBuf]) -> Vec<Vec<u8>> {
    paths.iter().map(|p| std::fs::read(p).unwrap()).collect()
}

// ── Round trip ────────────────────────────────────────────────────

#[test]
fn syncing_an_unedited_package_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    let sources = [
        project.home.join("trees.geojson"),
        project.home.join("inspections.sqlite"),
    ];
    let before = files(&sources);

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert!(summary.report.is_empty());
    assert_eq!(summary.applied(), Applied::default());
    assert_eq!(outcome(&summary, "trees"), &LayerSyncOutcome::Synced(Applied::default()));
    assert_eq!(outcome(&summary, "inspections"), &LayerSyncOutcome::Synced(Applied::default()));
    assert_eq!(files(&sources), before);
    assert!(package.root().join(CONFLICTS_FILE).is_file());
}

const WELLS: &str = "fid;depth;lon;lat\n1;12;7.5;47.1\n2;30;7.6;47.2\n";

/// A project with one editable CSV point layer.
fn wells_project(dir: &Path) -> Project {
    let home = dir.join("project");
    std::fs::create_dir_all(&home).unwrap();
    std::fs::write(home.join("wells.csv"), WELLS).unwrap();
    let mut wells = Layer::new(
        "wells",
        "Wells",
        DataSourceDescriptor::LocalFile {
            path: "wells.csv".into(),
            format: FileFormat::Csv,
            layer_name: None,
            csv: Some(CsvOptions {
                x_field: Some("lon".into()),
                y_field: Some("lat".into()),
                delimiter: ';',
                encoding: None,
            }),
        },
    )
    .with_geometry(GeometryType::Point)
    .with_primary_key("fid")
    .with_fields(vec![FieldDef::new("fid", "integer"), FieldDef::new("depth", "integer")]);
    wells.capabilities.offline_editing = true;
    let mut project = Project::new("Wells", &home);
    project.layers.push(wells);
    project
}

/// A project whose only layer is a fieldpack container, packaged by copy.
fn plots_project(dir: &Path) -> Project {
    let home = dir.join("project");
    std::fs::create_dir_all(&home).unwrap();
    let table = ContainerLayer::new(
        "plots",
        LayerId::new("plots"),
        vec![FieldSpec::new("id", FieldType::Integer), FieldSpec::new("crop", FieldType::Text)],
        Some(GeometryType::Point),
    )
    .with_key(Some("id".into()));
    let mut container = Container::create(&home.join("plots.sqlite")).unwrap();
    container.create_layer(&table).unwrap();
    let plot = |id: i64, crop: &str| {
        Feature::new(Some(FeatureKey::from(id)))
            .with_attribute("id", id)
            .with_attribute("crop", crop)
            .with_geometry(Geometry::point(id as f64, 0.0))
    };
    container.insert_features(&table, &[plot(1, "wheat"), plot(2, "barley")]).unwrap();
    drop(container);

    let mut plots = Layer::new(
        "plots",
        "Plots",
        DataSourceDescriptor::LocalFile {
            path: "plots.sqlite".into(),
            format: FileFormat::Container,
            layer_name: Some("plots".into()),
            csv: None,
        },
    )
    .with_geometry(GeometryType::Point)
    .with_primary_key("id")
    .with_fields(vec![FieldDef::new("id", "integer"), FieldDef::new("crop", "text")]);
    plots.capabilities.offline_editing = true;
    let mut project = Project::new("Farm", &home);
    project.layers.push(plots);
    project
}

fn source_crops(project: &Project) -> Vec<(Option<FeatureKey>, Value)> {
    let container = Container::open(&project.home.join("plots.sqlite")).unwrap();
    let table = container.layer("plots").unwrap();
    let mut crops = Vec::new();
    container
        .read_batches(&table, 100, &mut |rows| {
            for row in rows {
                let crop = row.feature.attribute("crop").clone();
                crops.push((row.feature.key, crop));
            }
            Ok(())
        })
        .unwrap();
    crops
}

#[test]
fn unedited_csv_layer_round_trips_byte_for_byte() {
    let dir = TempDir::new().unwrap();
    let project = wells_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(outcome(&summary, "wells"), &LayerSyncOutcome::Synced(Applied::default()));
    assert_eq!(std::fs::read_to_string(project.home.join("wells.csv")).unwrap(), WELLS);
}

#[test]
fn offline_edit_reaches_a_csv_layer() {
    let dir = TempDir::new().unwrap();
    let project = wells_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    edit(&package, "wells", 2, "depth", 45i64);

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(
        outcome(&summary, "wells"),
        &LayerSyncOutcome::Synced(Applied {
            updated: 1,
            ..Applied::default()
        })
    );
    assert_eq!(
        std::fs::read_to_string(project.home.join("wells.csv")).unwrap(),
        "fid;depth;lon;lat\n1;12;7.5;47.1\n2;45;7.6;47.2\n"
    );
    let again = sync(&package, &project, ConflictPolicy::Manual);
    assert_eq!(again.applied(), Applied::default());
}

#[test]
fn unedited_copied_container_round_trips_byte_for_byte() {
    let dir = TempDir::new().unwrap();
    let project = plots_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    let sources = [project.home.join("plots.sqlite")];
    let before = files(&sources);

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(outcome(&summary, "plots"), &LayerSyncOutcome::Synced(Applied::default()));
    assert_eq!(files(&sources), before);
}

#[test]
fn offline_edit_reaches_a_copied_container() {
    let dir = TempDir::new().unwrap();
    let project = plots_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    edit(&package, "plots", 2, "crop", "rye");

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(
        outcome(&summary, "plots"),
        &LayerSyncOutcome::Synced(Applied {
            updated: 1,
            ..Applied::default()
        })
    );
    assert_eq!(
        source_crops(&project),
        vec![
            (Some(FeatureKey::from(1)), Value::from("wheat")),
            (Some(FeatureKey::from(2)), Value::from("rye")),
        ]
    );
}

// ── Field merges ──────────────────────────────────────────────────

#[test]
fn offline_edit_is_applied_verbatim() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    edit(&package, "inspections", 1, "note", "dead branch");

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(note(&project, 1).as_deref(), Some("dead branch"));
    assert_eq!(note(&project, 2).as_deref(), Some("needs pruning"));
    assert_eq!(
        outcome(&summary, "inspections"),
        &LayerSyncOutcome::Synced(Applied {
            updated: 1,
            ..Applied::default()
        })
    );
}

#[test]
fn remote_edit_is_kept() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    source_db(&project)
        .execute("UPDATE inspections SET note = 'pruned' WHERE id = 2", [])
        .unwrap();

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert!(summary.report.is_empty());
    assert_eq!(note(&project, 2).as_deref(), Some("pruned"));
}

#[test]
fn conflicting_edits_leave_the_source_alone() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    edit(&package, "inspections", 2, "note", "removed");
    edit(&package, "inspections", 2, "tree_id", 1i64);
    source_db(&project)
        .execute("UPDATE inspections SET note = 'pruned' WHERE id = 2", [])
        .unwrap();

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(summary.report.len(), 1);
    let record = &summary.report.records[0];
    assert_eq!(record.layer_id, LayerId::new("inspections"));
    assert_eq!(record.key, FeatureKey::from(2));
    assert_eq!(record.target, ConflictTarget::Field("note".into()));
    assert_eq!(record.base, Value::from("needs pruning"));
    assert_eq!(record.local, Value::from("removed"));
    assert_eq!(record.remote, Value::from("pruned"));
    assert_eq!(record.state, ResolutionState::Unresolved);

    assert_eq!(note(&project, 2).as_deref(), Some("pruned"));
    let tree_id: i64 = source_db(&project)
        .query_row("SELECT tree_id FROM inspections WHERE id = 2", [], |row| row.get(0))
        .unwrap();
    assert_eq!(tree_id, 1, "the non-conflicting field still merges");
    assert!(matches!(
        outcome(&summary, "inspections"),
        LayerSyncOutcome::Conflicted { conflicts: 1, .. }
    ));

    let saved = ConflictReport::load(&package.root().join(CONFLICTS_FILE)).unwrap();
    assert_eq!(saved.records, summary.report.records);
}

#[test]
fn identical_edits_converge() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    edit(&package, "inspections", 2, "note", "pruned");
    source_db(&project)
        .execute("UPDATE inspections SET note = 'pruned' WHERE id = 2", [])
        .unwrap();

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert!(summary.report.is_empty());
    assert_eq!(summary.applied(), Applied::default());
}

#[test]
fn geometry_is_merged_as_one_field() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    let (mut container, table) = open_layer(&package, "trees");
    container
        .apply(
            &table,
            &[Mutation::Update {
                key: FeatureKey::from(1),
                attributes: BTreeMap::new(),
                geometry: Some(Some(fieldpack_types::Geometry::point(5.0, 6.0))),
            }],
        )
        .unwrap();
    drop(container);

    sync(&package, &project, ConflictPolicy::Manual);

    let moved = tree(&project, 1).unwrap();
    assert_eq!(moved["geometry"]["coordinates"], serde_json::json!([5.0, 6.0]));
    assert_eq!(moved["properties"]["species"], Json::from("oak"));
}

// ── Feature additions and deletions ───────────────────────────────

#[test]
fn offline_insert_gets_its_source_key_written_back() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    let (mut container, table) = open_layer(&package, "inspections");
    let added = Feature::new(None)
        .with_attribute("id", Value::Null)
        .with_attribute("tree_id", 1i64)
        .with_attribute("note", "new sapling");
    container.insert_features(&table, &[added]).unwrap();
    drop(container);

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(
        outcome(&summary, "inspections"),
        &LayerSyncOutcome::Synced(Applied {
            inserted: 1,
            ..Applied::default()
        })
    );
    assert_eq!(note(&project, 4).as_deref(), Some("new sapling"));
    assert_eq!(packaged_value(&package, "inspections", 4, "note"), Some(Value::from("new sapling")));

    let again = sync(&package, &project, ConflictPolicy::Manual);
    assert_eq!(again.applied(), Applied::default());
    assert!(again.report.is_empty());
    let count: i64 = source_db(&project)
        .query_row("SELECT COUNT(*) FROM inspections", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 4);
}

#[test]
fn offline_addition_under_a_key_taken_at_the_source_is_a_conflict() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    source_db(&project)
        .execute("INSERT INTO inspections VALUES (4, 1, 'remote created')", [])
        .unwrap();
    let (mut container, table) = open_layer(&package, "inspections");
    let added = Feature::new(Some(FeatureKey::from(4)))
        .with_attribute("id", 4i64)
        .with_attribute("tree_id", 2i64)
        .with_attribute("note", "offline created");
    container.insert_features(&table, &[added]).unwrap();
    drop(container);

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(note(&project, 4).as_deref(), Some("remote created"));
    assert_eq!(
        outcome(&summary, "inspections"),
        &LayerSyncOutcome::Conflicted {
            applied: Applied::default(),
            conflicts: 1
        }
    );
    let record = &summary.report.records[0];
    assert_eq!(record.key, FeatureKey::from(4));
    assert_eq!(record.target, ConflictTarget::KeyCollision);
    assert_eq!(record.base, Value::Null);

    let mut report = summary.report;
    let id = report.records[0].id;
    report.decide(id, Decision::KeepRemote).unwrap();
    let resolved = Synchronizer::new(SyncConfig::default())
        .apply_resolutions(&package, &project, report)
        .unwrap();
    assert!(resolved.report.is_empty());
    assert_eq!(packaged_value(&package, "inspections", 4, "note"), Some(Value::from("remote created")));

    let again = sync(&package, &project, ConflictPolicy::Manual);
    assert!(again.report.is_empty());
    assert_eq!(again.applied(), Applied::default());
}

#[test]
fn offline_deletion_respects_remote_changes() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    delete_offline(&package, "inspections", 1);
    delete_offline(&package, "inspections", 3);
    source_db(&project)
        .execute("UPDATE inspections SET note = 'propped up' WHERE id = 3", [])
        .unwrap();

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(note(&project, 1), None);
    assert_eq!(note(&project, 3).as_deref(), Some("propped up"));
    assert_eq!(summary.report.len(), 1);
    let record = &summary.report.records[0];
    assert_eq!(record.key, FeatureKey::from(3));
    assert_eq!(record.target, ConflictTarget::DeletedLocally);
    assert_eq!(record.local, Value::Null);
    assert!(matches!(
        outcome(&summary, "inspections"),
        LayerSyncOutcome::Conflicted {
            applied: Applied { deleted: 1, .. },
            conflicts: 1
        }
    ));
}

#[test]
fn remote_deletion_of_an_edited_feature_is_a_conflict() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    edit(&package, "inspections", 2, "note", "still here");
    source_db(&project)
        .execute("DELETE FROM inspections WHERE id IN (1, 2)", [])
        .unwrap();

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert_eq!(summary.report.len(), 1);
    assert_eq!(summary.report.records[0].target, ConflictTarget::DeletedRemotely);
    assert_eq!(summary.report.records[0].remote, Value::Null);
    assert_eq!(note(&project, 2), None);
    assert_eq!(packaged_value(&package, "inspections", 1, "note"), None, "unedited row follows the source");
    assert!(packaged_value(&package, "inspections", 2, "note").is_some());
}

// ── Attachments ───────────────────────────────────────────────────

#[test]
fn attachment_paths_map_back_to_the_project() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    let packaged_photo = packaged_value(&package, "trees", 1, "photo").unwrap();
    assert_ne!(packaged_photo, Value::from("photos/oak.jpg"));

    edit(&package, "trees", 1, "species", "red oak");
    std::fs::create_dir_all(package.root().join("DCIM")).unwrap();
    std::fs::write(package.root().join("DCIM/elm.jpg"), b"captured").unwrap();
    edit(&package, "trees", 2, "photo", "DCIM/elm.jpg");

    sync(&package, &project, ConflictPolicy::Manual);

    let oak = tree(&project, 1).unwrap();
    assert_eq!(oak["properties"]["species"], Json::from("red oak"));
    assert_eq!(oak["properties"]["photo"], Json::from("photos/oak.jpg"));
    let elm = tree(&project, 2).unwrap();
    assert_eq!(elm["properties"]["photo"], Json::from("DCIM/elm.jpg"));
    assert_eq!(std::fs::read(project.home.join("DCIM/elm.jpg")).unwrap(), b"captured");
}

#[test]
fn captures_are_not_imported_when_the_layer_fails() {
    let dir = TempDir::new().unwrap();
    let home = dir.path().join("project");
    std::fs::create_dir_all(&home).unwrap();
    let conn = rusqlite::Connection::open(home.join("visits.sqlite")).unwrap();
    conn.execute_batch(
        "CREATE TABLE visits (id INTEGER PRIMARY KEY, photo TEXT);
         INSERT INTO visits VALUES (1, NULL);",
    )
    .unwrap();
    let mut visits = Layer::new(
        "visits",
        "Visits",
        DataSourceDescriptor::Database {
            driver: "sqlite".into(),
            connection: "visits.sqlite".into(),
            table: "visits".into(),
            geometry_column: None,
            filter: None,
        },
    )
    .with_primary_key("id")
    .with_fields(vec![
        FieldDef::new("id", "integer"),
        FieldDef::new("photo", "text").with_widget(Widget::Attachment {
            attachment: AttachmentKind::Image,
            naming: None,
        }),
    ]);
    visits.capabilities.offline_editing = true;
    let mut project = Project::new("Visits", &home);
    project.layers.push(visits);
    let package = package(&project, dir.path(), ExportConfig::default());

    std::fs::create_dir_all(package.root().join("DCIM")).unwrap();
    std::fs::write(package.root().join("DCIM/gate.jpg"), b"captured").unwrap();
    edit(&package, "visits", 1, "photo", "DCIM/gate.jpg");
    conn.execute_batch("CREATE TRIGGER locked BEFORE UPDATE ON visits BEGIN SELECT RAISE(ABORT, 'locked'); END;")
        .unwrap();

    let summary = sync(&package, &project, ConflictPolicy::Manual);
    assert!(matches!(outcome(&summary, "visits"), LayerSyncOutcome::Failed(_)));
    assert!(!home.join("DCIM/gate.jpg").exists());

    conn.execute_batch("DROP TRIGGER locked;").unwrap();
    let summary = sync(&package, &project, ConflictPolicy::Manual);
    assert!(matches!(outcome(&summary, "visits"), LayerSyncOutcome::Synced(_)));
    assert_eq!(std::fs::read(home.join("DCIM/gate.jpg")).unwrap(), b"captured");
}

// ── Policies and resolutions ──────────────────────────────────────

fn conflicted(dir: &Path) -> (Project, Package) {
    let project = make_project(dir);
    let package = package(&project, dir, ExportConfig::default());
    edit(&package, "inspections", 2, "note", "removed");
    source_db(&project)
        .execute("UPDATE inspections SET note = 'pruned' WHERE id = 2", [])
        .unwrap();
    (project, package)
}

#[test]
fn prefer_local_writes_the_offline_value() {
    let dir = TempDir::new().unwrap();
    let (project, package) = conflicted(dir.path());

    let summary = sync(&package, &project, ConflictPolicy::PreferLocal);

    assert_eq!(note(&project, 2).as_deref(), Some("removed"));
    assert_eq!(summary.report.len(), 1);
    assert_eq!(summary.report.records[0].state, ResolutionState::AutoResolved);
    assert_eq!(summary.report.unresolved().count(), 0);
    assert!(matches!(outcome(&summary, "inspections"), LayerSyncOutcome::Synced(_)));
}

#[test]
fn prefer_remote_updates_the_package() {
    let dir = TempDir::new().unwrap();
    let (project, package) = conflicted(dir.path());

    sync(&package, &project, ConflictPolicy::PreferRemote);

    assert_eq!(note(&project, 2).as_deref(), Some("pruned"));
    assert_eq!(packaged_value(&package, "inspections", 2, "note"), Some(Value::from("pruned")));
}

#[test]
fn decided_conflicts_are_applied_and_dropped() {
    let dir = TempDir::new().unwrap();
    let (project, package) = conflicted(dir.path());
    let summary = sync(&package, &project, ConflictPolicy::Manual);
    let mut report = summary.report;
    let id = report.records[0].id;
    report.decide(id, Decision::Overwrite(Value::from("replanted"))).unwrap();

    let synchronizer = Synchronizer::new(SyncConfig::default());
    let resolved = synchronizer.apply_resolutions(&package, &project, report).unwrap();

    assert!(resolved.report.is_empty());
    assert_eq!(note(&project, 2).as_deref(), Some("replanted"));
    assert_eq!(packaged_value(&package, "inspections", 2, "note"), Some(Value::from("replanted")));
    let saved = ConflictReport::load(&package.root().join(CONFLICTS_FILE)).unwrap();
    assert!(saved.is_empty());

    let again = sync(&package, &project, ConflictPolicy::Manual);
    assert!(again.report.is_empty());
}

#[test]
fn undecided_conflicts_stay_in_the_report() {
    let dir = TempDir::new().unwrap();
    let (project, package) = conflicted(dir.path());
    let report = sync(&package, &project, ConflictPolicy::Manual).report;

    let synchronizer = Synchronizer::new(SyncConfig::default());
    let resolved = synchronizer.apply_resolutions(&package, &project, report).unwrap();

    assert_eq!(resolved.report.len(), 1);
    assert!(resolved.layers.is_empty());
    assert_eq!(note(&project, 2).as_deref(), Some("pruned"));
}

#[test]
fn auto_resolved_records_are_dropped_when_resolutions_are_applied() {
    let dir = TempDir::new().unwrap();
    let (project, package) = conflicted(dir.path());
    let report = sync(&package, &project, ConflictPolicy::PreferLocal).report;
    assert_eq!(report.pending().count(), 0);

    let synchronizer = Synchronizer::new(SyncConfig::default());
    let resolved = synchronizer.apply_resolutions(&package, &project, report).unwrap();

    assert!(resolved.report.is_empty());
    assert!(resolved.layers.is_empty());
    assert_eq!(note(&project, 2).as_deref(), Some("removed"));
}

#[test]
fn a_report_from_another_package_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (project, package) = conflicted(dir.path());
    let foreign = ConflictReport::new(fieldpack_types::PackageId::new());

    let err = Synchronizer::new(SyncConfig::default())
        .apply_resolutions(&package, &project, foreign)
        .unwrap_err();
    assert!(matches!(err, SyncError::ForeignReport(_)));
}

// ── Layer isolation ───────────────────────────────────────────────

#[test]
fn a_failed_layer_does_not_stop_the_others() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    edit(&package, "trees", 1, "species", "red oak");
    std::fs::remove_file(project.home.join("inspections.sqlite")).unwrap();

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert!(matches!(outcome(&summary, "inspections"), LayerSyncOutcome::Failed(_)));
    assert!(summary.has_failures());
    assert_eq!(
        outcome(&summary, "trees"),
        &LayerSyncOutcome::Synced(Applied {
            updated: 1,
            ..Applied::default()
        })
    );
    assert_eq!(tree(&project, 1).unwrap()["properties"]["species"], Json::from("red oak"));
}

#[test]
fn read_only_layers_are_skipped() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let config = ExportConfig {
        offline: BTreeMap::from([(LayerId::new("inspections"), false)]),
        ..ExportConfig::default()
    };
    let package = package(&project, dir.path(), config);
    edit(&package, "trees", 1, "species", "red oak");

    let summary = sync(&package, &project, ConflictPolicy::Manual);

    assert!(matches!(outcome(&summary, "inspections"), LayerSyncOutcome::Skipped(_)));
    assert!(matches!(outcome(&summary, "trees"), LayerSyncOutcome::Synced(_)));
}

#[test]
fn cancelled_sync_leaves_sources_untouched() {
    let dir = TempDir::new().unwrap();
    let project = make_project(dir.path());
    let package = package(&project, dir.path(), ExportConfig::default());
    edit(&package, "inspections", 1, "note", "dead branch");
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = Synchronizer::new(SyncConfig::default())
        .sync(&package, &project, &cancel)
        .unwrap_err();

    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(note(&project, 1).as_deref(), Some("healthy"));
}
