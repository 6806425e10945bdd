use fieldpack_types::{Feature, FeatureKey, Geometry, Value, feature_digest, geometry_digest, value_digest};
use proptest::prelude::*;

// ── Values ────────────────────────────────────────────────────────

#[test]
fn digest_distinguishes_types() {
    assert_ne!(value_digest(&Value::from("1")), value_digest(&Value::Integer(1)));
    assert_ne!(value_digest(&Value::Null), value_digest(&Value::from("")));
}

#[test]
fn digest_is_hex_sha256() {
    let d = value_digest(&Value::Integer(1));
    assert_eq!(d.len(), 64);
    assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
}

// ── Geometry ──────────────────────────────────────────────────────

#[test]
fn geometry_digest_ignores_key_order() {
    let a = Geometry::parse(r#"{"type":"Point","coordinates":[1.0,2.0]}"#).unwrap();
    let b = Geometry::parse(r#"{"coordinates":[1.0,2.0],"type":"Point"}"#).unwrap();
    assert_eq!(geometry_digest(Some(&a)), geometry_digest(Some(&b)));
    assert_ne!(geometry_digest(Some(&a)), geometry_digest(None));
}

// ── Features ──────────────────────────────────────────────────────

#[test]
fn feature_digest_ignores_key() {
    let a = Feature::new(Some(FeatureKey::from(1))).with_attribute("name", "oak");
    let b = Feature::new(Some(FeatureKey::from(2))).with_attribute("name", "oak");
    assert_eq!(feature_digest(&a), feature_digest(&b));
}

#[test]
fn feature_digest_sees_attribute_change() {
    let a = Feature::new(None).with_attribute("name", "oak");
    let b = Feature::new(None).with_attribute("name", "elm");
    assert_ne!(feature_digest(&a), feature_digest(&b));
}

proptest! {
    #[test]
    fn equal_integers_share_digest(i in any::<i64>()) {
        prop_assert_eq!(value_digest(&Value::Integer(i)), value_digest(&Value::Integer(i)));
    }

    #[test]
    fn distinct_text_has_distinct_digest(a in ".{0,16}", b in ".{0,16}") {
        prop_assume!(a != b);
        prop_assert_ne!(value_digest(&Value::Text(a)), value_digest(&Value::Text(b)));
    }
}
