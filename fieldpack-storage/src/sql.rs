//! Conversions between fieldpack values and SQLite values.

use crate::error::StorageResult;
use fieldpack_types::{FeatureKey, FieldType, Value};
use rusqlite::types::Value as SqlValue;

/// Quotes an identifier for use in SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Real(r) => SqlValue::Real(*r),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
        Value::Date(_) | Value::DateTime(_) | Value::Json(_) => SqlValue::Text(value.to_string()),
    }
}

pub(crate) fn from_sql(raw: SqlValue, ty: FieldType) -> StorageResult<Value> {
    let value = match raw {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(i),
        SqlValue::Real(r) => Value::Real(r),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Blob(b),
    };
    Ok(value.coerce(ty)?)
}

pub(crate) fn key_to_sql(key: &FeatureKey, ty: FieldType) -> SqlValue {
    to_sql(&key.to_value(ty))
}

/// `?, ?, ?` with `n` placeholders.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn booleans_round_trip_through_integers() {
        let raw = to_sql(&Value::Bool(true));
        assert_eq!(from_sql(raw, FieldType::Boolean).unwrap(), Value::Bool(true));
    }

    #[test]
    fn placeholders_are_comma_separated() {
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
