//! JSON encoding of rows.
//!
//! Each row becomes one JSON object keyed by column name, in schema order.
//! Nulls are written as explicit `null` fields and JSON columns are embedded as
//! nested values.

use serde_json::{Map, Number};
use tabkafka_core::{Column, KafkaOutputError, Row, Schema, Value};

/// Converts rows into JSON objects, skipping ignored columns.
#[derive(Debug, Clone)]
pub struct JsonColumnVisitor {
    columns: Vec<Column>,
}

impl JsonColumnVisitor {
    pub fn new(schema: &Schema, ignore_columns: &[String]) -> Self {
        let columns = schema
            .columns()
            .iter()
            .filter(|c| !ignore_columns.contains(&c.name))
            .cloned()
            .collect();
        Self { columns }
    }

    /// Build the JSON object for `row`.
    pub fn visit(&self, row: &Row) -> serde_json::Value {
        let mut object = Map::with_capacity(self.columns.len());
        for column in &self.columns {
            object.insert(column.name.clone(), column_to_json(row.get(column.index)));
        }
        serde_json::Value::Object(object)
    }

    /// Serialized message value for `row`.
    pub fn encode(&self, row: &Row) -> Result<Vec<u8>, KafkaOutputError> {
        serde_json::to_vec(&self.visit(row))
            .map_err(|e| KafkaOutputError::schema(format!("cannot serialize row as JSON: {e}")))
    }
}

fn column_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Long(v) => serde_json::Value::Number((*v).into()),
        // NaN and infinities have no JSON form
        Value::Double(v) => Number::from_f64(*v)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Boolean(v) => serde_json::Value::Bool(*v),
        Value::Timestamp(ts) => serde_json::Value::Number(ts.timestamp_millis().into()),
        Value::Json(v) => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tabkafka_core::ColumnType;

    fn schema() -> Schema {
        Schema::new([
            ("id", ColumnType::Long),
            ("name", ColumnType::String),
            ("score", ColumnType::Double),
            ("active", ColumnType::Boolean),
            ("at", ColumnType::Timestamp),
            ("payload", ColumnType::Json),
        ])
    }

    fn row() -> Row {
        Row::new(vec![
            Value::Long(1),
            Value::String("a".into()),
            Value::Double(2.5),
            Value::Boolean(true),
            Value::Timestamp(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()),
            Value::Json(json!({"tags": ["x", "y"], "n": 3})),
        ])
    }

    #[test]
    fn simple_row_encodes_in_column_order() {
        let schema = Schema::new([("id", ColumnType::Long), ("name", ColumnType::String)]);
        let visitor = JsonColumnVisitor::new(&schema, &[]);
        let row = Row::new(vec![Value::Long(1), Value::String("a".into())]);
        let bytes = visitor.encode(&row).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"id":1,"name":"a"}"#);
    }

    #[test]
    fn decoded_value_matches_source_row() {
        let visitor = JsonColumnVisitor::new(&schema(), &[]);
        let bytes = visitor.encode(&row()).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            decoded,
            json!({
                "id": 1,
                "name": "a",
                "score": 2.5,
                "active": true,
                "at": 1_700_000_000_123i64,
                "payload": {"tags": ["x", "y"], "n": 3}
            })
        );
    }

    #[test]
    fn json_columns_are_nested_not_escaped() {
        let visitor = JsonColumnVisitor::new(&schema(), &[]);
        let text = String::from_utf8(visitor.encode(&row()).unwrap()).unwrap();
        assert!(text.contains(r#""payload":{"tags":["x","y"],"n":3}"#));
    }

    #[test]
    fn nulls_are_explicit_fields() {
        let visitor = JsonColumnVisitor::new(&schema(), &[]);
        let nulls = Row::new(vec![Value::Null; 6]);
        let decoded = visitor.visit(&nulls);
        let object = decoded.as_object().unwrap();
        assert_eq!(object.len(), 6);
        assert!(object.values().all(serde_json::Value::is_null));
    }

    #[test]
    fn ignored_columns_never_appear() {
        let ignore = vec!["name".to_string(), "payload".to_string()];
        let visitor = JsonColumnVisitor::new(&schema(), &ignore);
        let decoded = visitor.visit(&row());
        let object = decoded.as_object().unwrap();
        assert!(!object.contains_key("name"));
        assert!(!object.contains_key("payload"));
        assert_eq!(object.len(), 4);
    }

    #[test]
    fn re_encoding_decoded_value_is_byte_identical() {
        let visitor = JsonColumnVisitor::new(&schema(), &[]);
        let bytes = visitor.encode(&row()).unwrap();
        let decoded: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(serde_json::to_vec(&decoded).unwrap(), bytes);
    }

    #[test]
    fn non_finite_doubles_become_null() {
        let schema = Schema::new([("score", ColumnType::Double)]);
        let visitor = JsonColumnVisitor::new(&schema, &[]);
        let decoded = visitor.visit(&Row::new(vec![Value::Double(f64::NAN)]));
        assert_eq!(decoded, json!({"score": null}));
    }
}
