//! Avro encoding of rows against the target record schema.
//!
//! Columns are bound to record fields by name when the visitor is built. A
//! column with no field of that name, or whose type the field cannot hold, is
//! rejected there, before the first row of the task is read. What remains for
//! each row is value-level checking: nulls written to non-nullable fields,
//! integers that overflow an `int`, unknown enum symbols and JSON documents
//! that do not fit their field.

use std::collections::HashMap;
use std::sync::Arc;

use apache_avro::Schema as AvroSchema;
use apache_avro::schema::RecordField;
use apache_avro::types::Value as AvroValue;
use chrono::SecondsFormat;
use tabkafka_core::{ColumnType, KafkaOutputError, Row, Schema, Value};
use tracing::debug;

use crate::avsc::TargetSchema;

/// Converts rows into Avro records of the target schema.
#[derive(Debug, Clone)]
pub struct AvroColumnVisitor {
    target: Arc<TargetSchema>,
    slots: Vec<FieldSlot>,
}

/// Where one record field gets its value from.
#[derive(Debug, Clone)]
struct FieldSlot {
    name: String,
    source: SlotSource,
}

#[derive(Debug, Clone)]
enum SlotSource {
    Column {
        index: usize,
        /// Union branch holding null, if the field is nullable
        null_branch: Option<u32>,
        /// Union branch and schema receiving non-null values
        branch: Option<u32>,
        schema: AvroSchema,
    },
    Default(AvroValue),
}

impl AvroColumnVisitor {
    /// Bind the columns of `schema` to the fields of `target`.
    pub fn new(
        schema: &Schema,
        target: Arc<TargetSchema>,
        ignore_columns: &[String],
    ) -> Result<Self, KafkaOutputError> {
        let record = target.record();
        let mut bound: HashMap<&str, (usize, ColumnType)> = HashMap::new();
        for column in schema.columns() {
            if ignore_columns.contains(&column.name) {
                continue;
            }
            if !record.lookup.contains_key(&column.name) {
                return Err(KafkaOutputError::schema(format!(
                    "column '{}' is not a field of avro record {}",
                    column.name,
                    target.full_name()
                )));
            }
            bound.insert(&column.name, (column.index, column.column_type));
        }

        let mut slots = Vec::with_capacity(record.fields.len());
        for field in &record.fields {
            let source = match bound.get(field.name.as_str()) {
                Some(&(index, column_type)) => bind_column(&target, field, index, column_type)?,
                None => default_for(&target, field)?,
            };
            slots.push(FieldSlot {
                name: field.name.clone(),
                source,
            });
        }
        debug!(
            record = target.full_name(),
            columns = bound.len(),
            fields = slots.len(),
            "Bound columns to avro fields"
        );
        Ok(Self { target, slots })
    }

    /// Build the Avro record for `row`.
    pub fn visit(&self, row: &Row) -> Result<AvroValue, KafkaOutputError> {
        let mut fields = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let value = match &slot.source {
                SlotSource::Default(value) => value.clone(),
                SlotSource::Column {
                    index,
                    null_branch,
                    branch,
                    schema,
                } => {
                    let value = row.get(*index);
                    match (value, null_branch) {
                        // A JSON document `null` fills a nullable field like a SQL null.
                        (Value::Null | Value::Json(serde_json::Value::Null), Some(null_branch)) => {
                            AvroValue::Union(*null_branch, Box::new(AvroValue::Null))
                        }
                        (Value::Null, None) => {
                            return Err(KafkaOutputError::schema(format!(
                                "null value for non-nullable field '{}'",
                                slot.name
                            )));
                        }
                        (value, _) => {
                            let converted = column_to_avro(&self.target, value, schema, &slot.name)?;
                            match branch {
                                Some(branch) => AvroValue::Union(*branch, Box::new(converted)),
                                None => converted,
                            }
                        }
                    }
                }
            };
            fields.push((slot.name.clone(), value));
        }
        Ok(AvroValue::Record(fields))
    }

    /// Avro binary datum for `row`, without framing.
    pub fn encode(&self, row: &Row) -> Result<Vec<u8>, KafkaOutputError> {
        let record = self.visit(row)?;
        apache_avro::to_avro_datum(self.target.schema(), record)
            .map_err(|e| KafkaOutputError::schema(format!("avro encode: {e}")))
    }
}

fn bind_column(
    target: &TargetSchema,
    field: &RecordField,
    index: usize,
    column_type: ColumnType,
) -> Result<SlotSource, KafkaOutputError> {
    let incompatible = || {
        KafkaOutputError::schema(format!(
            "column '{}' of type {} cannot be written to avro field of type {}",
            field.name,
            column_type,
            field.schema.canonical_form()
        ))
    };
    match target.resolve(&field.schema) {
        AvroSchema::Union(union) => {
            let variants = union.variants();
            let null_branch = variants
                .iter()
                .position(|v| matches!(v, AvroSchema::Null))
                .map(|i| i as u32);
            let (branch, schema) = variants
                .iter()
                .map(|v| target.resolve(v))
                .enumerate()
                .find(|(_, v)| accepts(column_type, v))
                .ok_or_else(incompatible)?;
            Ok(SlotSource::Column {
                index,
                null_branch,
                branch: Some(branch as u32),
                schema: schema.clone(),
            })
        }
        schema if accepts(column_type, schema) => Ok(SlotSource::Column {
            index,
            null_branch: None,
            branch: None,
            schema: schema.clone(),
        }),
        _ => Err(incompatible()),
    }
}

fn default_for(target: &TargetSchema, field: &RecordField) -> Result<SlotSource, KafkaOutputError> {
    default_value(target, field).map(SlotSource::Default)
}

fn default_value(target: &TargetSchema, field: &RecordField) -> Result<AvroValue, KafkaOutputError> {
    let Some(default) = &field.default else {
        return Err(KafkaOutputError::schema(format!(
            "avro field '{}' has no matching column and no default",
            field.name
        )));
    };
    // Union defaults always refer to the first branch.
    let value = match target.resolve(&field.schema) {
        AvroSchema::Union(union) => {
            let first = union.variants().first().ok_or_else(|| {
                KafkaOutputError::schema(format!("avro field '{}' has an empty union", field.name))
            })?;
            AvroValue::Union(0, Box::new(json_to_avro(target, default, first, &field.name)?))
        }
        schema => json_to_avro(target, default, schema, &field.name)?,
    };
    Ok(value)
}

/// Whether a column of `column_type` can be written to `schema`.
fn accepts(column_type: ColumnType, schema: &AvroSchema) -> bool {
    use AvroSchema as S;
    match column_type {
        ColumnType::String => matches!(schema, S::String | S::Enum(_)),
        ColumnType::Long => matches!(schema, S::Long | S::Int | S::Double | S::Float),
        ColumnType::Double => matches!(schema, S::Double | S::Float),
        ColumnType::Boolean => matches!(schema, S::Boolean),
        ColumnType::Timestamp => matches!(
            schema,
            S::TimestampMillis | S::TimestampMicros | S::Long | S::String
        ),
        ColumnType::Json => matches!(
            schema,
            S::String
                | S::Record(_)
                | S::Map(_)
                | S::Array(_)
                | S::Enum(_)
                | S::Boolean
                | S::Int
                | S::Long
                | S::Float
                | S::Double
        ),
    }
}

fn column_to_avro(
    target: &TargetSchema,
    value: &Value,
    schema: &AvroSchema,
    field: &str,
) -> Result<AvroValue, KafkaOutputError> {
    use AvroSchema as S;
    let converted = match (value, schema) {
        (Value::String(s), S::String) => AvroValue::String(s.clone()),
        (Value::String(s), S::Enum(e)) => enum_value(s, &e.symbols, field)?,
        (Value::Long(v), S::Long) => AvroValue::Long(*v),
        (Value::Long(v), S::Int) => AvroValue::Int(i32::try_from(*v).map_err(|_| {
            KafkaOutputError::schema(format!("value {v} of field '{field}' overflows int"))
        })?),
        (Value::Long(v), S::Double) => AvroValue::Double(*v as f64),
        (Value::Long(v), S::Float) => AvroValue::Float(*v as f32),
        (Value::Double(v), S::Double) => AvroValue::Double(*v),
        (Value::Double(v), S::Float) => AvroValue::Float(*v as f32),
        (Value::Boolean(v), S::Boolean) => AvroValue::Boolean(*v),
        (Value::Timestamp(ts), S::TimestampMillis) => AvroValue::TimestampMillis(ts.timestamp_millis()),
        (Value::Timestamp(ts), S::TimestampMicros) => AvroValue::TimestampMicros(ts.timestamp_micros()),
        (Value::Timestamp(ts), S::Long) => AvroValue::Long(ts.timestamp_millis()),
        (Value::Timestamp(ts), S::String) => {
            AvroValue::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        (Value::Json(v), S::String) => AvroValue::String(v.to_string()),
        (Value::Json(v), schema) => json_to_avro(target, v, schema, field)?,
        (value, schema) => {
            return Err(KafkaOutputError::schema(format!(
                "value {value:?} of field '{field}' does not fit avro type {}",
                schema.canonical_form()
            )));
        }
    };
    Ok(converted)
}

fn enum_value(symbol: &str, symbols: &[String], field: &str) -> Result<AvroValue, KafkaOutputError> {
    symbols
        .iter()
        .position(|s| s == symbol)
        .map(|i| AvroValue::Enum(i as u32, symbol.to_string()))
        .ok_or_else(|| {
            KafkaOutputError::schema(format!("'{symbol}' is not a symbol of enum field '{field}'"))
        })
}

/// Structural conversion of a JSON document into an Avro value of `schema`.
fn json_to_avro(
    target: &TargetSchema,
    value: &serde_json::Value,
    schema: &AvroSchema,
    field: &str,
) -> Result<AvroValue, KafkaOutputError> {
    use AvroSchema as S;
    use serde_json::Value as J;
    let schema = target.resolve(schema);
    let mismatch = || {
        KafkaOutputError::schema(format!(
            "JSON {value} of field '{field}' does not fit avro type {}",
            schema.canonical_form()
        ))
    };
    let converted = match (value, schema) {
        (J::Null, S::Null) => AvroValue::Null,
        (J::Bool(b), S::Boolean) => AvroValue::Boolean(*b),
        (J::Number(n), S::Int) => AvroValue::Int(
            n.as_i64()
                .and_then(|i| i32::try_from(i).ok())
                .ok_or_else(mismatch)?,
        ),
        (J::Number(n), S::Long) => AvroValue::Long(n.as_i64().ok_or_else(mismatch)?),
        (J::Number(n), S::Float) => AvroValue::Float(n.as_f64().ok_or_else(mismatch)? as f32),
        (J::Number(n), S::Double) => AvroValue::Double(n.as_f64().ok_or_else(mismatch)?),
        (J::String(s), S::String) => AvroValue::String(s.clone()),
        (J::String(s), S::Enum(e)) => enum_value(s, &e.symbols, field)?,
        (J::Array(items), S::Array(array)) => AvroValue::Array(
            items
                .iter()
                .map(|item| json_to_avro(target, item, &array.items, field))
                .collect::<Result<_, _>>()?,
        ),
        (J::Object(entries), S::Map(map)) => AvroValue::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), json_to_avro(target, v, &map.types, field)?)))
                .collect::<Result<HashMap<_, _>, KafkaOutputError>>()?,
        ),
        (J::Object(entries), S::Record(record)) => {
            let mut fields = Vec::with_capacity(record.fields.len());
            for nested in &record.fields {
                let value = match (entries.get(&nested.name), &nested.default) {
                    (Some(v), _) => json_to_avro(target, v, &nested.schema, &nested.name)?,
                    (None, Some(_)) => default_value(target, nested)?,
                    (None, None) => json_to_avro(target, &J::Null, &nested.schema, &nested.name)?,
                };
                fields.push((nested.name.clone(), value));
            }
            AvroValue::Record(fields)
        }
        (value, S::Union(union)) => union
            .variants()
            .iter()
            .enumerate()
            .find_map(|(i, variant)| {
                json_to_avro(target, value, variant, field)
                    .ok()
                    .map(|v| AvroValue::Union(i as u32, Box::new(v)))
            })
            .ok_or_else(mismatch)?,
        _ => return Err(mismatch()),
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    const ORDER: &str = r#"{
        "type": "record",
        "name": "Order",
        "namespace": "com.acme",
        "fields": [
            {"name": "id", "type": "long"},
            {"name": "name", "type": ["null", "string"], "default": null},
            {"name": "qty", "type": "int"},
            {"name": "price", "type": ["null", "double"], "default": null},
            {"name": "paid", "type": "boolean"},
            {"name": "at", "type": {"type": "long", "logicalType": "timestamp-millis"}},
            {"name": "status", "type": {"type": "enum", "name": "Status", "symbols": ["NEW", "DONE"]}},
            {"name": "attrs", "type": {"type": "map", "values": "long"}},
            {"name": "source", "type": "string", "default": "batch"}
        ]
    }"#;

    fn target() -> Arc<TargetSchema> {
        Arc::new(TargetSchema::parse(ORDER).unwrap())
    }

    fn schema() -> Schema {
        Schema::new([
            ("id", ColumnType::Long),
            ("name", ColumnType::String),
            ("qty", ColumnType::Long),
            ("price", ColumnType::Double),
            ("paid", ColumnType::Boolean),
            ("at", ColumnType::Timestamp),
            ("status", ColumnType::String),
            ("attrs", ColumnType::Json),
        ])
    }

    fn row() -> Row {
        Row::new(vec![
            Value::Long(7),
            Value::String("widget".into()),
            Value::Long(3),
            Value::Double(9.5),
            Value::Boolean(true),
            Value::Timestamp(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()),
            Value::String("NEW".into()),
            Value::Json(json!({"a": 1})),
        ])
    }

    fn decode(bytes: &[u8]) -> AvroValue {
        apache_avro::from_avro_datum(target().schema(), &mut &bytes[..], None).unwrap()
    }

    #[test]
    fn decoded_record_matches_source_row() {
        let visitor = AvroColumnVisitor::new(&schema(), target(), &[]).unwrap();
        let bytes = visitor.encode(&row()).unwrap();
        let AvroValue::Record(fields) = decode(&bytes) else {
            panic!("expected a record");
        };
        let fields: HashMap<String, AvroValue> = fields.into_iter().collect();
        assert_eq!(fields["id"], AvroValue::Long(7));
        assert_eq!(
            fields["name"],
            AvroValue::Union(1, Box::new(AvroValue::String("widget".into())))
        );
        assert_eq!(fields["qty"], AvroValue::Int(3));
        assert_eq!(fields["price"], AvroValue::Union(1, Box::new(AvroValue::Double(9.5))));
        assert_eq!(fields["paid"], AvroValue::Boolean(true));
        assert_eq!(fields["at"], AvroValue::TimestampMillis(1_700_000_000_000));
        assert_eq!(fields["status"], AvroValue::Enum(0, "NEW".into()));
        assert_eq!(
            fields["attrs"],
            AvroValue::Map(HashMap::from([("a".to_string(), AvroValue::Long(1))]))
        );
        assert_eq!(fields["source"], AvroValue::String("batch".into()));
    }

    #[test]
    fn re_encoding_decoded_record_is_identical() {
        let visitor = AvroColumnVisitor::new(&schema(), target(), &[]).unwrap();
        let bytes = visitor.encode(&row()).unwrap();
        let again = apache_avro::to_avro_datum(target().schema(), decode(&bytes)).unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn column_missing_from_record_fails_at_bind_time() {
        let mut columns: Vec<(String, ColumnType)> = schema()
            .columns()
            .iter()
            .map(|c| (c.name.clone(), c.column_type))
            .collect();
        columns.push(("extra".into(), ColumnType::String));
        let err = AvroColumnVisitor::new(&Schema::new(columns), target(), &[]).unwrap_err();
        assert!(matches!(err, KafkaOutputError::Schema(_)));
        assert!(err.to_string().contains("extra"));
    }

    #[test]
    fn ignored_column_is_not_bound() {
        let mut columns: Vec<(String, ColumnType)> = schema()
            .columns()
            .iter()
            .map(|c| (c.name.clone(), c.column_type))
            .collect();
        columns.push(("extra".into(), ColumnType::String));
        let visitor =
            AvroColumnVisitor::new(&Schema::new(columns), target(), &["extra".to_string()]);
        assert!(visitor.is_ok());
    }

    #[test]
    fn incompatible_type_fails_at_bind_time() {
        let schema = Schema::new([("id", ColumnType::String), ("paid", ColumnType::Boolean)]);
        let err = AvroColumnVisitor::new(&schema, target(), &[]).unwrap_err();
        assert!(err.to_string().contains("'id'"));
    }

    #[test]
    fn required_field_without_column_or_default_fails() {
        let schema = Schema::new([("id", ColumnType::Long)]);
        let err = AvroColumnVisitor::new(&schema, target(), &[]).unwrap_err();
        assert!(err.to_string().contains("no matching column"));
    }

    #[test]
    fn null_handling_depends_on_nullability() {
        let visitor = AvroColumnVisitor::new(&schema(), target(), &[]).unwrap();

        let mut values = row().values().to_vec();
        values[1] = Value::Null;
        assert!(visitor.encode(&Row::new(values)).is_ok());

        let mut values = row().values().to_vec();
        values[0] = Value::Null;
        let err = visitor.encode(&Row::new(values)).unwrap_err();
        assert!(matches!(err, KafkaOutputError::Schema(_)));
        assert!(err.to_string().contains("non-nullable field 'id'"));
    }

    #[test]
    fn per_row_value_checks() {
        let visitor = AvroColumnVisitor::new(&schema(), target(), &[]).unwrap();

        let mut values = row().values().to_vec();
        values[2] = Value::Long(i64::from(i32::MAX) + 1);
        assert!(visitor.encode(&Row::new(values)).is_err());

        let mut values = row().values().to_vec();
        values[6] = Value::String("LOST".into());
        assert!(visitor.encode(&Row::new(values)).is_err());

        let mut values = row().values().to_vec();
        values[7] = Value::Json(json!({"a": "not a long"}));
        assert!(visitor.encode(&Row::new(values)).is_err());
    }

    #[test]
    fn json_column_into_string_field_is_compact_text() {
        let target = Arc::new(
            TargetSchema::parse(
                r#"{"type":"record","name":"Doc","fields":[{"name":"body","type":"string"}]}"#,
            )
            .unwrap(),
        );
        let schema = Schema::new([("body", ColumnType::Json)]);
        let visitor = AvroColumnVisitor::new(&schema, target, &[]).unwrap();
        let record = visitor
            .visit(&Row::new(vec![Value::Json(json!({"k": [1, 2]}))]))
            .unwrap();
        assert_eq!(
            record,
            AvroValue::Record(vec![(
                "body".into(),
                AvroValue::String(r#"{"k":[1,2]}"#.into())
            )])
        );
    }

    #[test]
    fn named_type_reused_by_reference_binds_and_encodes() {
        let target = Arc::new(
            TargetSchema::parse(
                r#"{"type":"record","name":"Change","namespace":"com.acme","fields":[
                    {"name":"status","type":{"type":"enum","name":"Status","symbols":["NEW","DONE"]}},
                    {"name":"previous","type":["null","Status"],"default":null},
                    {"name":"next","type":"Status"}
                ]}"#,
            )
            .unwrap(),
        );
        let schema = Schema::new([
            ("status", ColumnType::String),
            ("previous", ColumnType::String),
            ("next", ColumnType::String),
        ]);
        let visitor = AvroColumnVisitor::new(&schema, Arc::clone(&target), &[]).unwrap();
        let row = Row::new(vec![
            Value::String("DONE".into()),
            Value::String("NEW".into()),
            Value::String("DONE".into()),
        ]);
        let bytes = visitor.encode(&row).unwrap();
        let decoded = apache_avro::from_avro_datum(target.schema(), &mut &bytes[..], None).unwrap();
        assert_eq!(
            decoded,
            AvroValue::Record(vec![
                ("status".into(), AvroValue::Enum(1, "DONE".into())),
                (
                    "previous".into(),
                    AvroValue::Union(1, Box::new(AvroValue::Enum(0, "NEW".into())))
                ),
                ("next".into(), AvroValue::Enum(1, "DONE".into())),
            ])
        );

        let bad = Row::new(vec![
            Value::String("DONE".into()),
            Value::Null,
            Value::String("LOST".into()),
        ]);
        assert!(visitor.encode(&bad).is_err());
    }

    #[test]
    fn json_null_fills_nullable_record_field() {
        let target = Arc::new(
            TargetSchema::parse(
                r#"{"type":"record","name":"Doc","fields":[
                    {"name":"body","type":["null",{"type":"record","name":"B","fields":[{"name":"k","type":"long"}]}]}
                ]}"#,
            )
            .unwrap(),
        );
        let schema = Schema::new([("body", ColumnType::Json)]);
        let visitor = AvroColumnVisitor::new(&schema, Arc::clone(&target), &[]).unwrap();

        let record = visitor.visit(&Row::new(vec![Value::Json(json!(null))])).unwrap();
        assert_eq!(
            record,
            AvroValue::Record(vec![(
                "body".into(),
                AvroValue::Union(0, Box::new(AvroValue::Null))
            )])
        );
        assert!(visitor.encode(&Row::new(vec![Value::Json(json!(null))])).is_ok());
        assert!(visitor.encode(&Row::new(vec![Value::Json(json!({"k": 4}))])).is_ok());
    }
}
