//! Conversion from Arrow record batches to typed rows.

use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{
    Date32Type, Date64Type, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt8Type,
};
use arrow_array::{Array, ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, TimeUnit};
use chrono::{DateTime, Utc};
use tabkafka_core::{Column, ColumnType, KafkaOutputError, Row, Schema, Value};

/// Field metadata key naming an Arrow extension type.
pub const EXTENSION_NAME_KEY: &str = "ARROW:extension:name";

/// Canonical Arrow extension name for JSON text columns.
pub const JSON_EXTENSION_NAME: &str = "arrow.json";

/// Map an Arrow schema onto row columns.
pub fn schema_from_arrow(schema: &arrow_schema::Schema) -> Result<Schema, KafkaOutputError> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| Ok((field.name().clone(), column_type_of(field)?)))
        .collect::<Result<Vec<_>, KafkaOutputError>>()?;
    Ok(Schema::new(columns))
}

fn column_type_of(field: &Field) -> Result<ColumnType, KafkaOutputError> {
    let is_json = field
        .metadata()
        .get(EXTENSION_NAME_KEY)
        .is_some_and(|name| name == JSON_EXTENSION_NAME);
    let column_type = match field.data_type() {
        DataType::Utf8 | DataType::LargeUtf8 if is_json => ColumnType::Json,
        DataType::Utf8 | DataType::LargeUtf8 => ColumnType::String,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32 => ColumnType::Long,
        DataType::Float32 | DataType::Float64 => ColumnType::Double,
        DataType::Boolean => ColumnType::Boolean,
        DataType::Timestamp(_, _) | DataType::Date32 | DataType::Date64 => ColumnType::Timestamp,
        other => {
            return Err(KafkaOutputError::schema(format!(
                "column '{}' has unsupported type {other}",
                field.name()
            )));
        }
    };
    Ok(column_type)
}

/// Mark a text field as holding JSON documents.
pub fn with_json_extension(field: &Field) -> Field {
    let mut metadata = field.metadata().clone();
    metadata.insert(EXTENSION_NAME_KEY.to_string(), JSON_EXTENSION_NAME.to_string());
    field.clone().with_metadata(metadata)
}

/// Read row `index` of `batch`. `schema` must come from [`schema_from_arrow`]
/// applied to the batch's schema.
pub fn row_at(batch: &RecordBatch, schema: &Schema, index: usize) -> Result<Row, KafkaOutputError> {
    let values = schema
        .columns()
        .iter()
        .map(|column| value_at(batch.column(column.index), column, index))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Row::new(values))
}

/// Read every row of `batch`.
pub fn rows_of(batch: &RecordBatch, schema: &Schema) -> Result<Vec<Row>, KafkaOutputError> {
    (0..batch.num_rows()).map(|i| row_at(batch, schema, i)).collect()
}

fn value_at(array: &ArrayRef, column: &Column, i: usize) -> Result<Value, KafkaOutputError> {
    if array.is_null(i) {
        return Ok(Value::Null);
    }
    let value = match array.data_type() {
        DataType::Utf8 => text_value(array.as_string::<i32>().value(i), column)?,
        DataType::LargeUtf8 => text_value(array.as_string::<i64>().value(i), column)?,
        DataType::Int8 => Value::Long(array.as_primitive::<Int8Type>().value(i).into()),
        DataType::Int16 => Value::Long(array.as_primitive::<Int16Type>().value(i).into()),
        DataType::Int32 => Value::Long(array.as_primitive::<Int32Type>().value(i).into()),
        DataType::Int64 => Value::Long(array.as_primitive::<Int64Type>().value(i)),
        DataType::UInt8 => Value::Long(array.as_primitive::<UInt8Type>().value(i).into()),
        DataType::UInt16 => Value::Long(array.as_primitive::<UInt16Type>().value(i).into()),
        DataType::UInt32 => Value::Long(array.as_primitive::<UInt32Type>().value(i).into()),
        DataType::Float32 => Value::Double(array.as_primitive::<Float32Type>().value(i).into()),
        DataType::Float64 => Value::Double(array.as_primitive::<Float64Type>().value(i)),
        DataType::Boolean => Value::Boolean(array.as_boolean().value(i)),
        DataType::Timestamp(unit, _) => {
            let raw = match unit {
                TimeUnit::Second => array.as_primitive::<TimestampSecondType>().value(i),
                TimeUnit::Millisecond => array.as_primitive::<TimestampMillisecondType>().value(i),
                TimeUnit::Microsecond => array.as_primitive::<TimestampMicrosecondType>().value(i),
                TimeUnit::Nanosecond => array.as_primitive::<TimestampNanosecondType>().value(i),
            };
            Value::Timestamp(timestamp(raw, unit, &column.name)?)
        }
        DataType::Date32 => {
            let days = i64::from(array.as_primitive::<Date32Type>().value(i));
            Value::Timestamp(timestamp(days * 86_400, &TimeUnit::Second, &column.name)?)
        }
        DataType::Date64 => {
            let millis = array.as_primitive::<Date64Type>().value(i);
            Value::Timestamp(timestamp(millis, &TimeUnit::Millisecond, &column.name)?)
        }
        other => {
            return Err(KafkaOutputError::schema(format!(
                "column '{}' has unsupported type {other}",
                column.name
            )));
        }
    };
    Ok(value)
}

fn text_value(text: &str, column: &Column) -> Result<Value, KafkaOutputError> {
    if column.column_type != ColumnType::Json {
        return Ok(Value::String(text.to_string()));
    }
    serde_json::from_str(text).map(Value::Json).map_err(|e| {
        KafkaOutputError::schema(format!("column '{}' is not valid JSON: {e}", column.name))
    })
}

fn timestamp(raw: i64, unit: &TimeUnit, column: &str) -> Result<DateTime<Utc>, KafkaOutputError> {
    let per_second: i64 = match unit {
        TimeUnit::Second => 1,
        TimeUnit::Millisecond => 1_000,
        TimeUnit::Microsecond => 1_000_000,
        TimeUnit::Nanosecond => 1_000_000_000,
    };
    let secs = raw.div_euclid(per_second);
    let nanos = (raw.rem_euclid(per_second) * (1_000_000_000 / per_second)) as u32;
    DateTime::from_timestamp(secs, nanos).ok_or_else(|| {
        KafkaOutputError::schema(format!("column '{column}': timestamp {raw} is out of range"))
    })
}

/// Share an Arrow field list as a schema reference.
pub fn arrow_schema_ref(fields: Vec<Field>) -> arrow_schema::SchemaRef {
    Arc::new(arrow_schema::Schema::new(fields))
}
