//! Row schema and typed row values.
//!
//! A [`Schema`] is resolved once per task from the source's Arrow schema and is
//! never mutated afterwards. Every [`Row`] handed to the Kafka output is
//! positionally aligned with it.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::KafkaOutputError;

/// Logical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    String,
    Long,
    Double,
    Boolean,
    Timestamp,
    Json,
}

/// Name table for [`ColumnType`], used in both directions.
const COLUMN_TYPE_NAMES: &[(ColumnType, &str)] = &[
    (ColumnType::String, "string"),
    (ColumnType::Long, "long"),
    (ColumnType::Double, "double"),
    (ColumnType::Boolean, "boolean"),
    (ColumnType::Timestamp, "timestamp"),
    (ColumnType::Json, "json"),
];

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        COLUMN_TYPE_NAMES
            .iter()
            .find(|(t, _)| t == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = KafkaOutputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        COLUMN_TYPE_NAMES
            .iter()
            .find(|(_, name)| *name == lower)
            .map(|(t, _)| *t)
            .ok_or_else(|| KafkaOutputError::config(format!("unknown column type '{s}'")))
    }
}

/// A named, typed field of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub index: usize,
    pub name: String,
    pub column_type: ColumnType,
}

/// Ordered column list shared read-only between the components of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Arc<[Column]>,
}

impl Schema {
    /// Build a schema from `(name, type)` pairs, assigning positional indexes.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = (S, ColumnType)>,
        S: Into<String>,
    {
        let columns: Vec<Column> = columns
            .into_iter()
            .enumerate()
            .map(|(index, (name, column_type))| Column {
                index,
                name: name.into(),
                column_type,
            })
            .collect();
        Self {
            columns: columns.into(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check that each value of `row` matches the declared type of its column.
    pub fn check_row(&self, row: &Row) -> Result<(), KafkaOutputError> {
        if row.len() != self.len() {
            return Err(KafkaOutputError::schema(format!(
                "row has {} values but schema has {} columns",
                row.len(),
                self.len()
            )));
        }
        for (column, value) in self.columns.iter().zip(row.values()) {
            if let Some(actual) = value.column_type() {
                if actual != column.column_type {
                    return Err(KafkaOutputError::schema(format!(
                        "column '{}' is declared {} but holds a {} value",
                        column.name, column.column_type, actual
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One typed cell of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl Value {
    /// Type carried by the value; `None` for null, which fits any column.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(ColumnType::String),
            Value::Long(_) => Some(ColumnType::Long),
            Value::Double(_) => Some(ColumnType::Double),
            Value::Boolean(_) => Some(ColumnType::Boolean),
            Value::Timestamp(_) => Some(ColumnType::Timestamp),
            Value::Json(_) => Some(ColumnType::Json),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Plain text form, used for message keys. `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Long(v) => Some(v.to_string()),
            Value::Double(v) => Some(v.to_string()),
            Value::Boolean(v) => Some(v.to_string()),
            Value::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::Json(v) => Some(v.to_string()),
        }
    }
}

/// Values of one source record, positionally aligned with a [`Schema`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> &Value {
        self.values.get(index).unwrap_or(&Value::Null)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}
