//! Per-row destination routing.
//!
//! The router resolves the configured routing columns against the task's
//! schema once, then reads topic, key and partition out of each row.

use std::collections::HashMap;

use tabkafka_core::{ColumnType, KafkaOutputConfig, KafkaOutputError, Row, Schema, Value};

/// Routing columns and static fallback topic, taken from the output config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingConfig {
    pub topic: String,
    pub topic_column: Option<String>,
    pub key_column: Option<String>,
    pub partition_column: Option<String>,
}

impl From<&KafkaOutputConfig> for RoutingConfig {
    fn from(config: &KafkaOutputConfig) -> Self {
        Self {
            topic: config.topic.clone(),
            topic_column: config.topic_column.clone(),
            key_column: config.key_column_name.clone(),
            partition_column: config.partition_column_name.clone(),
        }
    }
}

/// Where one row is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub partition: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct RecordRouter {
    static_topic: String,
    topic_index: Option<usize>,
    key_index: Option<usize>,
    partition_index: Option<usize>,
    partition_counts: HashMap<String, i32>,
}

impl RecordRouter {
    /// Resolve routing columns against `schema`.
    pub fn new(config: &RoutingConfig, schema: &Schema) -> Result<Self, KafkaOutputError> {
        let topic_index = resolve(schema, "topic_column", &config.topic_column, Some(ColumnType::String))?;
        let key_index = resolve(schema, "key_column_name", &config.key_column, None)?;
        let partition_index = resolve(
            schema,
            "partition_column_name",
            &config.partition_column,
            Some(ColumnType::Long),
        )?;
        Ok(Self {
            static_topic: config.topic.clone(),
            topic_index,
            key_index,
            partition_index,
            partition_counts: HashMap::new(),
        })
    }

    /// Whether rows carry an explicit partition that needs range checking.
    pub fn routes_partitions(&self) -> bool {
        self.partition_index.is_some()
    }

    /// Record the partition count of `topic` for range checks.
    pub fn remember_partition_count(&mut self, topic: &str, count: i32) {
        self.partition_counts.insert(topic.to_string(), count);
    }

    pub fn partition_count(&self, topic: &str) -> Option<i32> {
        self.partition_counts.get(topic).copied()
    }

    /// Topic, key and partition of `row`. The partition is not range checked
    /// here, see [`check_partition`].
    pub fn route(&self, row: &Row) -> Result<Destination, KafkaOutputError> {
        let topic = match self.topic_index {
            None => self.static_topic.clone(),
            Some(index) => match row.get(index) {
                Value::String(topic) if !topic.is_empty() => topic.clone(),
                Value::Null => {
                    return Err(KafkaOutputError::routing("topic column is null"));
                }
                _ => return Err(KafkaOutputError::routing("topic column is empty")),
            },
        };

        let key = self
            .key_index
            .and_then(|index| row.get(index).to_text())
            .map(String::into_bytes);

        let partition = match self.partition_index {
            None => None,
            Some(index) => match row.get(index) {
                Value::Long(p) => Some(i32::try_from(*p).map_err(|_| {
                    KafkaOutputError::routing(format!("partition {p} is out of range"))
                })?),
                Value::Null => return Err(KafkaOutputError::routing("partition column is null")),
                other => {
                    return Err(KafkaOutputError::routing(format!(
                        "partition column holds a non-integer value {other:?}"
                    )));
                }
            },
        };

        Ok(Destination {
            topic,
            key,
            partition,
        })
    }
}

/// Reject partitions outside `[0, count)` for `topic`.
pub fn check_partition(topic: &str, partition: i32, count: i32) -> Result<(), KafkaOutputError> {
    if (0..count).contains(&partition) {
        Ok(())
    } else {
        Err(KafkaOutputError::routing(format!(
            "partition {partition} is out of range for topic '{topic}' with {count} partitions"
        )))
    }
}

fn resolve(
    schema: &Schema,
    option: &str,
    column: &Option<String>,
    required: Option<ColumnType>,
) -> Result<Option<usize>, KafkaOutputError> {
    let Some(name) = column else {
        return Ok(None);
    };
    let column = schema.column(name).ok_or_else(|| {
        KafkaOutputError::config(format!("{option} '{name}' is not a column of the input"))
    })?;
    match required {
        Some(expected) if column.column_type != expected => Err(KafkaOutputError::config(format!(
            "{option} '{name}' must be of type {expected}, found {}",
            column.column_type
        ))),
        _ => Ok(Some(column.index)),
    }
}
