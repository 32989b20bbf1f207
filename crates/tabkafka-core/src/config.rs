//! Job configuration loaded from YAML.
//!
//! A job file has a `source` section describing the tabular input and an
//! `output` section describing the Kafka destination:
//!
//! ```yaml
//! name: "orders-to-kafka"
//! source:
//!   type: file_csv
//!   path: "data/orders-*.csv"
//!   has_header: true
//! output:
//!   brokers: ["localhost:9092"]
//!   topic: "orders"
//!   serialize_format: json
//!   key_column_name: "id"
//! ```
//!
//! [`parse_job`] is a pure function: it deserializes and validates, and any
//! problem comes back as [`KafkaOutputError::Configuration`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::KafkaOutputError;

/// Complete job specification loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable name of the job, used in logs
    pub name: String,

    /// Tabular input; every file it matches becomes one task
    pub source: SourceSpec,

    /// Kafka destination
    pub output: KafkaOutputConfig,
}

impl JobSpec {
    pub fn from_path(path: &Path) -> Result<Self, KafkaOutputError> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            KafkaOutputError::config(format!("cannot read job file {}: {e}", path.display()))
        })?;
        debug!("Loaded job file {}", path.display());
        parse_job(&yaml)
    }
}

/// Parse and validate a job file.
pub fn parse_job(yaml: &str) -> Result<JobSpec, KafkaOutputError> {
    let spec: JobSpec = serde_yaml::from_str(yaml)?;
    spec.output.validate()?;
    Ok(spec)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    #[serde(rename = "file_csv")]
    Csv(CsvSourceSpec),
    #[serde(rename = "parquet")]
    Parquet(ParquetSourceSpec),
}

impl SourceSpec {
    /// File path or glob pattern of the input.
    pub fn path(&self) -> &str {
        match self {
            SourceSpec::Csv(spec) => &spec.path,
            SourceSpec::Parquet(spec) => &spec.path,
        }
    }
}

/// Configuration for CSV file sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvSourceSpec {
    /// Identifier used for the source operators of this job
    #[serde(default = "default_csv_id")]
    pub id: String,

    /// File path or glob pattern for CSV files to process
    ///
    /// Examples: "data.csv", "data/*.csv"
    pub path: String,

    /// Whether the CSV file has a header row
    ///
    /// Without a header, columns are named column_1, column_2, ...
    #[serde(default = "default_true")]
    pub has_header: bool,

    /// Number of rows to read per batch
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,

    /// Text columns holding JSON documents
    ///
    /// These columns are typed `json` and embedded as nested values rather
    /// than strings.
    #[serde(default)]
    pub json_columns: Vec<String>,
}

/// Configuration for Parquet file sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetSourceSpec {
    #[serde(default = "default_parquet_id")]
    pub id: String,

    /// File path or glob pattern for Parquet files to process
    pub path: String,

    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
}

/// Wire encoding of message values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SerializeFormat {
    /// Self-describing JSON object per row
    Json,
    /// Avro datum framed with a schema registry id
    AvroWithSchemaRegistry,
}

/// Accepted names for [`SerializeFormat`]; the first entry per variant is canonical.
const SERIALIZE_FORMAT_NAMES: &[(SerializeFormat, &str)] = &[
    (SerializeFormat::Json, "json"),
    (SerializeFormat::Json, "plain"),
    (SerializeFormat::AvroWithSchemaRegistry, "avro_with_schema_registry"),
    (SerializeFormat::AvroWithSchemaRegistry, "registry_binary"),
];

impl SerializeFormat {
    pub fn as_str(&self) -> &'static str {
        SERIALIZE_FORMAT_NAMES
            .iter()
            .find(|(f, _)| f == self)
            .map(|(_, name)| *name)
            .unwrap_or("json")
    }
}

impl FromStr for SerializeFormat {
    type Err = KafkaOutputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        SERIALIZE_FORMAT_NAMES
            .iter()
            .find(|(_, name)| *name == lower)
            .map(|(f, _)| *f)
            .ok_or_else(|| {
                KafkaOutputError::config(format!(
                    "unknown serialize format '{s}'. Supported formats are json, avro_with_schema_registry"
                ))
            })
    }
}

impl TryFrom<String> for SerializeFormat {
    type Error = KafkaOutputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SerializeFormat> for String {
    fn from(value: SerializeFormat) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SerializeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the registry subject of a value schema is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SubjectNameStrategy {
    /// `<topic>-value`
    #[default]
    TopicName,
    /// `<record full name>`
    RecordName,
    /// `<topic>-<record full name>`
    TopicRecordName,
}

const SUBJECT_STRATEGY_NAMES: &[(SubjectNameStrategy, &str)] = &[
    (SubjectNameStrategy::TopicName, "TopicNameStrategy"),
    (SubjectNameStrategy::RecordName, "RecordNameStrategy"),
    (SubjectNameStrategy::TopicRecordName, "TopicRecordNameStrategy"),
];

/// Package of the registry client's strategy classes, accepted as a prefix.
const SUBJECT_STRATEGY_PACKAGE: &str = "io.confluent.kafka.serializers.subject.";

impl SubjectNameStrategy {
    pub fn as_str(&self) -> &'static str {
        SUBJECT_STRATEGY_NAMES
            .iter()
            .find(|(s, _)| s == self)
            .map(|(_, name)| *name)
            .unwrap_or("TopicNameStrategy")
    }

    /// Subject for a value schema with record `full_name` written to `topic`.
    pub fn subject(&self, topic: &str, full_name: &str) -> String {
        match self {
            SubjectNameStrategy::TopicName => format!("{topic}-value"),
            SubjectNameStrategy::RecordName => full_name.to_string(),
            SubjectNameStrategy::TopicRecordName => format!("{topic}-{full_name}"),
        }
    }
}

impl FromStr for SubjectNameStrategy {
    type Err = KafkaOutputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = s.strip_prefix(SUBJECT_STRATEGY_PACKAGE).unwrap_or(s);
        SUBJECT_STRATEGY_NAMES
            .iter()
            .find(|(_, name)| *name == short)
            .map(|(strategy, _)| *strategy)
            .ok_or_else(|| {
                KafkaOutputError::config(format!("unknown value_subject_name_strategy '{s}'"))
            })
    }
}

impl TryFrom<String> for SubjectNameStrategy {
    type Error = KafkaOutputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SubjectNameStrategy> for String {
    fn from(value: SubjectNameStrategy) -> Self {
        value.as_str().to_string()
    }
}

/// Configuration of the Kafka output
///
/// Field names follow the keys of the `output` section of a job file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaOutputConfig {
    /// Bootstrap endpoints of the cluster
    ///
    /// Example: ["broker1:9092", "broker2:9092"]
    pub brokers: Vec<String>,

    /// Destination topic, unless `topic_column` overrides it per row
    pub topic: String,

    /// Column holding the destination topic of each row
    #[serde(default)]
    pub topic_column: Option<String>,

    /// Encoding of message values
    pub serialize_format: SerializeFormat,

    /// Schema registry endpoint, required for avro_with_schema_registry
    #[serde(default)]
    pub schema_registry_url: Option<String>,

    /// Inline Avro schema declaration
    #[serde(default)]
    pub avsc: Option<serde_json::Value>,

    /// Path of a file holding the Avro schema declaration
    #[serde(default)]
    pub avsc_file: Option<PathBuf>,

    /// Column whose value becomes the message key
    #[serde(default)]
    pub key_column_name: Option<String>,

    /// Column whose value selects the partition explicitly
    #[serde(default)]
    pub partition_column_name: Option<String>,

    /// Client-side batching threshold in bytes
    #[serde(default = "default_record_batch_size")]
    pub record_batch_size: u32,

    /// Acknowledgment level required per publish: "0", "1", "all" or "-1"
    #[serde(default = "default_acks")]
    pub acks: String,

    /// Client-internal retry count on transient send failure
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Free-form client properties passed to the producer
    ///
    /// Typed options above win when both set the same property.
    #[serde(default)]
    pub other_producer_configs: BTreeMap<String, String>,

    /// Columns left out of the message value
    #[serde(default)]
    pub ignore_columns: Vec<String>,

    /// Registry subject naming, defaults to TopicNameStrategy
    #[serde(default)]
    pub value_subject_name_strategy: Option<SubjectNameStrategy>,
}

impl KafkaOutputConfig {
    /// Minimal configuration for `topic` on `brokers` with every option defaulted.
    pub fn new(brokers: &[&str], topic: &str, serialize_format: SerializeFormat) -> Self {
        Self {
            brokers: brokers.iter().map(|b| b.to_string()).collect(),
            topic: topic.to_string(),
            topic_column: None,
            serialize_format,
            schema_registry_url: None,
            avsc: None,
            avsc_file: None,
            key_column_name: None,
            partition_column_name: None,
            record_batch_size: default_record_batch_size(),
            acks: default_acks(),
            retries: default_retries(),
            other_producer_configs: BTreeMap::new(),
            ignore_columns: Vec::new(),
            value_subject_name_strategy: None,
        }
    }

    /// Validate option values that do not depend on the row schema.
    pub fn validate(&self) -> Result<(), KafkaOutputError> {
        if self.brokers.is_empty() || self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(KafkaOutputError::config("brokers must list at least one endpoint"));
        }
        if self.topic.trim().is_empty() {
            return Err(KafkaOutputError::config("topic must not be empty"));
        }
        if self.record_batch_size == 0 {
            return Err(KafkaOutputError::config("record_batch_size must be positive"));
        }
        if !matches!(self.acks.as_str(), "0" | "1" | "all" | "-1") {
            return Err(KafkaOutputError::config(format!(
                "acks must be one of 0, 1, all, -1 but was '{}'",
                self.acks
            )));
        }
        for (name, label) in [
            (&self.topic_column, "topic_column"),
            (&self.key_column_name, "key_column_name"),
            (&self.partition_column_name, "partition_column_name"),
        ] {
            if matches!(name, Some(n) if n.trim().is_empty()) {
                return Err(KafkaOutputError::config(format!("{label} must not be empty")));
            }
        }
        if self.serialize_format == SerializeFormat::AvroWithSchemaRegistry
            && self.schema_registry_url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(KafkaOutputError::config(
                "avro_with_schema_registry format needs schema_registry_url",
            ));
        }
        Ok(())
    }

    /// Subject naming strategy, with the default applied.
    pub fn subject_name_strategy(&self) -> SubjectNameStrategy {
        self.value_subject_name_strategy.unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

/// Default number of rows per batch read from a source
fn default_batch_rows() -> usize {
    65536
}

fn default_csv_id() -> String {
    "csv-source".to_string()
}

fn default_parquet_id() -> String {
    "parquet-source".to_string()
}

fn default_record_batch_size() -> u32 {
    16384
}

fn default_acks() -> String {
    "1".to_string()
}

fn default_retries() -> u32 {
    1
}
