//! Resolution of the target Avro record schema.
//!
//! In `avro_with_schema_registry` mode exactly one of `avsc` (inline) and
//! `avsc_file` (path) must be configured. The parsed schema is loaded once per
//! job and shared read-only by every task.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use apache_avro::Schema as AvroSchema;
use apache_avro::schema::{Name, RecordSchema, ResolvedSchema};
use tabkafka_core::{KafkaOutputConfig, KafkaOutputError};
use tracing::{debug, info};

/// Avro record schema that every message value must conform to.
#[derive(Debug, Clone)]
pub struct TargetSchema {
    schema: AvroSchema,
    full_name: String,
    declaration: String,
    names: HashMap<Name, AvroSchema>,
}

impl TargetSchema {
    /// Parse a schema declaration; the top level must be a record.
    pub fn parse(text: &str) -> Result<Self, KafkaOutputError> {
        let schema = AvroSchema::parse_str(text)
            .map_err(|e| KafkaOutputError::schema(format!("cannot parse avro schema: {e}")))?;
        let full_name = match &schema {
            AvroSchema::Record(RecordSchema { name, .. }) => name.fullname(None),
            other => {
                return Err(KafkaOutputError::schema(format!(
                    "avro schema must be a record, got {}",
                    other.canonical_form()
                )));
            }
        };
        let names = ResolvedSchema::try_from(&schema)
            .map_err(|e| KafkaOutputError::schema(format!("cannot resolve avro schema: {e}")))?
            .get_names()
            .iter()
            .map(|(name, schema)| (name.clone(), (*schema).clone()))
            .collect();
        Ok(Self {
            schema,
            full_name,
            declaration: text.to_string(),
            names,
        })
    }

    pub fn schema(&self) -> &AvroSchema {
        &self.schema
    }

    /// Fully qualified record name, used by record-based subject strategies.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Schema text as declared, the text registered with the schema registry.
    pub fn declaration(&self) -> &str {
        &self.declaration
    }

    /// Parsing canonical form, for logs and comparisons.
    pub fn canonical_form(&self) -> String {
        self.schema.canonical_form()
    }

    /// Follow named references until a concrete schema is reached.
    pub fn resolve<'a>(&'a self, mut schema: &'a AvroSchema) -> &'a AvroSchema {
        while let AvroSchema::Ref { name } = schema {
            match self.names.get(name) {
                Some(named) => schema = named,
                None => break,
            }
        }
        schema
    }

    pub fn record(&self) -> &RecordSchema {
        match &self.schema {
            AvroSchema::Record(record) => record,
            _ => unreachable!("TargetSchema::parse only accepts records"),
        }
    }
}

/// Load the target schema from `avsc` or `avsc_file`.
pub fn resolve_target_schema(
    config: &KafkaOutputConfig,
) -> Result<Arc<TargetSchema>, KafkaOutputError> {
    let text = match (&config.avsc, &config.avsc_file) {
        (Some(inline), None) => {
            debug!("Using inline avro schema");
            serde_json::to_string(inline)
                .map_err(|e| KafkaOutputError::config(format!("avsc is not valid JSON: {e}")))?
        }
        (None, Some(path)) => read_schema_file(path)?,
        _ => {
            return Err(KafkaOutputError::config(
                "avro_with_schema_registry format needs either one of avsc and avsc_file",
            ));
        }
    };
    let schema = TargetSchema::parse(&text)?;
    info!(
        record = schema.full_name(),
        fields = schema.record().fields.len(),
        "Resolved target avro schema"
    );
    Ok(Arc::new(schema))
}

fn read_schema_file(path: &Path) -> Result<String, KafkaOutputError> {
    debug!("Reading avro schema from {}", path.display());
    std::fs::read_to_string(path).map_err(|e| {
        KafkaOutputError::config(format!("avsc_file {} cannot be read: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tabkafka_core::SerializeFormat;

    const ORDER: &str = r#"{
        "type": "record",
        "name": "Order",
        "namespace": "com.acme",
        "fields": [
            {"name": "id", "type": "long"},
            {"name": "name", "type": ["null", "string"], "default": null}
        ]
    }"#;

    fn registry_config() -> KafkaOutputConfig {
        let mut config = KafkaOutputConfig::new(
            &["localhost:9092"],
            "orders",
            SerializeFormat::AvroWithSchemaRegistry,
        );
        config.schema_registry_url = Some("http://localhost:8081".into());
        config
    }

    fn schema_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ORDER.as_bytes()).unwrap();
        file
    }

    #[test]
    fn inline_schema_resolves() {
        let mut config = registry_config();
        config.avsc = Some(serde_json::from_str(ORDER).unwrap());
        let schema = resolve_target_schema(&config).unwrap();
        assert_eq!(schema.full_name(), "com.acme.Order");
        assert_eq!(schema.record().fields.len(), 2);
    }

    #[test]
    fn file_schema_resolves() {
        let file = schema_file();
        let mut config = registry_config();
        config.avsc_file = Some(file.path().to_path_buf());
        let schema = resolve_target_schema(&config).unwrap();
        assert_eq!(schema.full_name(), "com.acme.Order");
        assert!(schema.canonical_form().contains("com.acme.Order"));
        assert_eq!(schema.declaration(), ORDER);
    }

    #[test]
    fn declaration_keeps_logical_types_and_defaults() {
        let mut config = registry_config();
        config.avsc = Some(serde_json::json!({
            "type": "record",
            "name": "Order",
            "fields": [
                {"name": "at", "type": {"type": "long", "logicalType": "timestamp-millis"}},
                {"name": "source", "type": "string", "default": "batch"}
            ]
        }));
        let schema = resolve_target_schema(&config).unwrap();
        assert!(schema.declaration().contains(r#""logicalType":"timestamp-millis""#));
        assert!(schema.declaration().contains(r#""default":"batch""#));
        assert!(!schema.canonical_form().contains("logicalType"));
    }

    #[test]
    fn named_references_resolve_to_their_definition() {
        let schema = TargetSchema::parse(
            r#"{"type":"record","name":"Change","namespace":"com.acme","fields":[
                {"name":"status","type":{"type":"enum","name":"Status","symbols":["NEW","DONE"]}},
                {"name":"previous","type":"Status"}
            ]}"#,
        )
        .unwrap();
        let previous = &schema.record().fields[1].schema;
        assert!(matches!(previous, AvroSchema::Ref { .. }));
        assert!(matches!(schema.resolve(previous), AvroSchema::Enum(_)));
    }

    #[test]
    fn exactly_one_source_is_required() {
        let file = schema_file();

        let neither = registry_config();
        let err = resolve_target_schema(&neither).unwrap_err();
        assert!(matches!(err, KafkaOutputError::Configuration(_)));

        let mut both = registry_config();
        both.avsc = Some(serde_json::from_str(ORDER).unwrap());
        both.avsc_file = Some(file.path().to_path_buf());
        let err = resolve_target_schema(&both).unwrap_err();
        assert!(matches!(err, KafkaOutputError::Configuration(_)));
    }

    #[test]
    fn unreadable_file_is_configuration_error() {
        let mut config = registry_config();
        config.avsc_file = Some("/nonexistent/order.avsc".into());
        let err = resolve_target_schema(&config).unwrap_err();
        assert!(matches!(err, KafkaOutputError::Configuration(_)));
    }

    #[test]
    fn unparsable_or_non_record_schema_is_schema_error() {
        assert!(matches!(
            TargetSchema::parse("{not json"),
            Err(KafkaOutputError::Schema(_))
        ));
        assert!(matches!(
            TargetSchema::parse(r#""string""#),
            Err(KafkaOutputError::Schema(_))
        ));
    }
}
