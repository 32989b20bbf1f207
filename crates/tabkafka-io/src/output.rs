//! Job-level entry point of the Kafka output.
//!
//! [`KafkaOutput::prepare`] validates the configuration and resolves the target
//! schema without touching the cluster. [`KafkaOutput::transaction`] adds the
//! pre-flight topic check; it must succeed before any task is opened.

use std::sync::Arc;

use tabkafka_core::{KafkaOutputConfig, KafkaOutputError, Schema, SerializeFormat};
use tracing::info;

use crate::avsc::resolve_target_schema;
use crate::preflight::{PreflightGate, TopicDescriber, TopicDescription};
use crate::producer::{ProducerFactory, PublishClient};
use crate::publisher::{TaskReport, TransactionalPublisher};
use crate::registry::SchemaRegistry;

#[derive(Clone)]
pub struct KafkaOutput {
    config: Arc<KafkaOutputConfig>,
    factory: ProducerFactory,
    destination: Option<TopicDescription>,
}

impl KafkaOutput {
    /// Validate `config` and resolve the target schema.
    pub fn prepare(config: KafkaOutputConfig) -> Result<Self, KafkaOutputError> {
        config.validate()?;
        let target = match config.serialize_format {
            SerializeFormat::AvroWithSchemaRegistry => Some(resolve_target_schema(&config)?),
            SerializeFormat::Json => None,
        };
        let config = Arc::new(config);
        let factory = ProducerFactory::new(Arc::clone(&config), target)?;
        info!(
            topic = %config.topic,
            format = config.serialize_format.as_str(),
            "Kafka output prepared"
        );
        Ok(Self {
            config,
            factory,
            destination: None,
        })
    }

    /// Prepare the output and confirm that the destination topic exists.
    pub async fn transaction(
        config: KafkaOutputConfig,
        describer: Arc<dyn TopicDescriber>,
    ) -> Result<Self, KafkaOutputError> {
        let mut output = Self::prepare(config)?;
        let description = PreflightGate::new(describer)
            .check(&output.config.topic)
            .await?;
        output.destination = Some(description);
        Ok(output)
    }

    /// Use `registry` instead of the HTTP registry client.
    pub fn with_registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.factory = self.factory.with_registry(registry);
        self
    }

    pub fn config(&self) -> &KafkaOutputConfig {
        &self.config
    }

    /// Pre-flight result for the static topic, once checked.
    pub fn destination(&self) -> Option<TopicDescription> {
        self.destination
    }

    /// Open task `task` with its own Kafka producer.
    pub fn open(&self, task: usize, schema: Schema) -> Result<TransactionalPublisher, KafkaOutputError> {
        TransactionalPublisher::open(task, &self.factory, schema, self.destination)
    }

    /// Open task `task` on a caller-supplied client.
    pub fn open_with_client(
        &self,
        task: usize,
        client: Box<dyn PublishClient>,
        schema: Schema,
    ) -> Result<TransactionalPublisher, KafkaOutputError> {
        TransactionalPublisher::open_with_client(task, client, &self.factory, schema, self.destination)
    }

    /// Always rejected: every run is a single attempt.
    pub fn resume(&self) -> Result<Vec<TaskReport>, KafkaOutputError> {
        Err(KafkaOutputError::unsupported(
            "resuming a Kafka output job is not supported",
        ))
    }

    /// Nothing to clean up; messages already published stay published.
    pub fn cleanup(&self) {
        info!(topic = %self.config.topic, "Kafka output finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preflight::tests::StaticTopics;
    use crate::publisher::PublisherState;
    use crate::publisher::tests::MemoryClient;
    use crate::registry::tests::MemoryRegistry;
    use tabkafka_core::{ColumnType, Row, Value};

    fn json_config() -> KafkaOutputConfig {
        KafkaOutputConfig::new(&["localhost:9092"], "orders", SerializeFormat::Json)
    }

    async fn output(config: KafkaOutputConfig) -> KafkaOutput {
        KafkaOutput::transaction(config, Arc::new(StaticTopics::with(&[("orders", 3)])))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn plain_row_goes_to_static_topic() {
        let output = output(json_config()).await;
        assert_eq!(output.destination(), Some(TopicDescription { partitions: 3 }));

        let client = MemoryClient::default();
        let sent = Arc::clone(&client.sent);
        let schema = Schema::new([("id", ColumnType::Long), ("name", ColumnType::String)]);
        let mut publisher = output.open_with_client(0, Box::new(client), schema).unwrap();
        publisher
            .add(&Row::new(vec![Value::Long(1), Value::String("a".into())]))
            .await
            .unwrap();
        publisher.finish().await.unwrap();
        assert_eq!(publisher.commit().unwrap(), TaskReport);
        output.cleanup();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "orders");
        assert_eq!(sent[0].key, None);
        assert_eq!(sent[0].partition, None);
        assert_eq!(String::from_utf8(sent[0].value.clone()).unwrap(), r#"{"id":1,"name":"a"}"#);
    }

    #[tokio::test]
    async fn topic_column_routes_rows() {
        let mut config = json_config();
        config.topic_column = Some("region".into());
        let output = output(config).await;

        let client = MemoryClient::default();
        let sent = Arc::clone(&client.sent);
        let schema = Schema::new([("region", ColumnType::String), ("id", ColumnType::Long)]);
        let mut publisher = output.open_with_client(0, Box::new(client), schema).unwrap();
        publisher
            .add(&Row::new(vec![Value::String("eu".into()), Value::Long(2)]))
            .await
            .unwrap();
        assert_eq!(sent.lock().unwrap()[0].topic, "eu");
    }

    #[tokio::test]
    async fn extra_column_fails_registry_task_before_any_send() {
        let mut config = KafkaOutputConfig::new(
            &["localhost:9092"],
            "orders",
            SerializeFormat::AvroWithSchemaRegistry,
        );
        config.schema_registry_url = Some("http://localhost:8081".into());
        config.avsc = Some(serde_json::json!({
            "type": "record",
            "name": "Order",
            "fields": [{"name": "id", "type": "long"}]
        }));
        let output = output(config)
            .await
            .with_registry(Arc::new(MemoryRegistry::default()));

        let client = MemoryClient::default();
        let sent = Arc::clone(&client.sent);
        let schema = Schema::new([("id", ColumnType::Long), ("extra", ColumnType::String)]);
        let err = output
            .open_with_client(0, Box::new(client), schema)
            .err()
            .unwrap();
        assert!(matches!(err, KafkaOutputError::Schema(_)));
        assert!(sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_topic_aborts_before_any_task() {
        let err = KafkaOutput::transaction(
            json_config(),
            Arc::new(StaticTopics::with(&[("other", 1)])),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, KafkaOutputError::Connectivity(_)));
    }

    #[tokio::test]
    async fn resume_is_always_rejected() {
        let output = output(json_config()).await;
        let err = output.resume().unwrap_err();
        assert!(matches!(err, KafkaOutputError::UnsupportedOperation(_)));
        assert_eq!(output.destination(), Some(TopicDescription { partitions: 3 }));
    }

    #[test]
    fn invalid_configuration_fails_before_preflight() {
        let mut config = json_config();
        config.brokers.clear();
        let err = KafkaOutput::prepare(config).err().unwrap();
        assert!(matches!(err, KafkaOutputError::Configuration(_)));

        let mut config = KafkaOutputConfig::new(
            &["localhost:9092"],
            "orders",
            SerializeFormat::AvroWithSchemaRegistry,
        );
        config.schema_registry_url = Some("http://localhost:8081".into());
        let err = KafkaOutput::prepare(config).err().unwrap();
        assert!(matches!(err, KafkaOutputError::Configuration(_)));
    }

    #[tokio::test]
    async fn registry_rows_are_framed_avro() {
        let mut config = KafkaOutputConfig::new(
            &["localhost:9092"],
            "orders",
            SerializeFormat::AvroWithSchemaRegistry,
        );
        config.schema_registry_url = Some("http://localhost:8081".into());
        config.key_column_name = Some("id".into());
        config.avsc = Some(serde_json::json!({
            "type": "record",
            "name": "Order",
            "fields": [{"name": "id", "type": "long"}]
        }));
        let output = output(config)
            .await
            .with_registry(Arc::new(MemoryRegistry::default()));

        let client = MemoryClient::default();
        let sent = Arc::clone(&client.sent);
        let schema = Schema::new([("id", ColumnType::Long)]);
        let mut publisher = output.open_with_client(0, Box::new(client), schema).unwrap();
        publisher.add(&Row::new(vec![Value::Long(9)])).await.unwrap();
        publisher.finish().await.unwrap();
        assert_eq!(publisher.state(), PublisherState::Committed);

        let sent = sent.lock().unwrap();
        assert_eq!(sent[0].key.as_deref(), Some(&b"9"[..]));
        assert_eq!(&sent[0].value[..5], &[0, 0, 0, 0, 1]);
    }
}
