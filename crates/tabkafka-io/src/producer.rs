//! Publish clients and the factory that configures them.
//!
//! Each task gets its own `ThreadedProducer`. librdkafka's background thread
//! reports every delivery to [`DeliveryTracker`], which counts successes and
//! failures in atomics shared with the task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use rdkafka::util::Timeout;
use tabkafka_core::{KafkaOutputConfig, KafkaOutputError, Row, Schema, SerializeFormat};
use tracing::{debug, info, warn};

use crate::avsc::TargetSchema;
use crate::preflight::{METADATA_TIMEOUT, describe_topic};
use crate::publisher::OutboundMessage;
use crate::registry::{self, HttpSchemaRegistry, SchemaRegistry, SubjectIds};
use crate::visitor_avro::AvroColumnVisitor;
use crate::visitor_json::JsonColumnVisitor;

/// Wait before retrying a send rejected by a full outbound queue.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// Delivery outcomes of one task, updated from the client's thread.
#[derive(Debug, Default)]
pub struct DeliveryCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    first_error: Mutex<Option<String>>,
}

impl DeliveryCounters {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, error: String) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut first) = self.first_error.lock() {
            first.get_or_insert(error);
        }
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Sends neither delivered nor failed yet.
    pub fn outstanding(&self) -> u64 {
        self.enqueued()
            .saturating_sub(self.delivered() + self.failed())
    }

    pub fn first_error(&self) -> Option<String> {
        self.first_error.lock().ok().and_then(|first| first.clone())
    }
}

/// Producer context recording delivery reports into [`DeliveryCounters`].
pub struct DeliveryTracker {
    counters: Arc<DeliveryCounters>,
}

impl ClientContext for DeliveryTracker {}

impl ProducerContext for DeliveryTracker {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        match result {
            Ok(_) => self.counters.record_delivered(),
            Err((error, _)) => {
                warn!(error = %error, "Message delivery failed");
                self.counters.record_failure(error.to_string());
            }
        }
    }
}

/// Asynchronous publish client owned by one task.
#[async_trait]
pub trait PublishClient: Send + Sync {
    /// Enqueue `message`; waits only while the outbound queue is full.
    async fn send(&self, message: OutboundMessage) -> Result<(), KafkaOutputError>;

    /// Block until every enqueued message is delivered or failed.
    async fn flush(&self) -> Result<(), KafkaOutputError>;

    fn counters(&self) -> Arc<DeliveryCounters>;

    /// Number of partitions of `topic`, fetched from the cluster.
    async fn partition_count(&self, topic: &str) -> Result<i32, KafkaOutputError>;
}

/// [`PublishClient`] backed by an rdkafka `ThreadedProducer`.
pub struct RdKafkaClient {
    producer: Arc<ThreadedProducer<DeliveryTracker>>,
    counters: Arc<DeliveryCounters>,
}

#[async_trait]
impl PublishClient for RdKafkaClient {
    async fn send(&self, message: OutboundMessage) -> Result<(), KafkaOutputError> {
        let mut record = BaseRecord::<[u8], [u8]>::to(&message.topic).payload(&message.value[..]);
        if let Some(key) = &message.key {
            record = record.key(&key[..]);
        }
        if let Some(partition) = message.partition {
            record = record.partition(partition);
        }
        loop {
            match self.producer.send(record) {
                Ok(()) => {
                    self.counters.record_enqueued();
                    return Ok(());
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), returned)) => {
                    debug!("Outbound queue full, backing off");
                    record = returned;
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err((error, _)) => {
                    return Err(KafkaOutputError::send(format!(
                        "cannot enqueue message for topic '{}': {error}",
                        message.topic
                    )));
                }
            }
        }
    }

    async fn flush(&self) -> Result<(), KafkaOutputError> {
        let producer = Arc::clone(&self.producer);
        tokio::task::spawn_blocking(move || producer.flush(Timeout::Never))
            .await
            .map_err(|e| KafkaOutputError::send(format!("flush task failed: {e}")))?
            .map_err(|e| KafkaOutputError::send(format!("flush failed: {e}")))
    }

    fn counters(&self) -> Arc<DeliveryCounters> {
        Arc::clone(&self.counters)
    }

    async fn partition_count(&self, topic: &str) -> Result<i32, KafkaOutputError> {
        let producer = Arc::clone(&self.producer);
        let name = topic.to_string();
        let description = tokio::task::spawn_blocking(move || {
            describe_topic(producer.client(), &name, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| KafkaOutputError::routing(format!("metadata task failed: {e}")))?;
        match description.map_err(|e| KafkaOutputError::routing(e.to_string()))? {
            Some(description) => Ok(description.partitions),
            None => Err(KafkaOutputError::routing(format!("topic '{topic}' does not exist"))),
        }
    }
}

/// Producer options after merging `other_producer_configs` with the typed
/// options. Typed options win; every overridden passthrough entry is logged.
pub fn producer_options(config: &KafkaOutputConfig) -> BTreeMap<String, String> {
    let mut options = config.other_producer_configs.clone();
    let typed = [
        ("bootstrap.servers", config.brokers.join(",")),
        ("acks", config.acks.clone()),
        ("retries", config.retries.to_string()),
        ("batch.size", config.record_batch_size.to_string()),
    ];
    for (key, value) in typed {
        if let Some(passthrough) = options.insert(key.to_string(), value.clone()) {
            if passthrough != value {
                warn!(
                    option = key,
                    passthrough = %passthrough,
                    value = %value,
                    "Typed producer option overrides other_producer_configs"
                );
            }
        }
    }
    options
}

/// Encoder turning rows into message values.
pub enum ValueEncoder {
    Json(JsonColumnVisitor),
    Avro {
        visitor: AvroColumnVisitor,
        ids: SubjectIds,
    },
}

impl ValueEncoder {
    /// Message value for `row` published to `topic`.
    pub async fn encode(&mut self, topic: &str, row: &Row) -> Result<Vec<u8>, KafkaOutputError> {
        match self {
            ValueEncoder::Json(visitor) => visitor.encode(row),
            ValueEncoder::Avro { visitor, ids } => {
                let datum = visitor.encode(row)?;
                let id = ids.id_for(topic).await?;
                Ok(registry::frame(id, &datum))
            }
        }
    }
}

/// Builds the per-task publish client and value encoder.
#[derive(Clone)]
pub struct ProducerFactory {
    config: Arc<KafkaOutputConfig>,
    target: Option<Arc<TargetSchema>>,
    registry: Option<Arc<dyn SchemaRegistry>>,
}

impl ProducerFactory {
    /// `target` must be set in registry mode; the HTTP registry client is
    /// created from `schema_registry_url`.
    pub fn new(
        config: Arc<KafkaOutputConfig>,
        target: Option<Arc<TargetSchema>>,
    ) -> Result<Self, KafkaOutputError> {
        let registry = match (&config.serialize_format, &config.schema_registry_url) {
            (SerializeFormat::AvroWithSchemaRegistry, Some(url)) => {
                Some(Arc::new(HttpSchemaRegistry::new(url)?) as Arc<dyn SchemaRegistry>)
            }
            (SerializeFormat::AvroWithSchemaRegistry, None) => {
                return Err(KafkaOutputError::config(
                    "avro_with_schema_registry format needs schema_registry_url",
                ));
            }
            (SerializeFormat::Json, _) => None,
        };
        Ok(Self {
            config,
            target,
            registry,
        })
    }

    /// Replace the registry client.
    pub fn with_registry(mut self, registry: Arc<dyn SchemaRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &KafkaOutputConfig {
        &self.config
    }

    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        for (key, value) in producer_options(&self.config) {
            client_config.set(key, value);
        }
        client_config
    }

    /// Connect a new producer for one task.
    pub fn create_client(&self) -> Result<RdKafkaClient, KafkaOutputError> {
        let counters = Arc::new(DeliveryCounters::default());
        let tracker = DeliveryTracker {
            counters: Arc::clone(&counters),
        };
        let producer: ThreadedProducer<DeliveryTracker> = self
            .client_config()
            .create_with_context(tracker)
            .map_err(|e| KafkaOutputError::config(format!("cannot create producer: {e}")))?;
        info!(brokers = %self.config.brokers.join(","), "Created Kafka producer");
        Ok(RdKafkaClient {
            producer: Arc::new(producer),
            counters,
        })
    }

    /// Bind the value encoder of the configured format to `schema`.
    pub fn value_encoder(&self, schema: &Schema) -> Result<ValueEncoder, KafkaOutputError> {
        let ignore = &self.config.ignore_columns;
        match self.config.serialize_format {
            SerializeFormat::Json => Ok(ValueEncoder::Json(JsonColumnVisitor::new(schema, ignore))),
            SerializeFormat::AvroWithSchemaRegistry => {
                let (Some(target), Some(registry)) = (&self.target, &self.registry) else {
                    return Err(KafkaOutputError::config(
                        "avro_with_schema_registry format needs a target schema and registry",
                    ));
                };
                let visitor = AvroColumnVisitor::new(schema, Arc::clone(target), ignore)?;
                let ids = SubjectIds::new(
                    Arc::clone(registry),
                    self.config.subject_name_strategy(),
                    Arc::clone(target),
                );
                Ok(ValueEncoder::Avro { visitor, ids })
            }
        }
    }
}
