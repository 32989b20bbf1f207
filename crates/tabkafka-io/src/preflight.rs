//! Destination topic check run once before any task opens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::AdminClient;
use rdkafka::client::{Client, ClientContext, DefaultClientContext};
use rdkafka::config::ClientConfig;
use tabkafka_core::{KafkaOutputConfig, KafkaOutputError};
use tracing::{info, warn};

/// Bound on every metadata request.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// What the cluster reports about a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicDescription {
    pub partitions: i32,
}

/// Fetch the metadata of `topic`. `Ok(None)` means the cluster answered but
/// does not know the topic.
pub fn describe_topic<C: ClientContext>(
    client: &Client<C>,
    topic: &str,
    timeout: Duration,
) -> Result<Option<TopicDescription>, KafkaOutputError> {
    let metadata = client.fetch_metadata(Some(topic), timeout).map_err(|e| {
        KafkaOutputError::connectivity(format!("cannot fetch metadata of topic '{topic}': {e}"))
    })?;
    let Some(found) = metadata.topics().iter().find(|t| t.name() == topic) else {
        return Ok(None);
    };
    if let Some(error) = found.error() {
        warn!(topic, error = ?error, "Topic metadata carries an error");
        return Ok(None);
    }
    match found.partitions().len() {
        0 => Ok(None),
        n => Ok(Some(TopicDescription {
            partitions: n as i32,
        })),
    }
}

/// Answers whether a topic exists.
#[async_trait]
pub trait TopicDescriber: Send + Sync {
    async fn describe(&self, topic: &str) -> Result<Option<TopicDescription>, KafkaOutputError>;
}

/// [`TopicDescriber`] using an rdkafka admin client.
pub struct AdminDescriber {
    admin: Arc<AdminClient<DefaultClientContext>>,
}

impl AdminDescriber {
    pub fn new(config: &KafkaOutputConfig) -> Result<Self, KafkaOutputError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .create()
            .map_err(|e| KafkaOutputError::config(format!("cannot create admin client: {e}")))?;
        Ok(Self {
            admin: Arc::new(admin),
        })
    }
}

#[async_trait]
impl TopicDescriber for AdminDescriber {
    async fn describe(&self, topic: &str) -> Result<Option<TopicDescription>, KafkaOutputError> {
        let admin = Arc::clone(&self.admin);
        let topic = topic.to_string();
        tokio::task::spawn_blocking(move || describe_topic(admin.inner(), &topic, METADATA_TIMEOUT))
            .await
            .map_err(|e| KafkaOutputError::connectivity(format!("metadata task failed: {e}")))?
    }
}

/// Fails the job when the destination topic cannot be confirmed.
pub struct PreflightGate {
    describer: Arc<dyn TopicDescriber>,
    timeout: Duration,
}

impl PreflightGate {
    pub fn new(describer: Arc<dyn TopicDescriber>) -> Self {
        Self {
            describer,
            timeout: METADATA_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Confirm that `topic` exists; any failure is a connectivity error.
    pub async fn check(&self, topic: &str) -> Result<TopicDescription, KafkaOutputError> {
        let described = tokio::time::timeout(self.timeout, self.describer.describe(topic))
            .await
            .map_err(|_| {
                KafkaOutputError::connectivity(format!(
                    "pre-flight check of topic '{topic}' timed out after {:?}",
                    self.timeout
                ))
            })??;
        match described {
            Some(description) => {
                info!(topic, partitions = description.partitions, "Pre-flight check passed");
                Ok(description)
            }
            None => Err(KafkaOutputError::connectivity(format!(
                "topic '{topic}' does not exist"
            ))),
        }
    }
}
