//! Per-task publish lifecycle.
//!
//! ```text
//! Open -> Sending -> Flushing -> Committed -> Closed
//!                           \--> Aborted  ---/
//! ```
//!
//! `abort` is reachable from every state but `Closed`. `close` runs on every
//! exit path, including drop.

use std::fmt;
use std::sync::Arc;

use tabkafka_core::{KafkaOutputError, Row, Schema};
use tracing::{debug, info, warn};

use crate::preflight::TopicDescription;
use crate::producer::{DeliveryCounters, ProducerFactory, PublishClient, ValueEncoder};
use crate::router::{self, RecordRouter, RoutingConfig};

/// A message ready to be handed to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<Vec<u8>>,
    pub partition: Option<i32>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Open,
    Sending,
    Flushing,
    Committed,
    Aborted,
    Closed,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a committed task. Nothing is tracked for resuming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskReport;

/// Publishes the rows of one task through its own client.
pub struct TransactionalPublisher {
    task: usize,
    state: PublisherState,
    schema: Schema,
    client: Option<Box<dyn PublishClient>>,
    counters: Arc<DeliveryCounters>,
    router: RecordRouter,
    encoder: ValueEncoder,
    rows: u64,
}

impl TransactionalPublisher {
    /// Open task `task` with a new Kafka producer.
    pub fn open(
        task: usize,
        factory: &ProducerFactory,
        schema: Schema,
        destination: Option<TopicDescription>,
    ) -> Result<Self, KafkaOutputError> {
        let client = factory.create_client()?;
        Self::open_with_client(task, Box::new(client), factory, schema, destination)
    }

    /// Open task `task` on an existing client. `destination` describes the
    /// static topic as seen by the pre-flight check.
    pub fn open_with_client(
        task: usize,
        client: Box<dyn PublishClient>,
        factory: &ProducerFactory,
        schema: Schema,
        destination: Option<TopicDescription>,
    ) -> Result<Self, KafkaOutputError> {
        let config = factory.config();
        let mut router = RecordRouter::new(&RoutingConfig::from(config), &schema)?;
        if let Some(description) = destination {
            router.remember_partition_count(&config.topic, description.partitions);
        }
        let encoder = factory.value_encoder(&schema)?;
        let counters = client.counters();
        let mut publisher = Self {
            task,
            state: PublisherState::Open,
            schema,
            client: Some(client),
            counters,
            router,
            encoder,
            rows: 0,
        };
        publisher.state = PublisherState::Sending;
        debug!(task, "Publisher opened");
        Ok(publisher)
    }

    pub fn state(&self) -> PublisherState {
        self.state
    }

    pub fn counters(&self) -> &DeliveryCounters {
        &self.counters
    }

    fn expect_state(&self, operation: &str, allowed: PublisherState) -> Result<(), KafkaOutputError> {
        if self.state == allowed {
            Ok(())
        } else {
            Err(KafkaOutputError::unsupported(format!(
                "{operation} is not allowed in state {}",
                self.state
            )))
        }
    }

    /// Route, encode and enqueue one row.
    pub async fn add(&mut self, row: &Row) -> Result<(), KafkaOutputError> {
        self.expect_state("add", PublisherState::Sending)?;
        let client = self
            .client
            .as_deref()
            .ok_or_else(|| KafkaOutputError::unsupported("add after the client was released"))?;

        self.schema.check_row(row)?;
        let destination = self.router.route(row)?;
        if let Some(partition) = destination.partition {
            let count = match self.router.partition_count(&destination.topic) {
                Some(count) => count,
                None => {
                    // Past pre-flight a metadata failure only concerns this task.
                    let count = client
                        .partition_count(&destination.topic)
                        .await
                        .map_err(|e| match e {
                            KafkaOutputError::Routing(_) => e,
                            other => KafkaOutputError::routing(format!(
                                "cannot read partition count of topic '{}': {other}",
                                destination.topic
                            )),
                        })?;
                    self.router
                        .remember_partition_count(&destination.topic, count);
                    count
                }
            };
            router::check_partition(&destination.topic, partition, count)?;
        }
        let value = self.encoder.encode(&destination.topic, row).await?;

        client
            .send(OutboundMessage {
                topic: destination.topic,
                key: destination.key,
                partition: destination.partition,
                value,
            })
            .await?;
        self.rows += 1;
        Ok(())
    }

    /// Wait for every outstanding send. Any failed delivery aborts the task.
    pub async fn finish(&mut self) -> Result<(), KafkaOutputError> {
        self.expect_state("finish", PublisherState::Sending)?;
        self.state = PublisherState::Flushing;
        let flushed = match self.client.as_deref() {
            Some(client) => client.flush().await,
            None => Err(KafkaOutputError::unsupported("finish after the client was released")),
        };
        if let Err(e) = flushed {
            self.state = PublisherState::Aborted;
            return Err(e);
        }

        let failed = self.counters.failed();
        if failed > 0 {
            self.state = PublisherState::Aborted;
            let first = self.counters.first_error().unwrap_or_default();
            return Err(KafkaOutputError::send(format!(
                "{failed} of {} messages failed, first error: {first}",
                self.counters.enqueued()
            )));
        }
        self.state = PublisherState::Committed;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<TaskReport, KafkaOutputError> {
        self.expect_state("commit", PublisherState::Committed)?;
        info!(
            task = self.task,
            rows = self.rows,
            delivered = self.counters.delivered(),
            "Task committed"
        );
        Ok(TaskReport)
    }

    /// Give up on the task. Messages already delivered stay published.
    pub fn abort(&mut self) -> Result<(), KafkaOutputError> {
        if self.state == PublisherState::Closed {
            return Err(KafkaOutputError::unsupported("abort is not allowed in state Closed"));
        }
        warn!(
            task = self.task,
            state = %self.state,
            rows = self.rows,
            failed = self.counters.failed(),
            "Task aborted"
        );
        self.client = None;
        self.state = PublisherState::Aborted;
        Ok(())
    }

    /// Release the client.
    pub fn close(&mut self) {
        if self.state != PublisherState::Closed {
            self.client = None;
            self.state = PublisherState::Closed;
            debug!(task = self.task, "Publisher closed");
        }
    }

    /// Always rejected: a failed task cannot be continued.
    pub fn resume(&self) -> Result<(), KafkaOutputError> {
        Err(KafkaOutputError::unsupported("resuming a task is not supported"))
    }
}

impl Drop for TransactionalPublisher {
    fn drop(&mut self) {
        self.close();
    }
}
