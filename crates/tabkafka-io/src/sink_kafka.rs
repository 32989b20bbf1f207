use anyhow::Result;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use tabkafka_core::{BatchRx, Message, Operator, Schema, Sink};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::output::KafkaOutput;
use crate::producer::PublishClient;
use crate::publisher::TransactionalPublisher;
use crate::rows::{row_at, schema_from_arrow};

/// Publishes one task's batches to Kafka.
pub struct KafkaSink {
    id: String,
    task: usize,
    schema: SchemaRef,
    output: KafkaOutput,
    client: Option<Box<dyn PublishClient>>,
}

impl KafkaSink {
    pub fn new(id: String, task: usize, schema: SchemaRef, output: KafkaOutput) -> Self {
        Self {
            id,
            task,
            schema,
            output,
            client: None,
        }
    }

    /// Publish through `client` instead of a new Kafka producer.
    pub fn with_client(mut self, client: Box<dyn PublishClient>) -> Self {
        self.client = Some(client);
        self
    }

    fn open(&mut self, schema: Schema) -> Result<TransactionalPublisher> {
        let publisher = match self.client.take() {
            Some(client) => self.output.open_with_client(self.task, client, schema)?,
            None => self.output.open(self.task, schema)?,
        };
        Ok(publisher)
    }
}

/// Feed every row to the publisher. `Ok(false)` means the channel closed
/// without end-of-stream.
async fn drain(publisher: &mut TransactionalPublisher, schema: &Schema, rx: &mut BatchRx) -> Result<bool> {
    while let Some(msg) = rx.recv().await {
        match msg {
            Message::Batch(batch) => {
                debug!("Publishing batch with {} rows", batch.num_rows());
                for i in 0..batch.num_rows() {
                    let row = row_at(&batch, schema, i)?;
                    publisher.add(&row).await?;
                }
            }
            Message::Eos => return Ok(true),
        }
    }
    Ok(false)
}

#[async_trait]
impl Operator for KafkaSink {
    fn name(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn run(&mut self, mut rx: BatchRx, cancel: CancellationToken) -> Result<()> {
        let schema = schema_from_arrow(&self.schema)?;
        let mut publisher = self.open(schema.clone())?;

        let drained = drain(&mut publisher, &schema, &mut rx).await;
        let outcome = match drained {
            Ok(true) => publisher.finish().await.map_err(Into::into),
            Ok(false) if cancel.is_cancelled() => Err(anyhow::anyhow!("task {} cancelled", self.task)),
            Ok(false) => Err(anyhow::anyhow!("input of task {} ended early", self.task)),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                publisher.commit()?;
                info!("Kafka sink {} finished", self.id);
                Ok(())
            }
            Err(e) => {
                error!(task = self.task, error = %e, "Kafka sink {} failed", self.id);
                publisher.abort()?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow_array::{Int64Array, RecordBatch, StringArray};
    use arrow_schema::{DataType, Field};
    use tabkafka_core::{KafkaOutputConfig, KafkaOutputError, SerializeFormat};
    use tokio::sync::mpsc;

    use crate::preflight::tests::StaticTopics;
    use crate::publisher::tests::MemoryClient;
    use crate::rows::arrow_schema_ref;

    fn batch() -> RecordBatch {
        let schema = arrow_schema_ref(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("region", DataType::Utf8, true),
        ]);
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("eu"), None])),
            ],
        )
        .unwrap()
    }

    async fn sink(config: KafkaOutputConfig, client: MemoryClient) -> KafkaSink {
        let output = KafkaOutput::transaction(config, Arc::new(StaticTopics::with(&[("orders", 1)])))
            .await
            .unwrap();
        KafkaSink::new("kafka".into(), 0, batch().schema(), output).with_client(Box::new(client))
    }

    fn config() -> KafkaOutputConfig {
        KafkaOutputConfig::new(&["localhost:9092"], "orders", SerializeFormat::Json)
    }

    #[tokio::test]
    async fn publishes_every_row_until_eos() {
        let client = MemoryClient::default();
        let sent = Arc::clone(&client.sent);
        let mut sink = sink(config(), client).await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(Message::Batch(batch())).await.unwrap();
        tx.send(Message::Eos).await.unwrap();
        sink.run(rx, CancellationToken::new()).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].value, br#"{"id":2,"region":null}"#.to_vec());
    }

    #[tokio::test]
    async fn routing_failure_stops_the_task() {
        let mut config = config();
        config.topic_column = Some("region".into());
        let client = MemoryClient::default();
        let sent = Arc::clone(&client.sent);
        let mut sink = sink(config, client).await;

        let (tx, rx) = mpsc::channel(4);
        tx.send(Message::Batch(batch())).await.unwrap();
        tx.send(Message::Batch(batch())).await.unwrap();
        tx.send(Message::Eos).await.unwrap();
        let err = sink.run(rx, CancellationToken::new()).await.unwrap_err();

        let err = err.downcast::<KafkaOutputError>().unwrap();
        assert!(matches!(err, KafkaOutputError::Routing(_)));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn closed_channel_without_eos_aborts() {
        let mut sink = sink(config(), MemoryClient::default()).await;
        let (tx, rx) = mpsc::channel(4);
        tx.send(Message::Batch(batch())).await.unwrap();
        drop(tx);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sink.run(rx, cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
