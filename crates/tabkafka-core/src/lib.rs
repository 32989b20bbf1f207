//! # tabkafka Core - types shared by tabkafka jobs
//!
//! This crate provides the foundational types, traits, and configuration used to
//! move rows from tabular files into Kafka topics. Sources and sinks exchange
//! Arrow record batches over bounded channels; the Kafka sink turns each batch
//! into typed [`Row`]s and publishes them.
//!
//! ## Key Components
//!
//! - **Message System**: batches and end-of-stream markers passed from a source to a sink
//! - **Operator Traits**: Source and Sink abstractions, one pair per task
//! - **Schema**: typed columns and row values
//! - **Configuration**: YAML job specification
//! - **Error Handling**: the error taxonomy of the Kafka output
//!
//! ## Example Usage
//!
//! ```rust
//! use tabkafka_core::{parse_job, SerializeFormat};
//!
//! let job = parse_job(r#"
//! name: demo
//! source:
//!   type: file_csv
//!   path: "rows.csv"
//! output:
//!   brokers: ["localhost:9092"]
//!   topic: demo
//!   serialize_format: json
//! "#).unwrap();
//! assert_eq!(job.output.serialize_format, SerializeFormat::Json);
//! ```

use anyhow::Result;
use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod config;
pub mod error;
pub mod schema;

pub use config::{
    parse_job, CsvSourceSpec, JobSpec, KafkaOutputConfig, ParquetSourceSpec, SerializeFormat,
    SourceSpec, SubjectNameStrategy,
};
pub use error::{ErrorKind, KafkaOutputError};
pub use schema::{Column, ColumnType, Row, Schema, Value};

/// Type alias for Apache Arrow RecordBatch, representing a batch of rows
pub type Batch = RecordBatch;

/// Type alias for the sender side of a message channel between operators
pub type BatchTx = mpsc::Sender<Message>;

/// Type alias for the receiver side of a message channel between operators
pub type BatchRx = mpsc::Receiver<Message>;

/// Messages passed from a source to a sink
#[derive(Debug, Clone)]
pub enum Message {
    /// A batch of rows in Apache Arrow format
    Batch(Batch),

    /// End-of-stream marker
    ///
    /// Signals that the source read its input completely. A sink whose channel
    /// closes without this marker treats the task as cancelled.
    Eos,
}

/// Base trait for all operators
#[async_trait]
pub trait Operator: Send + Sync {
    /// Returns the name of this operator, used for logging
    fn name(&self) -> &str;

    /// Returns the Arrow schema of the batches this operator handles
    fn schema(&self) -> SchemaRef;
}

/// Trait for data source operators
///
/// A source reads one input (one task's share of the job) and sends its
/// batches downstream, followed by [`Message::Eos`].
#[async_trait]
pub trait Source: Operator {
    /// Run the source operator
    ///
    /// # Arguments
    /// * `tx` - Channel sender for publishing messages to the sink
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, tx: BatchTx, cancel: CancellationToken) -> Result<()>;
}

/// Trait for data sink operators
///
/// Sinks are the exit points of a task, responsible for writing the batches
/// to the external system.
#[async_trait]
pub trait Sink: Operator {
    /// Run the sink operator
    ///
    /// # Arguments
    /// * `rx` - Channel receiver for consuming input messages
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, rx: BatchRx, cancel: CancellationToken) -> Result<()>;
}
