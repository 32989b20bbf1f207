//! # tabkafka I/O - tabular sources and the Kafka output
//!
//! This crate reads CSV and Parquet files into Arrow record batches and
//! publishes every row to Kafka, as JSON or as schema-registry framed Avro.
//!
//! ## Features
//!
//! ### Data Sources
//! - **CSV**: one file per task with schema inference and JSON column tagging
//! - **Parquet**: one file per task, schema taken from the file
//!
//! ### Kafka Output
//! - **Routing**: per-row topic, key and partition taken from row columns
//! - **Encodings**: JSON objects, or Avro records validated against a target schema
//! - **Schema Registry**: subject registration and Confluent wire framing
//! - **Lifecycle**: one producer per task with flush, commit and abort
//! - **Pre-flight**: destination topic check before any task starts
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tabkafka_core::{KafkaOutputConfig, SerializeFormat};
//! use tabkafka_io::output::KafkaOutput;
//! use tabkafka_io::preflight::AdminDescriber;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = KafkaOutputConfig::new(&["localhost:9092"], "orders", SerializeFormat::Json);
//! let describer = Arc::new(AdminDescriber::new(&config)?);
//! let output = KafkaOutput::transaction(config, describer).await?;
//! # Ok(())
//! # }
//! ```

/// Target Avro schema resolution
pub mod avsc;

/// Job-level Kafka output entry point
pub mod output;

/// Destination topic pre-flight check
pub mod preflight;

/// Producer configuration, clients and value encoders
pub mod producer;

/// Per-task publish lifecycle
pub mod publisher;

/// Schema registry client and wire framing
pub mod registry;

/// Per-row topic, key and partition routing
pub mod router;

/// Arrow record batches to typed rows
pub mod rows;

/// Kafka sink operator
pub mod sink_kafka;

/// CSV file source implementation
pub mod source_csv;

/// Parquet file source implementation
pub mod source_parquet;

/// Avro row encoding
pub mod visitor_avro;

/// JSON row encoding
pub mod visitor_json;
