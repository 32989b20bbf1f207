use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arrow_csv::reader::{Format, ReaderBuilder};
use arrow_schema::{DataType, Field, SchemaRef};
use async_trait::async_trait;
use tabkafka_core::{BatchTx, CsvSourceSpec, KafkaOutputError, Message, Operator, Source};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::rows::{arrow_schema_ref, with_json_extension};

/// Rows sampled when inferring column types.
const INFER_RECORDS: usize = 1000;

/// Reads one CSV file.
pub struct CsvSource {
    pub id: String,
    pub path: PathBuf,
    pub schema: SchemaRef,
    pub spec: CsvSourceSpec,
}

impl CsvSource {
    /// Open `path` and infer its schema. Columns named in `json_columns` are
    /// read as text and tagged as JSON.
    pub fn try_new(spec: CsvSourceSpec, path: &Path) -> Result<Self> {
        let schema = infer_schema(&spec, path)?;
        Ok(Self {
            id: format!("{}:{}", spec.id, path.display()),
            path: path.to_path_buf(),
            schema,
            spec,
        })
    }
}

fn infer_schema(spec: &CsvSourceSpec, path: &Path) -> Result<SchemaRef> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let (inferred, sampled) = Format::default()
        .with_header(spec.has_header)
        .infer_schema(&mut file, Some(INFER_RECORDS))
        .with_context(|| format!("infer schema of {}", path.display()))?;
    debug!("Inferred schema of {} from {} records", path.display(), sampled);

    for name in &spec.json_columns {
        if inferred.field_with_name(name).is_err() {
            return Err(KafkaOutputError::config(format!(
                "json column '{name}' is not a column of {}",
                path.display()
            ))
            .into());
        }
    }
    let fields = inferred
        .fields()
        .iter()
        .map(|field| {
            if spec.json_columns.contains(field.name()) {
                with_json_extension(&Field::new(field.name(), DataType::Utf8, true))
            } else {
                Field::clone(field)
            }
        })
        .collect();
    Ok(arrow_schema_ref(fields))
}

#[async_trait]
impl Operator for CsvSource {
    fn name(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Source for CsvSource {
    async fn run(&mut self, tx: BatchTx, cancel: CancellationToken) -> Result<()> {
        let file = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        info!("Reading {}", self.path.display());

        let reader = ReaderBuilder::new(self.schema.clone())
            .with_batch_size(self.spec.batch_rows)
            .with_header(self.spec.has_header)
            .build(file)?;

        for batch in reader {
            if cancel.is_cancelled() {
                info!("CSV source {} cancelled", self.id);
                return Ok(());
            }
            let batch = batch.with_context(|| format!("read {}", self.path.display()))?;
            debug!("Read batch with {} rows", batch.num_rows());
            if tx.send(Message::Batch(batch)).await.is_err() {
                // Sink is gone; it reports its own failure.
                return Ok(());
            }
        }

        info!("CSV reader finished");
        let _ = tx.send(Message::Eos).await;
        Ok(())
    }
}
