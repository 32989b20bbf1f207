use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tabkafka_core::{BatchTx, Message, Operator, ParquetSourceSpec, Source};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reads one Parquet file.
pub struct ParquetSource {
    pub id: String,
    pub path: PathBuf,
    pub schema: SchemaRef,
    pub spec: ParquetSourceSpec,
}

impl ParquetSource {
    pub fn try_new(spec: ParquetSourceSpec, path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .with_context(|| format!("read parquet metadata of {}", path.display()))?;
        Ok(Self {
            id: format!("{}:{}", spec.id, path.display()),
            path: path.to_path_buf(),
            schema: builder.schema().clone(),
            spec,
        })
    }
}

#[async_trait]
impl Operator for ParquetSource {
    fn name(&self) -> &str {
        &self.id
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[async_trait]
impl Source for ParquetSource {
    async fn run(&mut self, tx: BatchTx, cancel: CancellationToken) -> Result<()> {
        let file = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        info!("Reading {}", self.path.display());
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
            .with_batch_size(self.spec.batch_rows)
            .build()?;

        for batch in reader {
            if cancel.is_cancelled() {
                info!("Parquet source {} cancelled", self.id);
                return Ok(());
            }
            let batch = batch.with_context(|| format!("read {}", self.path.display()))?;
            debug!("Read batch with {} rows", batch.num_rows());
            if tx.send(Message::Batch(batch)).await.is_err() {
                return Ok(());
            }
        }

        info!("Parquet reader finished");
        let _ = tx.send(Message::Eos).await;
        Ok(())
    }
}
