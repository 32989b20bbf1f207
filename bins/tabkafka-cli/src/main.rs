//! # tabkafka - publish tabular files to Kafka
//!
//! Runs one job file: every input file matched by the source path is one task,
//! and all tasks publish to Kafka concurrently, each through its own producer.
//!
//! ```bash
//! # Validate the job without contacting the cluster
//! tabkafka --job job.yaml --dry-run
//!
//! # Run it, with debug logging from the Kafka output
//! RUST_LOG=info,tabkafka_io=debug tabkafka --job job.yaml
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_schema::SchemaRef;
use clap::Parser;
use glob::glob;
use tabkafka_core::{JobSpec, KafkaOutputError, Operator, Sink, Source, SourceSpec};
use tabkafka_io::output::KafkaOutput;
use tabkafka_io::preflight::AdminDescriber;
use tabkafka_io::rows::schema_from_arrow;
use tabkafka_io::sink_kafka::KafkaSink;
use tabkafka_io::source_csv::CsvSource;
use tabkafka_io::source_parquet::ParquetSource;
use tokio::{signal, sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(name = "tabkafka", about = "Publish rows of tabular files to Kafka")]
struct Args {
    /// Job YAML
    #[arg(short, long)]
    job: PathBuf,

    /// Validate the job and exit without contacting the cluster
    #[arg(long)]
    dry_run: bool,

    /// Bounded channel capacity between a source and its sink
    #[arg(long, default_value_t = 8)]
    channel_capacity: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<KafkaOutputError>() {
                Some(output_error) => error!("{}: {:#}", output_error.kind(), e),
                None => error!("{:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let spec = JobSpec::from_path(&args.job)?;
    info!("Loaded job '{}'", spec.name);

    let paths = input_paths(spec.source.path())?;
    info!("Found {} input files", paths.len());
    let sources = paths
        .iter()
        .map(|path| build_source(&spec.source, path))
        .collect::<Result<Vec<_>>>()?;

    if args.dry_run {
        let output = KafkaOutput::prepare(spec.output)?;
        for source in &sources {
            schema_from_arrow(&source.schema())
                .with_context(|| format!("input {}", source.name()))?;
        }
        info!(
            "Dry run: job is valid, {} tasks would publish to '{}'",
            sources.len(),
            output.config().topic
        );
        return Ok(());
    }

    let describer = Arc::new(AdminDescriber::new(&spec.output)?);
    let output = KafkaOutput::transaction(spec.output, describer).await?;

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    for (task, mut source) in sources.into_iter().enumerate() {
        let schema: SchemaRef = source.schema();
        let (tx, rx) = mpsc::channel(args.channel_capacity);
        let mut sink = KafkaSink::new(
            format!("kafka-sink-{task}"),
            task,
            schema,
            output.clone(),
        );

        let c1 = cancel.child_token();
        tasks.spawn(async move { source.run(tx, c1).await });
        let c2 = cancel.child_token();
        tasks.spawn(async move { sink.run(rx, c2).await });
    }

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling tasks");
            ctrl_c_cancel.cancel();
        }
    });

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined.context("task panicked")? {
            Ok(()) => {}
            Err(e) => {
                error!("Task failed: {:#}", e);
                if e
                    .downcast_ref::<KafkaOutputError>()
                    .is_some_and(KafkaOutputError::is_job_fatal)
                {
                    cancel.cancel();
                }
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    output.cleanup();

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn input_paths(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in glob(pattern).context("glob")? {
        let path = entry?;
        if path.is_file() {
            paths.push(path);
        }
    }
    if paths.is_empty() {
        return Err(KafkaOutputError::config(format!("no files matched: {pattern}")).into());
    }
    paths.sort();
    Ok(paths)
}

fn build_source(spec: &SourceSpec, path: &Path) -> Result<Box<dyn Source>> {
    let source: Box<dyn Source> = match spec {
        SourceSpec::Csv(csv) => Box::new(CsvSource::try_new(csv.clone(), path)?),
        SourceSpec::Parquet(parquet) => Box::new(ParquetSource::try_new(parquet.clone(), path)?),
    };
    Ok(source)
}
