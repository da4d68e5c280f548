//! Stage Chain Batch Orchestrator
//!
//! Runs an ordered chain of data-processing stages over a record dataset
//! held in an object store. Each stage splits its input into contiguous
//! index batches, hands the batches without output to an executor, checks
//! that the recombined output has exactly as many records as the input and
//! writes it together with a `.length` marker for the next stage.
//!
//! # Architecture
//!
//! - **I/O**: Object store construction and dataset access with length markers
//! - **Pipeline**: Batch planning, recombination, chain building and execution
//! - **Config**: YAML/JSON configuration of store, chain and processing
//!
//! Every step is idempotent: a stage whose output and marker exist is
//! skipped, and a partially executed stage only resubmits missing batches.
//!
//! # Usage
//!
//! ```no_run
//! use stage_chain::{Config, run_chain};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     run_chain(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod io;
pub mod pipeline;

pub use config::{Config, ProcessingConfig, RetryConfig, StoreConfig};
pub use error::PipelineError;
pub use io::Datasets;
pub use pipeline::{
    build_chain, BatchExecutor, BatchJob, BatchSizing, ChainRunner, ChainSettings, LocalExecutor,
    Metrics, Passthrough, RecordTransform, RunStats, StageChain, StageConfig, StageDescription,
    StagePlan,
};

use anyhow::Result;
use std::sync::Arc;

/// Build the stage chain described by `config`, with store-relative keys.
pub fn open_chain(config: &Config) -> Result<StageChain> {
    let descriptions = config.stage_descriptions()?;
    let settings = ChainSettings {
        input: io::object_key(&config.input.path, &config.store)?,
        output: io::object_key(&config.output.path, &config.store)?,
        intermediate_prefix: io::object_key(&config.output.intermediate_prefix, &config.store)?,
        test_mode: config.processing.test_mode,
    };
    Ok(build_chain(&descriptions, &settings)?)
}

/// Assemble a runner over the configured store with the given transform.
pub fn build_runner(config: &Config, transform: Arc<dyn RecordTransform>) -> Result<ChainRunner> {
    config.validate()?;

    let chain = open_chain(config)?;
    let store = io::create_object_store(&config.store)?;
    let datasets = Datasets::new(store);
    let metrics = Metrics::new();

    let executor = LocalExecutor::new(datasets.clone(), metrics.clone())
        .with_transform(transform)
        .with_concurrency(config.processing.concurrency)
        .with_retry(config.processing.retry.clone());

    let runner_config = pipeline::RunnerConfig {
        fetch_concurrency: config.processing.fetch_concurrency,
        enable_metrics: config.processing.enable_metrics,
        metrics_interval_secs: config.processing.metrics_interval_secs,
        metrics_output_path: config.processing.metrics_output_path.clone(),
    };

    Ok(ChainRunner::new(
        chain,
        datasets,
        Arc::new(executor),
        metrics,
        runner_config,
    ))
}

/// Run the full chain with the pass-through transform.
pub async fn run_chain(config: Config) -> Result<RunStats> {
    run_chain_with(config, Arc::new(Passthrough)).await
}

/// Run the full chain with a caller-supplied per-batch transform.
pub async fn run_chain_with(config: Config, transform: Arc<dyn RecordTransform>) -> Result<RunStats> {
    tracing::info!("Starting stage chain");
    tracing::info!("Store: {}", config.store.display());

    let runner = build_runner(&config, transform)?;
    for stage in runner.chain().stages() {
        tracing::info!("  {} : {} -> {}", stage.name, stage.input, stage.output);
    }

    Ok(runner.run().await?)
}

/// Plan every stage of the chain without executing anything.
pub async fn plan_chain(config: &Config) -> Result<Vec<StagePlan>> {
    let runner = build_runner(config, Arc::new(Passthrough))?;
    Ok(runner.plan_all().await?)
}

/// Write the raw input's `.length` marker from its record count.
pub async fn mark_input(config: &Config) -> Result<u64> {
    config.validate()?;

    let key = io::object_key(&config.input.path, &config.store)?;
    let datasets = Datasets::new(io::create_object_store(&config.store)?);
    let records = datasets.read_records(&key).await?;
    let length = records.len() as u64;
    datasets.write_length(&key, length).await?;

    tracing::info!("Marked {} with length {}", key, length);
    Ok(length)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
