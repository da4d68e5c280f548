//! Batch execution.
//!
//! The chain only needs something that turns pending [`BatchJob`]s into
//! batch outputs at their keys. [`LocalExecutor`] does that in-process with
//! bounded concurrency; other backends implement [`BatchExecutor`].

use crate::config::RetryConfig;
use crate::error::{PipelineError, Result};
use crate::io::{Datasets, Record};
use crate::pipeline::{BatchJob, Metrics, StageConfig};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-record work applied to one batch.
pub trait RecordTransform: Send + Sync {
    fn apply(&self, stage: &StageConfig, records: Vec<Record>) -> anyhow::Result<Vec<Record>>;
}

/// Writes each batch unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl RecordTransform for Passthrough {
    fn apply(&self, _stage: &StageConfig, records: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        Ok(records)
    }
}

/// Result of submitting a stage's batch plan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    /// Jobs submitted (not done at plan time)
    pub submitted: usize,
    /// Jobs whose output was written
    pub succeeded: usize,
    /// Jobs that failed after all retries
    pub failed: usize,
    /// Jobs already done and never submitted
    pub skipped: usize,
}

impl std::fmt::Display for ExecutionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} submitted, {} succeeded, {} failed, {} already done",
            self.submitted, self.succeeded, self.failed, self.skipped
        )
    }
}

/// Runs the pending jobs of a batch plan.
///
/// Implementations must write each successful job's output at `job.output`
/// and must not submit jobs whose `done` flag is set. Individual job failures
/// are reported in the [`ExecutionReport`]; an `Err` means the stage could not
/// be executed at all.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn execute(&self, stage: &StageConfig, jobs: &[BatchJob]) -> Result<ExecutionReport>;
}

/// In-process executor over the shared store.
pub struct LocalExecutor {
    datasets: Datasets,
    transform: Arc<dyn RecordTransform>,
    metrics: Arc<Metrics>,
    concurrency: usize,
    retry: RetryConfig,
}

impl LocalExecutor {
    pub fn new(datasets: Datasets, metrics: Arc<Metrics>) -> Self {
        Self {
            datasets,
            transform: Arc::new(Passthrough),
            metrics,
            concurrency: 8,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_transform(mut self, transform: Arc<dyn RecordTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Slice, transform and write one batch. Returns bytes written.
    async fn run_job(&self, stage: &StageConfig, job: &BatchJob, input: &[Record]) -> Result<u64> {
        let start = Instant::now();
        let len = input.len() as u64;
        let first = job.first_index.min(len) as usize;
        let last = job.last_index.min(len).max(first as u64) as usize;
        let slice = input[first..last].to_vec();

        let transform = self.transform.clone();
        let stage_config = stage.clone();
        let output = tokio::task::spawn_blocking(move || transform.apply(&stage_config, slice))
            .await
            .map_err(|e| anyhow::anyhow!("Transform task panicked: {}", e))??;

        let bytes = self.datasets.write_records(&job.output, &output).await?;
        self.metrics.add_bytes_written(bytes);
        self.metrics.add_execute_time(start.elapsed());
        Ok(bytes)
    }

    async fn run_job_with_retry(
        &self,
        stage: &StageConfig,
        job: &BatchJob,
        input: &[Record],
    ) -> Result<u64> {
        let mut attempt = 0;
        let mut backoff = self.retry.initial_backoff_ms;

        loop {
            match self.run_job(stage, job, input).await {
                Ok(bytes) => {
                    self.metrics.add_batch_executed();
                    return Ok(bytes);
                }
                Err(e) => {
                    attempt += 1;
                    self.metrics.add_batch_failure();
                    if attempt >= self.retry.max_retries || e.is_fatal() {
                        tracing::error!(
                            "{}: batch [{}, {}) failed after {} attempts: {}",
                            stage.name,
                            job.first_index,
                            job.last_index,
                            attempt,
                            e
                        );
                        return Err(e);
                    }

                    tracing::warn!(
                        "{}: batch [{}, {}) attempt {} failed: {}, retrying in {}ms",
                        stage.name,
                        job.first_index,
                        job.last_index,
                        attempt,
                        e,
                        backoff
                    );

                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = next_backoff(backoff, self.retry.max_backoff_ms);
                }
            }
        }
    }
}

fn next_backoff(backoff_ms: u64, max_backoff_ms: u64) -> u64 {
    backoff_ms.saturating_mul(2).min(max_backoff_ms)
}

#[async_trait]
impl BatchExecutor for LocalExecutor {
    async fn execute(&self, stage: &StageConfig, jobs: &[BatchJob]) -> Result<ExecutionReport> {
        let pending: Vec<&BatchJob> = jobs.iter().filter(|job| !job.done).collect();
        let mut report = ExecutionReport {
            submitted: pending.len(),
            skipped: jobs.len() - pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        let input = self.datasets.read_bytes(&stage.input).await?;
        self.metrics.add_bytes_read(input.len() as u64);
        let input: Vec<Record> =
            serde_json::from_slice(&input).map_err(|source| PipelineError::Payload {
                key: stage.input.clone(),
                source,
            })?;

        tracing::info!(
            "{}: executing {} batches ({} concurrent)",
            stage.name,
            pending.len(),
            self.concurrency
        );

        // Boxed so the async_trait future stays Send
        let results: Vec<Result<u64>> = stream::iter(pending)
            .map(|job| self.run_job_with_retry(stage, job, &input).boxed())
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .boxed()
            .await;

        for result in results {
            match result {
                Ok(_) => report.succeeded += 1,
                Err(_) => report.failed += 1,
            }
        }

        tracing::info!("{}: {}", stage.name, report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BatchSizing;
    use object_store::memory::InMemory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn stage() -> StageConfig {
        StageConfig {
            name: "double".to_string(),
            position: 0,
            input: "raw.json".to_string(),
            output: "out.json".to_string(),
            sizing: BatchSizing::Size(2),
            overrides: serde_json::Map::new(),
            upstream: None,
            test_mode: false,
        }
    }

    fn job(first: u64, last: u64, done: bool) -> BatchJob {
        BatchJob {
            input: "raw.json".to_string(),
            first_index: first,
            last_index: last,
            output: format!("out-{}-{}-false.json", first, last),
            done,
        }
    }

    fn fast_retry(max_retries: usize) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    async fn seeded() -> Datasets {
        let datasets = Datasets::new(Arc::new(InMemory::new()));
        let records: Vec<Record> = (0..5).map(|i| json!(i)).collect();
        datasets.write_records("raw.json", &records).await.unwrap();
        datasets
    }

    struct Double;

    impl RecordTransform for Double {
        fn apply(&self, _stage: &StageConfig, records: Vec<Record>) -> anyhow::Result<Vec<Record>> {
            Ok(records
                .into_iter()
                .map(|r| json!(r.as_i64().unwrap_or_default() * 2))
                .collect())
        }
    }

    /// Fails the first `failures` calls.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl RecordTransform for Flaky {
        fn apply(&self, _stage: &StageConfig, records: Vec<Record>) -> anyhow::Result<Vec<Record>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("transient failure");
            }
            Ok(records)
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        assert_eq!(next_backoff(100, 10_000), 200);
        assert_eq!(next_backoff(8_000, 10_000), 10_000);
        assert_eq!(next_backoff(u64::MAX / 2 + 1, u64::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_executes_pending_jobs_only() {
        let datasets = seeded().await;
        let executor = LocalExecutor::new(datasets.clone(), Metrics::new())
            .with_transform(Arc::new(Double))
            .with_concurrency(2);

        let jobs = vec![job(0, 2, true), job(2, 4, false), job(4, 5, false)];
        let report = executor.execute(&stage(), &jobs).await.unwrap();

        assert_eq!(
            report,
            ExecutionReport {
                submitted: 2,
                succeeded: 2,
                failed: 0,
                skipped: 1,
            }
        );
        assert!(!datasets.exists(&jobs[0].output).await.unwrap());
        assert_eq!(
            datasets.read_records(&jobs[1].output).await.unwrap(),
            vec![json!(4), json!(6)]
        );
        assert_eq!(datasets.read_records(&jobs[2].output).await.unwrap(), vec![json!(8)]);
    }

    #[tokio::test]
    async fn test_execute_runs_on_spawned_task() {
        let datasets = seeded().await;
        let executor: Arc<dyn BatchExecutor> =
            Arc::new(LocalExecutor::new(datasets.clone(), Metrics::new()).with_concurrency(3));

        let jobs = vec![job(0, 2, false), job(2, 4, false), job(4, 5, false)];
        let spawned_jobs = jobs.clone();
        let report = tokio::spawn(async move { executor.execute(&stage(), &spawned_jobs).await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.succeeded, 3);
        for job in &jobs {
            assert!(datasets.exists(&job.output).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_all_done_does_not_read_input() {
        // no input exists; a read would fail
        let datasets = Datasets::new(Arc::new(InMemory::new()));
        let executor = LocalExecutor::new(datasets, Metrics::new());
        let report = executor.execute(&stage(), &[job(0, 2, true)]).await.unwrap();
        assert_eq!(report.submitted, 0);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let datasets = seeded().await;
        let metrics = Metrics::new();
        let executor = LocalExecutor::new(datasets.clone(), metrics.clone())
            .with_transform(Arc::new(Flaky {
                failures: 2,
                calls: AtomicUsize::new(0),
            }))
            .with_retry(fast_retry(3));

        let jobs = vec![job(0, 5, false)];
        let report = executor.execute(&stage(), &jobs).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(metrics.snapshot().batch_failures, 2);
        assert_eq!(datasets.read_records(&jobs[0].output).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_failures_are_reported_not_raised() {
        let datasets = seeded().await;
        let executor = LocalExecutor::new(datasets.clone(), Metrics::new())
            .with_transform(Arc::new(Flaky {
                failures: usize::MAX,
                calls: AtomicUsize::new(0),
            }))
            .with_retry(fast_retry(2));

        let jobs = vec![job(0, 2, false)];
        let report = executor.execute(&stage(), &jobs).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 0);
        assert!(!datasets.exists(&jobs[0].output).await.unwrap());
    }

    #[tokio::test]
    async fn test_range_past_input_is_clamped() {
        let datasets = seeded().await;
        let executor = LocalExecutor::new(datasets.clone(), Metrics::new());
        let jobs = vec![job(4, 9, false)];
        executor.execute(&stage(), &jobs).await.unwrap();
        assert_eq!(datasets.read_records(&jobs[0].output).await.unwrap(), vec![json!(4)]);
    }
}
