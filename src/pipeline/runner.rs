//! Chain execution.
//!
//! The runner walks the chain upstream-first. For each stage it skips work
//! that is already finalized, checks that the stage's input is available,
//! submits the pending batches to the executor, confirms every batch output
//! now exists and finalizes the stage. Any stage left unfinalized by an
//! error stays resumable: a later run re-plans it and only submits the
//! batches that are still missing.

use crate::error::{PipelineError, Result};
use crate::io::Datasets;
use crate::pipeline::{
    BatchExecutor, BatchJob, CombineReport, ExecutionReport, Metrics, MetricsReporter, Stage,
    StageChain,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Runner settings.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Concurrent batch output fetches when finalizing
    pub fetch_concurrency: usize,

    /// Enable periodic progress reporting
    pub enable_metrics: bool,

    /// Reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run
    pub metrics_output_path: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 16,
            enable_metrics: false,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

/// What running one stage did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Output and length marker already existed
    AlreadyComplete,
    /// Pending batches executed and outputs combined
    Finalized {
        executed: ExecutionReport,
        combined: CombineReport,
    },
}

/// Planning state of one stage, without executing anything.
#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    pub name: String,
    pub input: String,
    pub output: String,
    pub complete: bool,
    pub ready: bool,
    /// Present only when the stage input is available
    pub jobs: Option<Vec<BatchJob>>,
}

impl StagePlan {
    pub fn pending(&self) -> usize {
        self.jobs
            .as_ref()
            .map_or(0, |jobs| jobs.iter().filter(|job| !job.done).count())
    }
}

impl std::fmt::Display for StagePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.complete {
            "complete".to_string()
        } else {
            match &self.jobs {
                Some(jobs) => format!("{} batches, {} pending", jobs.len(), self.pending()),
                None => "waiting for input".to_string(),
            }
        };
        write!(f, "{}: {} -> {} [{}]", self.name, self.input, self.output, state)
    }
}

/// Statistics from a chain run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunStats {
    /// Stages in the chain
    pub total_stages: usize,

    /// Stages found complete
    pub stages_skipped: usize,

    /// Stages finalized in this run
    pub stages_finalized: usize,

    /// Batches executed in this run
    pub batches_executed: usize,

    /// Batches reused from earlier runs
    pub batches_reused: usize,

    /// Records in the last stage output written by this run
    pub records_out: u64,

    /// Wall-clock seconds
    pub elapsed_secs: f64,
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} stages: {} finalized, {} already complete | batches: {} executed, {} reused | {} records out in {:.1}s",
            self.total_stages,
            self.stages_finalized,
            self.stages_skipped,
            self.batches_executed,
            self.batches_reused,
            self.records_out,
            self.elapsed_secs
        )
    }
}

/// Drives a [`StageChain`] to completion.
pub struct ChainRunner {
    chain: StageChain,
    datasets: Datasets,
    executor: Arc<dyn BatchExecutor>,
    metrics: Arc<Metrics>,
    config: RunnerConfig,
}

impl ChainRunner {
    pub fn new(
        chain: StageChain,
        datasets: Datasets,
        executor: Arc<dyn BatchExecutor>,
        metrics: Arc<Metrics>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            chain,
            datasets,
            executor,
            metrics,
            config,
        }
    }

    pub fn chain(&self) -> &StageChain {
        &self.chain
    }

    /// Run every stage through the terminal one.
    pub async fn run(&self) -> Result<RunStats> {
        self.run_through(self.chain.len() - 1).await
    }

    /// Run the named stage and everything upstream of it.
    pub async fn run_stage_named(&self, name: &str) -> Result<RunStats> {
        let position = self
            .chain
            .stages()
            .iter()
            .position(|stage| stage.name == name)
            .ok_or_else(|| PipelineError::config(format!("no stage named '{}'", name)))?;
        self.run_through(position).await
    }

    async fn run_through(&self, target: usize) -> Result<RunStats> {
        let start = Instant::now();
        let target_stage = self
            .chain
            .get(target)
            .ok_or_else(|| PipelineError::config(format!("no stage at position {}", target)))?;

        let mut positions: Vec<usize> = self
            .chain
            .lineage(target_stage)
            .map(|stage| stage.position)
            .collect();
        positions.reverse();

        tracing::info!(
            "Running {} stages through '{}'",
            positions.len(),
            target_stage.name
        );

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                positions.len() as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut stats = RunStats {
            total_stages: positions.len(),
            ..Default::default()
        };
        let result = self.run_positions(&positions, &mut stats).await;

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }
        result?;

        stats.elapsed_secs = start.elapsed().as_secs_f64();

        if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.config.metrics_interval_secs,
                positions.len() as u64,
            );
            reporter.print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.metrics.snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        tracing::info!("Chain complete: {}", stats);
        Ok(stats)
    }

    async fn run_positions(&self, positions: &[usize], stats: &mut RunStats) -> Result<()> {
        for &position in positions {
            match self.run_stage(position).await? {
                StageOutcome::AlreadyComplete => stats.stages_skipped += 1,
                StageOutcome::Finalized { executed, combined } => {
                    stats.stages_finalized += 1;
                    stats.batches_executed += executed.succeeded;
                    stats.batches_reused += executed.skipped;
                    stats.records_out = combined.records;
                }
            }
        }
        Ok(())
    }

    fn stage(&self, position: usize) -> Result<Stage> {
        Stage::from_chain(&self.chain, position, self.datasets.clone())
            .map(|stage| stage.with_fetch_concurrency(self.config.fetch_concurrency))
            .ok_or_else(|| PipelineError::config(format!("no stage at position {}", position)))
    }

    /// Bring one stage to completion. Its dependency must already be satisfied.
    pub async fn run_stage(&self, position: usize) -> Result<StageOutcome> {
        let stage = self.stage(position)?;

        if stage.is_complete().await? {
            tracing::info!("{}: output already complete, skipping", stage.name());
            self.metrics.add_stage_skipped();
            return Ok(StageOutcome::AlreadyComplete);
        }

        if !stage.is_ready().await? {
            return Err(PipelineError::DependencyNotReady {
                stage: stage.name().to_string(),
                dependency: stage.dependency().key().to_string(),
            });
        }

        let jobs = stage.plan().await?;
        let done = jobs.iter().filter(|job| job.done).count();
        self.metrics.add_batches_planned(jobs.len() as u64);
        self.metrics.add_batches_skipped(done as u64);

        let executed = self.executor.execute(stage.config(), &jobs).await?;

        let jobs = stage.plan().await?;
        let pending = jobs.iter().filter(|job| !job.done).count();
        if pending > 0 {
            tracing::error!(
                "{}: {} of {} batches still missing after execution",
                stage.name(),
                pending,
                jobs.len()
            );
            return Err(PipelineError::IncompleteBatches {
                stage: stage.name().to_string(),
                pending,
                total: jobs.len(),
            });
        }

        let start = Instant::now();
        let combined = stage.finalize(&jobs).await?;
        self.metrics.add_combine_time(start.elapsed());
        self.metrics.add_bytes_read(combined.bytes_read);
        self.metrics.add_bytes_written(combined.bytes_written);
        self.metrics.add_records_combined(combined.records);
        self.metrics.add_stage_finalized();

        Ok(StageOutcome::Finalized { executed, combined })
    }

    /// Plan every stage without executing anything.
    pub async fn plan_all(&self) -> Result<Vec<StagePlan>> {
        let mut plans = Vec::with_capacity(self.chain.len());
        for position in 0..self.chain.len() {
            let stage = self.stage(position)?;
            let complete = stage.is_complete().await?;
            let ready = stage.is_ready().await?;
            let jobs = if ready { Some(stage.plan().await?) } else { None };

            plans.push(StagePlan {
                name: stage.name().to_string(),
                input: stage.config().input.clone(),
                output: stage.config().output.clone(),
                complete,
                ready,
                jobs,
            });
        }
        Ok(plans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{build_chain, ChainSettings, LocalExecutor, StageConfig, StageDescription};
    use async_trait::async_trait;
    use object_store::memory::InMemory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chain() -> StageChain {
        build_chain(
            &[
                StageDescription::new("clean").with_batch_size(3),
                StageDescription::new("label"),
            ],
            &ChainSettings {
                input: "raw/in.json".to_string(),
                output: "final/out.json".to_string(),
                intermediate_prefix: "tmp/".to_string(),
                test_mode: false,
            },
        )
        .unwrap()
    }

    async fn seeded(records: u64) -> Datasets {
        let datasets = Datasets::new(Arc::new(InMemory::new()));
        let payload: Vec<_> = (0..records).map(|i| json!({ "id": i })).collect();
        datasets.write_records("raw/in.json", &payload).await.unwrap();
        datasets.write_length("raw/in.json", records).await.unwrap();
        datasets
    }

    fn runner(datasets: &Datasets, metrics: Arc<Metrics>) -> ChainRunner {
        let executor = LocalExecutor::new(datasets.clone(), metrics.clone());
        ChainRunner::new(
            chain(),
            datasets.clone(),
            Arc::new(executor),
            metrics,
            RunnerConfig::default(),
        )
    }

    /// Counts submissions and writes nothing.
    struct Idle {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchExecutor for Idle {
        async fn execute(&self, _stage: &StageConfig, jobs: &[BatchJob]) -> Result<ExecutionReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionReport {
                submitted: jobs.iter().filter(|job| !job.done).count(),
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_run_full_chain() {
        let datasets = seeded(10).await;
        let metrics = Metrics::new();
        let stats = runner(&datasets, metrics.clone()).run().await.unwrap();

        assert_eq!(stats.total_stages, 2);
        assert_eq!(stats.stages_finalized, 2);
        assert_eq!(stats.batches_executed, 8);
        assert_eq!(stats.records_out, 10);

        assert_eq!(datasets.read_length("final/out.json").await.unwrap(), 10);
        let output = datasets.read_records("final/out.json").await.unwrap();
        assert_eq!(output[9], json!({ "id": 9 }));
        assert_eq!(metrics.snapshot().stages_finalized, 2);
    }

    #[tokio::test]
    async fn test_second_run_skips_everything() {
        let datasets = seeded(10).await;
        runner(&datasets, Metrics::new()).run().await.unwrap();

        let idle = Arc::new(Idle {
            calls: AtomicUsize::new(0),
        });
        let runner = ChainRunner::new(
            chain(),
            datasets.clone(),
            idle.clone(),
            Metrics::new(),
            RunnerConfig::default(),
        );
        let stats = runner.run().await.unwrap();
        assert_eq!(stats.stages_skipped, 2);
        assert_eq!(stats.stages_finalized, 0);
        assert_eq!(idle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_raw_input() {
        let datasets = Datasets::new(Arc::new(InMemory::new()));
        let err = runner(&datasets, Metrics::new()).run().await.unwrap_err();
        match err {
            PipelineError::DependencyNotReady { stage, dependency } => {
                assert_eq!(stage, "clean");
                assert_eq!(dependency, "raw/in.json");
            }
            other => panic!("expected dependency error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_executor_leaving_gaps_is_reported() {
        let datasets = seeded(10).await;
        let runner = ChainRunner::new(
            chain(),
            datasets.clone(),
            Arc::new(Idle {
                calls: AtomicUsize::new(0),
            }),
            Metrics::new(),
            RunnerConfig::default(),
        );
        let err = runner.run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::IncompleteBatches {
                pending: 4,
                total: 4,
                ..
            }
        ));
        let intermediate = runner.chain().stages()[0].output.clone();
        assert!(!datasets.exists(&intermediate).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_stage_named_stops_at_stage() {
        let datasets = seeded(4).await;
        let runner = runner(&datasets, Metrics::new());
        let stats = runner.run_stage_named("clean").await.unwrap();
        assert_eq!(stats.total_stages, 1);
        assert!(!datasets.exists("final/out.json").await.unwrap());

        assert!(runner.run_stage_named("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_plan_all_is_read_only() {
        let datasets = seeded(10).await;
        let runner = runner(&datasets, Metrics::new());
        let plans = runner.plan_all().await.unwrap();

        assert_eq!(plans.len(), 2);
        assert!(plans[0].ready);
        assert_eq!(plans[0].pending(), 4);
        assert!(!plans[1].ready);
        assert!(plans[1].jobs.is_none());
        assert!(plans[1].to_string().contains("waiting for input"));
        assert!(!datasets.exists(&plans[0].output).await.unwrap());
    }
}
