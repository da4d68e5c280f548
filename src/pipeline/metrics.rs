//! Progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a chain run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Batches returned by planning passes (first pass per stage only)
    pub batches_planned: AtomicU64,

    /// Batches found done at planning time and not re-submitted
    pub batches_skipped: AtomicU64,

    /// Batches executed successfully
    pub batches_executed: AtomicU64,

    /// Batch attempts that failed
    pub batch_failures: AtomicU64,

    /// Stages finalized in this run
    pub stages_finalized: AtomicU64,

    /// Stages found complete and skipped
    pub stages_skipped: AtomicU64,

    /// Records written by finalized stages
    pub records_combined: AtomicU64,

    /// Bytes read from the store
    pub bytes_read: AtomicU64,

    /// Bytes written to the store
    pub bytes_written: AtomicU64,

    /// Time spent executing batches (microseconds)
    pub execute_us: AtomicU64,

    /// Time spent combining (microseconds)
    pub combine_us: AtomicU64,

    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_batches_planned(&self, count: u64) {
        self.batches_planned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_batches_skipped(&self, count: u64) {
        self.batches_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_batch_executed(&self) {
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_batch_failure(&self) {
        self.batch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_finalized(&self) {
        self.stages_finalized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stage_skipped(&self) {
        self.stages_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_records_combined(&self, records: u64) {
        self.records_combined.fetch_add(records, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record time spent executing a batch (in microseconds).
    pub fn add_execute_time(&self, duration: Duration) {
        self.execute_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent combining a stage (in microseconds).
    pub fn add_combine_time(&self, duration: Duration) {
        self.combine_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get executed batches per second.
    pub fn batches_per_second(&self) -> f64 {
        let batches = self.batches_executed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            batches as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_planned: self.batches_planned.load(Ordering::Relaxed),
            batches_skipped: self.batches_skipped.load(Ordering::Relaxed),
            batches_executed: self.batches_executed.load(Ordering::Relaxed),
            batch_failures: self.batch_failures.load(Ordering::Relaxed),
            stages_finalized: self.stages_finalized.load(Ordering::Relaxed),
            stages_skipped: self.stages_skipped.load(Ordering::Relaxed),
            records_combined: self.records_combined.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            batches_per_second: self.batches_per_second(),
            execute_secs: self.execute_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            combine_secs: self.combine_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub batches_planned: u64,
    pub batches_skipped: u64,
    pub batches_executed: u64,
    pub batch_failures: u64,
    pub stages_finalized: u64,
    pub stages_skipped: u64,
    pub records_combined: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub batches_per_second: f64,
    /// Total time spent executing batches (seconds, summed across tasks)
    pub execute_secs: f64,
    /// Total time spent combining stages (seconds)
    pub combine_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stages: {} finalized, {} skipped | Batches: {} planned, {} skipped, {} executed, {} failed | \
             Records: {} | Read: {:.1} MB | Write: {:.1} MB | Rate: {:.1} batches/s | Elapsed: {:.1}s",
            self.stages_finalized,
            self.stages_skipped,
            self.batches_planned,
            self.batches_skipped,
            self.batches_executed,
            self.batch_failures,
            self.records_combined,
            self.bytes_read as f64 / (1024.0 * 1024.0),
            self.bytes_written as f64 / (1024.0 * 1024.0),
            self.batches_per_second,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_stages: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_stages: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_stages,
        }
    }

    /// Log a progress line every interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_stages > 0 {
                        (snapshot.stages_finalized + snapshot.stages_skipped) as f64
                            / self.total_stages as f64
                            * 100.0
                    } else {
                        0.0
                    };
                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Chain Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Stages finalized: {}", snapshot.stages_finalized);
        println!("Stages skipped: {}", snapshot.stages_skipped);
        println!("Batches planned: {}", snapshot.batches_planned);
        println!("Batches skipped: {}", snapshot.batches_skipped);
        println!("Batches executed: {}", snapshot.batches_executed);
        println!("Batch failures: {}", snapshot.batch_failures);
        println!("Records combined: {}", snapshot.records_combined);
        println!("=====================\n");
    }
}
