//! Stage chain orchestration: planning, execution and recombination.

mod chain;
mod combiner;
mod executor;
mod metrics;
mod planner;
mod runner;
mod stage;

pub use chain::{build_chain, ChainSettings, StageChain, StageConfig, StageDescription};
pub use combiner::{combine, CombineReport, CombineTarget};
pub use executor::{BatchExecutor, ExecutionReport, LocalExecutor, Passthrough, RecordTransform};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use planner::{
    batch_output_key, batch_ranges, plan_batches, BatchJob, BatchLayout, BatchSizing, PlanRequest,
};
pub use runner::{ChainRunner, RunStats, RunnerConfig, StageOutcome, StagePlan};
pub use stage::{Dependency, Stage};
