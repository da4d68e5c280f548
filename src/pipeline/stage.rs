//! A single pipeline stage: planning, finalizing and dependency declaration.

use crate::error::Result;
use crate::io::Datasets;
use crate::pipeline::combiner::{self, CombineReport, CombineTarget};
use crate::pipeline::planner::{self, BatchJob, PlanRequest};
use crate::pipeline::{StageChain, StageConfig};

/// What must exist before a stage can plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// The externally supplied raw input and its length marker
    RawInput { key: String },
    /// The finalized output of the upstream stage
    Stage { name: String, key: String },
}

impl Dependency {
    /// Dataset key that must be complete.
    pub fn key(&self) -> &str {
        match self {
            Dependency::RawInput { key } | Dependency::Stage { key, .. } => key,
        }
    }

    /// Satisfied once the dataset and its length marker both exist.
    pub async fn is_satisfied(&self, datasets: &Datasets) -> Result<bool> {
        datasets.is_complete(self.key()).await
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dependency::RawInput { key } => write!(f, "raw input {}", key),
            Dependency::Stage { name, key } => write!(f, "stage {} ({})", name, key),
        }
    }
}

/// One stage bound to the store it reads from and writes to.
pub struct Stage {
    config: StageConfig,
    dependency: Dependency,
    datasets: Datasets,
    fetch_concurrency: usize,
}

impl Stage {
    /// Bind the stage at `position` of `chain`.
    pub fn from_chain(chain: &StageChain, position: usize, datasets: Datasets) -> Option<Self> {
        let config = chain.get(position)?.clone();
        let dependency = match chain.upstream_of(&config) {
            Some(upstream) => Dependency::Stage {
                name: upstream.name.clone(),
                key: upstream.output.clone(),
            },
            None => Dependency::RawInput {
                key: config.input.clone(),
            },
        };

        Some(Self {
            config,
            dependency,
            datasets,
            fetch_concurrency: 16,
        })
    }

    /// Set how many batch outputs are fetched concurrently when finalizing.
    pub fn with_fetch_concurrency(mut self, fetch_concurrency: usize) -> Self {
        self.fetch_concurrency = fetch_concurrency.max(1);
        self
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn dependency(&self) -> &Dependency {
        &self.dependency
    }

    /// Whether the dependency is satisfied.
    pub async fn is_ready(&self) -> Result<bool> {
        self.dependency.is_satisfied(&self.datasets).await
    }

    /// Whether the stage output and its length marker exist.
    pub async fn is_complete(&self) -> Result<bool> {
        self.datasets.is_complete(&self.config.output).await
    }

    /// Record count of the stage input, from its length marker.
    pub async fn input_length(&self) -> Result<u64> {
        self.datasets.read_length(&self.config.input).await
    }

    /// Current batch plan. Safe to call repeatedly and after partial completion.
    pub async fn plan(&self) -> Result<Vec<BatchJob>> {
        let total = self.input_length().await?;
        let jobs = planner::plan_batches(
            &self.datasets,
            PlanRequest {
                input: &self.config.input,
                output: &self.config.output,
                total,
                sizing: self.config.sizing,
                test_mode: self.config.test_mode,
            },
        )
        .await?;

        let done = jobs.iter().filter(|job| job.done).count();
        tracing::info!(
            "{}: {} batches over {} records ({} already done)",
            self.config.name,
            jobs.len(),
            total,
            done
        );
        Ok(jobs)
    }

    /// Combine the outputs of completed `jobs` into the stage output.
    pub async fn finalize(&self, jobs: &[BatchJob]) -> Result<CombineReport> {
        let report = combiner::combine(
            &self.datasets,
            CombineTarget {
                stage: &self.config.name,
                input: &self.config.input,
                output: &self.config.output,
            },
            jobs,
            self.fetch_concurrency,
        )
        .await?;

        tracing::info!(
            "{}: finalized {} records from {} batches into {}",
            self.config.name,
            report.records,
            report.batches,
            self.config.output
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{build_chain, ChainSettings, StageDescription};
    use object_store::memory::InMemory;
    use serde_json::json;
    use std::sync::Arc;

    fn chain() -> StageChain {
        build_chain(
            &[
                StageDescription::new("first").with_batch_count(2),
                StageDescription::new("second"),
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

    #[test]
    fn test_dependencies() {
        let chain = chain();
        let datasets = Datasets::new(Arc::new(InMemory::new()));

        let first = Stage::from_chain(&chain, 0, datasets.clone()).unwrap();
        assert_eq!(
            first.dependency(),
            &Dependency::RawInput {
                key: "raw/in.json".to_string()
            }
        );

        let second = Stage::from_chain(&chain, 1, datasets.clone()).unwrap();
        assert_eq!(
            second.dependency(),
            &Dependency::Stage {
                name: "first".to_string(),
                key: chain.stages()[0].output.clone(),
            }
        );

        assert!(Stage::from_chain(&chain, 2, datasets).is_none());
    }

    #[tokio::test]
    async fn test_readiness_follows_length_marker() {
        let chain = chain();
        let datasets = Datasets::new(Arc::new(InMemory::new()));
        let first = Stage::from_chain(&chain, 0, datasets.clone()).unwrap();

        assert!(!first.is_ready().await.unwrap());
        datasets.write_records("raw/in.json", &[json!(1)]).await.unwrap();
        assert!(!first.is_ready().await.unwrap());
        datasets.write_length("raw/in.json", 1).await.unwrap();
        assert!(first.is_ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_plan_execute_finalize() {
        let chain = chain();
        let datasets = Datasets::new(Arc::new(InMemory::new()));
        let records: Vec<_> = (0..7).map(|i| json!({ "id": i })).collect();
        datasets.write_records("raw/in.json", &records).await.unwrap();
        datasets.write_length("raw/in.json", 7).await.unwrap();

        let first = Stage::from_chain(&chain, 0, datasets.clone()).unwrap();
        let jobs = first.plan().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!((jobs[0].first_index, jobs[0].last_index), (0, 4));
        assert_eq!((jobs[1].first_index, jobs[1].last_index), (4, 7));

        for job in &jobs {
            let slice = &records[job.first_index as usize..job.last_index as usize];
            datasets.write_records(&job.output, slice).await.unwrap();
        }
        let jobs = first.plan().await.unwrap();
        assert!(jobs.iter().all(|job| job.done));

        assert!(!first.is_complete().await.unwrap());
        let report = first.finalize(&jobs).await.unwrap();
        assert_eq!(report.records, 7);
        assert!(first.is_complete().await.unwrap());

        let second = Stage::from_chain(&chain, 1, datasets.clone()).unwrap();
        assert!(second.is_ready().await.unwrap());
        assert_eq!(second.input_length().await.unwrap(), 7);
        // inherited batch_count of 2
        assert_eq!(second.plan().await.unwrap().len(), 2);
    }
}
