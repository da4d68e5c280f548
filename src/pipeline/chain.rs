//! Chain building: turn an ordered list of stage descriptions into linked
//! stage configurations.
//!
//! Each stage reads the previous stage's output and inherits any setting
//! it does not declare itself from the previous stage's resolved settings.
//! The chain is stored as a flat list where every stage holds the position
//! of its upstream, so walking it never recurses.

use crate::error::{PipelineError, Result};
use crate::pipeline::BatchSizing;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// One entry of the stage description list, as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDescription {
    /// Stage identifier, used in derived storage keys
    #[serde(alias = "job_name")]
    pub name: String,

    /// Records per batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u64>,

    /// Number of batches
    #[serde(default, alias = "n_batches", skip_serializing_if = "Option::is_none")]
    pub batch_count: Option<u64>,

    /// Stage-specific parameters, passed through to the batch executor
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub overrides: Map<String, Value>,
}

impl StageDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, size: u64) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn with_batch_count(mut self, count: u64) -> Self {
        self.batch_count = Some(count);
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }
}

/// Immutable, fully resolved configuration of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageConfig {
    pub name: String,
    /// Position in the chain, upstream-most first
    pub position: usize,
    pub input: String,
    pub output: String,
    pub sizing: BatchSizing,
    pub overrides: Map<String, Value>,
    /// Position of the stage this one reads from, `None` for the raw input
    pub upstream: Option<usize>,
    pub test_mode: bool,
}

impl StageConfig {
    pub fn is_first(&self) -> bool {
        self.upstream.is_none()
    }
}

/// Pipeline-level locations the chain is built around.
#[derive(Debug, Clone)]
pub struct ChainSettings {
    /// External raw input key
    pub input: String,
    /// Final output key, written by the terminal stage
    pub output: String,
    /// Prefix for intermediate stage outputs
    pub intermediate_prefix: String,
    pub test_mode: bool,
}

impl ChainSettings {
    /// Output key of a non-terminal stage:
    /// `<prefix><input dir>_to_<output dir>_<stage>.json`.
    pub fn intermediate_key(&self, stage: &str) -> String {
        format!(
            "{}{}_to_{}_{}.json",
            self.intermediate_prefix,
            parent_dir(&self.input),
            parent_dir(&self.output),
            stage
        )
    }
}

fn parent_dir(key: &str) -> &str {
    key.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

/// Settings carried from one stage to the next as defaults.
#[derive(Debug, Default)]
struct Resolved {
    sizing: Option<BatchSizing>,
    overrides: Map<String, Value>,
}

/// A linked sequence of stages, upstream-most first.
#[derive(Debug, Clone)]
pub struct StageChain {
    stages: Vec<StageConfig>,
    input: String,
}

impl StageChain {
    /// The stage producing the pipeline's final output.
    pub fn terminal(&self) -> &StageConfig {
        // build_chain rejects empty chains
        &self.stages[self.stages.len() - 1]
    }

    pub fn get(&self, position: usize) -> Option<&StageConfig> {
        self.stages.get(position)
    }

    pub fn upstream_of(&self, stage: &StageConfig) -> Option<&StageConfig> {
        stage.upstream.and_then(|position| self.stages.get(position))
    }

    /// The external raw input of the first stage.
    pub fn raw_input(&self) -> &str {
        &self.input
    }

    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages from `stage` back to the first one, following upstream links.
    pub fn lineage<'a>(&'a self, stage: &'a StageConfig) -> impl Iterator<Item = &'a StageConfig> + 'a {
        std::iter::successors(Some(stage), move |current| self.upstream_of(current))
    }
}

/// Build the stage chain from descriptions in pipeline order.
///
/// Each stage's settings start from its own description; any sizing or
/// override key it leaves out is taken from the previous stage's resolved
/// settings. Sizing is inherited as a unit: a stage declaring either
/// `batch_size` or `batch_count` does not inherit the other.
///
/// Legacy chain files that relied on key-by-key merging plan differently:
/// in `[{n_batches: 3}, {batch_size: 50}]` the second stage does not carry
/// `n_batches` alongside its own size and plans with `batch_size: 50` only.
pub fn build_chain(descriptions: &[StageDescription], settings: &ChainSettings) -> Result<StageChain> {
    if descriptions.is_empty() {
        return Err(PipelineError::config("stage chain is empty"));
    }

    let mut seen = HashSet::new();
    for description in descriptions {
        if description.name.trim().is_empty() {
            return Err(PipelineError::config("stage name must not be empty"));
        }
        if !seen.insert(description.name.as_str()) {
            return Err(PipelineError::config(format!(
                "duplicate stage name '{}'",
                description.name
            )));
        }
    }

    let last = descriptions.len() - 1;
    let mut stages: Vec<StageConfig> = Vec::with_capacity(descriptions.len());
    let mut previous = Resolved::default();

    for (position, description) in descriptions.iter().enumerate() {
        let sizing = match (description.batch_size, description.batch_count) {
            (None, None) => previous.sizing.ok_or_else(|| {
                PipelineError::config(format!(
                    "stage '{}' sets neither batch_size nor batch_count and has nothing to inherit",
                    description.name
                ))
            })?,
            (size, count) => BatchSizing::from_options(size, count).map_err(|e| match e {
                PipelineError::Configuration(msg) => {
                    PipelineError::config(format!("stage '{}': {}", description.name, msg))
                }
                other => other,
            })?,
        };

        let mut overrides = description.overrides.clone();
        for (key, value) in &previous.overrides {
            if !overrides.contains_key(key) {
                overrides.insert(key.clone(), value.clone());
            }
        }

        let input = match stages.last() {
            Some(upstream) => upstream.output.clone(),
            None => settings.input.clone(),
        };
        let output = if position == last {
            settings.output.clone()
        } else {
            settings.intermediate_key(&description.name)
        };

        tracing::debug!(
            "Chaining stage '{}' ({} -> {}) with {:?}",
            description.name,
            input,
            output,
            sizing
        );

        stages.push(StageConfig {
            name: description.name.clone(),
            position,
            input,
            output,
            sizing,
            overrides: overrides.clone(),
            upstream: position.checked_sub(1),
            test_mode: settings.test_mode,
        });

        previous = Resolved {
            sizing: Some(sizing),
            overrides,
        };
    }

    Ok(StageChain {
        stages,
        input: settings.input.clone(),
    })
}
