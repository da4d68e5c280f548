//! Configuration for the stage chain pipeline.

use crate::pipeline::StageDescription;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for a stage chain run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Raw input dataset
    pub input: InputConfig,

    /// Final and intermediate outputs
    pub output: OutputConfig,

    /// Object store backing every dataset
    pub store: StoreConfig,

    /// Inline stage descriptions, upstream-most first
    #[serde(default)]
    pub stages: Vec<StageDescription>,

    /// File holding the stage descriptions (JSON or YAML).
    /// Mutually exclusive with `stages`.
    #[serde(default)]
    pub chain_file: Option<PathBuf>,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Raw input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Key (or s3:// URI) of the raw input. Its record count is read from
    /// `<path>.length`.
    pub path: String,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Key (or s3:// URI) of the terminal stage output
    pub path: String,

    /// Prefix for intermediate stage outputs
    #[serde(default = "default_intermediate_prefix")]
    pub intermediate_prefix: String,
}

/// Object store configuration.
///
/// Exactly one of `local_path`, `bucket` or `memory` selects the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Local filesystem root
    #[serde(default)]
    pub local_path: Option<String>,

    /// S3 bucket
    #[serde(default)]
    pub bucket: Option<String>,

    /// AWS region (falls back to the environment)
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (LocalStack, MinIO, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Skip request signing for public buckets
    #[serde(default)]
    pub anonymous: bool,

    /// Keep everything in process memory
    #[serde(default)]
    pub memory: bool,
}

impl StoreConfig {
    /// Check if the store is the local filesystem.
    pub fn is_local(&self) -> bool {
        self.local_path.is_some()
    }

    /// Human readable location of the store.
    pub fn display(&self) -> String {
        match (&self.local_path, &self.bucket) {
            (Some(path), _) => path.clone(),
            (_, Some(bucket)) => format!("s3://{}", bucket),
            _ => "memory://".to_string(),
        }
    }
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of batches executed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of batch outputs fetched concurrently while combining
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Tag batch outputs as test outputs
    #[serde(default)]
    pub test_mode: bool,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,

    /// Retry configuration for failed batches
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            fetch_concurrency: 16,
            test_mode: false,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per batch
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let mut config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };

        // A relative chain file is resolved next to the config file
        if let (Some(chain_file), Some(dir)) = (&config.chain_file, path.parent()) {
            if chain_file.is_relative() {
                config.chain_file = Some(dir.join(chain_file));
            }
        }
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Stage descriptions, either inline or read from `chain_file`.
    pub fn stage_descriptions(&self) -> anyhow::Result<Vec<StageDescription>> {
        match &self.chain_file {
            Some(path) => load_chain_file(path),
            None => Ok(self.stages.clone()),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let backends = [
            self.store.local_path.is_some(),
            self.store.bucket.is_some(),
            self.store.memory,
        ]
        .iter()
        .filter(|selected| **selected)
        .count();
        if backends != 1 {
            anyhow::bail!("Must specify exactly one of store.local_path, store.bucket or store.memory");
        }

        if self.input.path.trim().is_empty() {
            anyhow::bail!("input.path must not be empty");
        }
        if self.output.path.trim().is_empty() {
            anyhow::bail!("output.path must not be empty");
        }
        if self.input.path == self.output.path {
            anyhow::bail!("input.path and output.path must differ");
        }

        match (&self.chain_file, self.stages.is_empty()) {
            (Some(_), false) => anyhow::bail!("Cannot specify both stages and chain_file"),
            (None, true) => anyhow::bail!("Must specify stages or chain_file"),
            _ => {}
        }

        if self.processing.concurrency == 0 {
            anyhow::bail!("Concurrency must be > 0");
        }
        if self.processing.fetch_concurrency == 0 {
            anyhow::bail!("Fetch concurrency must be > 0");
        }
        if self.processing.enable_metrics && self.processing.metrics_interval_secs == 0 {
            anyhow::bail!("Metrics interval must be > 0");
        }
        Ok(())
    }
}

/// Read an ordered list of stage descriptions from a JSON or YAML file.
pub fn load_chain_file(path: &Path) -> anyhow::Result<Vec<StageDescription>> {
    use anyhow::Context;

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read chain file {}", path.display()))?;
    let stages = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&contents)?,
        _ => serde_yaml::from_str(&contents)?,
    };
    Ok(stages)
}

// Default value functions for serde
fn default_intermediate_prefix() -> String { "intermediate/".to_string() }
fn default_concurrency() -> usize { 8 }
fn default_fetch_concurrency() -> usize { 16 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
input:
  path: raw/records.json
output:
  path: final/records.json
store:
  memory: true
stages:
  - name: clean
    batch_size: 100
  - name: classify
    overrides:
      model: small
"#;

    #[test]
    fn test_parse_yaml_with_defaults() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.output.intermediate_prefix, "intermediate/");
        assert_eq!(config.processing.concurrency, 8);
        assert_eq!(config.processing.retry.max_retries, 3);
        assert!(!config.processing.test_mode);
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[0].batch_size, Some(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip_keeps_stages() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let yaml = config.to_yaml().unwrap();
        let reparsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(reparsed.stages[1].name, "classify");
        assert_eq!(reparsed.stages[1].overrides["model"], "small");
    }

    #[test]
    fn test_validation_requires_one_backend() {
        let mut config = Config::from_yaml(SAMPLE).unwrap();
        config.store.local_path = Some("/tmp/stage-chain".to_string());
        assert!(config.validate().is_err());

        config.store.memory = false;
        assert!(config.validate().is_ok());

        config.store.local_path = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_stages_and_chain_file_exclusive() {
        let mut config = Config::from_yaml(SAMPLE).unwrap();
        config.chain_file = Some(PathBuf::from("chain.json"));
        assert!(config.validate().is_err());

        config.stages.clear();
        assert!(config.validate().is_ok());

        config.chain_file = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_same_input_and_output() {
        let mut config = Config::from_yaml(SAMPLE).unwrap();
        config.output.path = config.input.path.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_chain_file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let chain_path = dir.path().join("chain.json");
        std::fs::write(
            &chain_path,
            r#"[{"name": "a", "batch_count": 4}, {"name": "b", "overrides": {"k": 1}}]"#,
        )
        .unwrap();

        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            "input:\n  path: raw.json\noutput:\n  path: out.json\nstore:\n  memory: true\nchain_file: chain.json\n",
        )
        .unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert!(config.validate().is_ok());
        let stages = config.stage_descriptions().unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].batch_count, Some(4));
        assert_eq!(stages[1].overrides["k"], 1);
    }
}
