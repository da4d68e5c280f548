//! Error types for planning, combining and chaining stages.

use thiserror::Error;

/// Errors raised by the orchestration core.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid stage sizing or chain description. Raised before any store access.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Combined batch outputs do not add up to the recorded input length.
    #[error("integrity error in stage '{stage}': {expected} records in vs {actual} out")]
    Integrity {
        stage: String,
        expected: u64,
        actual: u64,
    },

    /// A stage was asked to run before its input was available.
    #[error("stage '{stage}' is not ready: dependency '{dependency}' is missing")]
    DependencyNotReady { stage: String, dependency: String },

    /// Some batches have no output after execution.
    #[error("stage '{stage}' has {pending} of {total} batches without output")]
    IncompleteBatches {
        stage: String,
        pending: usize,
        total: usize,
    },

    /// A `.length` marker that does not hold a record count.
    #[error("invalid length marker at '{key}': {content:?}")]
    InvalidLengthMarker { key: String, content: String },

    /// A payload that is not a JSON array of records.
    #[error("invalid payload at '{key}': {source}")]
    Payload {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Object store failure, passed through unchanged.
    #[error(transparent)]
    Store(#[from] object_store::Error),

    /// Failure inside the batch executor.
    #[error("batch execution failed: {0}")]
    Execution(#[from] anyhow::Error),
}

impl PipelineError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PipelineError::Configuration(msg.into())
    }

    /// True for errors that must not be retried without a fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_)
                | PipelineError::Integrity { .. }
                | PipelineError::InvalidLengthMarker { .. }
                | PipelineError::Payload { .. }
        )
    }
}

/// Result type used across the orchestration core.
pub type Result<T> = std::result::Result<T, PipelineError>;
