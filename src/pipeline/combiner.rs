//! Recombine batch outputs into the stage output.

use crate::error::{PipelineError, Result};
use crate::io::{Datasets, Record};
use crate::pipeline::BatchJob;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;

/// Outcome of a successful combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CombineReport {
    /// Batches read
    pub batches: usize,
    /// Records in the combined output
    pub records: u64,
    /// Bytes read from batch outputs
    pub bytes_read: u64,
    /// Bytes of the combined payload
    pub bytes_written: u64,
}

/// Where a combine reads from and writes to.
#[derive(Debug, Clone, Copy)]
pub struct CombineTarget<'a> {
    /// Stage name, for error reporting
    pub stage: &'a str,
    /// Stage input; its length marker is the expected record count
    pub input: &'a str,
    /// Stage output
    pub output: &'a str,
}

/// Concatenate the outputs of `jobs` in ascending `first_index` order,
/// check the record count against the input's length marker and write the
/// combined payload followed by its length marker.
///
/// Nothing is written when the count does not match.
pub async fn combine(
    datasets: &Datasets,
    target: CombineTarget<'_>,
    jobs: &[BatchJob],
    fetch_concurrency: usize,
) -> Result<CombineReport> {
    tracing::debug!("{}: combining {} batches", target.stage, jobs.len());

    let expected = datasets.read_length(target.input).await?;

    let mut ordered: Vec<&BatchJob> = jobs.iter().collect();
    ordered.sort_by_key(|job| job.first_index);

    let parts: Vec<(Vec<Record>, u64)> = stream::iter(ordered)
        .map(|job| async move {
            let bytes = datasets.read_bytes(&job.output).await?;
            let records: Vec<Record> =
                serde_json::from_slice(&bytes).map_err(|source| PipelineError::Payload {
                    key: job.output.clone(),
                    source,
                })?;
            Ok::<_, PipelineError>((records, bytes.len() as u64))
        })
        .buffered(fetch_concurrency.max(1))
        .try_collect()
        .await?;

    let bytes_read = parts.iter().map(|(_, bytes)| bytes).sum();
    let combined: Vec<Record> = parts.into_iter().flat_map(|(records, _)| records).collect();
    let actual = combined.len() as u64;

    if actual != expected {
        tracing::error!(
            "{}: input and output lengths differ: {} in vs {} out",
            target.stage,
            expected,
            actual
        );
        return Err(PipelineError::Integrity {
            stage: target.stage.to_string(),
            expected,
            actual,
        });
    }

    tracing::debug!("{}: writing the output (length {})", target.stage, actual);
    let bytes_written = datasets.write_records(target.output, &combined).await?;
    datasets.write_length(target.output, actual).await?;

    Ok(CombineReport {
        batches: jobs.len(),
        records: actual,
        bytes_read,
        bytes_written,
    })
}
