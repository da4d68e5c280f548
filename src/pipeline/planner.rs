//! Batch planning: split a stage's input into contiguous index ranges and
//! find out which of them already have output.
//!
//! Planning is read-only. Batch output keys are a pure function of the
//! stage output key and the range boundaries, so re-planning a partially
//! completed stage reproduces the same keys and sees which ones exist.

use crate::error::{PipelineError, Result};
use crate::io::Datasets;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Concurrent existence checks per planning pass.
const EXISTS_CONCURRENCY: usize = 32;

/// How a stage's input is split. Exactly one of the two is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchSizing {
    /// Fixed number of records per batch
    Size(u64),
    /// Fixed number of batches
    Count(u64),
}

impl BatchSizing {
    /// Build a sizing from the two optional settings of a stage description.
    pub fn from_options(batch_size: Option<u64>, batch_count: Option<u64>) -> Result<Self> {
        match (batch_size, batch_count) {
            (Some(_), Some(_)) => Err(PipelineError::config(
                "batch_size and batch_count are mutually exclusive",
            )),
            (None, None) => Err(PipelineError::config(
                "one of batch_size or batch_count must be set",
            )),
            (Some(0), None) => Err(PipelineError::config("batch_size must be > 0")),
            (None, Some(0)) => Err(PipelineError::config("batch_count must be > 0")),
            (Some(size), None) => Ok(BatchSizing::Size(size)),
            (None, Some(count)) => Ok(BatchSizing::Count(count)),
        }
    }
}

/// Batch size and count derived for a given record total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchLayout {
    pub batch_size: u64,
    pub batch_count: u64,
}

impl BatchLayout {
    /// Derive the implicit half of the sizing.
    ///
    /// With a fixed count the size is `ceil(total / count)`. With a fixed
    /// size the count is `round(total / size) + total % size`, rounding
    /// half to even. This can exceed the ceiling division; [`batch_ranges`]
    /// drops the surplus.
    pub fn resolve(total: u64, sizing: BatchSizing) -> Result<Self> {
        match sizing {
            BatchSizing::Size(0) => Err(PipelineError::config("batch_size must be > 0")),
            BatchSizing::Count(0) => Err(PipelineError::config("batch_count must be > 0")),
            BatchSizing::Count(count) => Ok(BatchLayout {
                batch_size: total.div_ceil(count),
                batch_count: count,
            }),
            BatchSizing::Size(size) => Ok(BatchLayout {
                batch_size: size,
                batch_count: div_round_half_even(total, size).saturating_add(total % size),
            }),
        }
    }
}

/// `round(n / d)` with ties going to the even neighbour, in integers.
fn div_round_half_even(n: u64, d: u64) -> u64 {
    let quotient = n / d;
    let twice_remainder = u128::from(n % d) * 2;
    let d = u128::from(d);
    if twice_remainder > d || (twice_remainder == d && quotient % 2 == 1) {
        quotient + 1
    } else {
        quotient
    }
}

/// Index ranges covering `[0, total)` exactly once, in order.
///
/// Range `i` is `[i * size, (i + 1) * size)` clamped to `total`, and the
/// last planned range always ends at `total`. Ranges that would start at or
/// beyond `total` are dropped so that no two batches share boundaries.
pub fn batch_ranges(total: u64, sizing: BatchSizing) -> Result<Vec<Range<u64>>> {
    let layout = BatchLayout::resolve(total, sizing)?;
    if total == 0 || layout.batch_size == 0 {
        return Ok(Vec::new());
    }

    let distinct = total.div_ceil(layout.batch_size);
    let mut ranges = Vec::with_capacity(layout.batch_count.min(distinct) as usize);
    for i in 0..layout.batch_count {
        let first = i.saturating_mul(layout.batch_size).min(total);
        if first >= total {
            break;
        }
        let last = if i == layout.batch_count - 1 {
            total
        } else {
            (i + 1).saturating_mul(layout.batch_size).min(total)
        };
        ranges.push(first..last);
    }

    if ranges.len() as u64 != layout.batch_count {
        tracing::debug!(
            "{} of {} planned batches start past the end of {} records and were dropped",
            layout.batch_count - ranges.len() as u64,
            layout.batch_count,
            total
        );
    }
    Ok(ranges)
}

/// Deterministic output key of one batch.
///
/// `out/stage.json` becomes `out/stage-<first>-<last>-<test_mode>.json`.
/// Keys without a `.json` extension get the suffix appended.
pub fn batch_output_key(stage_output: &str, first: u64, last: u64, test_mode: bool) -> String {
    let suffix = format!("-{}-{}-{}", first, last, test_mode);
    match stage_output.strip_suffix(".json") {
        Some(stem) => format!("{}{}.json", stem, suffix),
        None => format!("{}{}", stage_output, suffix),
    }
}

/// One unit of work for the batch executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchJob {
    /// Stage input, shared by every batch of the stage
    pub input: String,
    /// First record index (inclusive)
    pub first_index: u64,
    /// Last record index (exclusive)
    pub last_index: u64,
    /// Where the executor writes this batch's records
    pub output: String,
    /// Whether the output already existed at planning time
    pub done: bool,
}

impl BatchJob {
    /// Number of input records covered by this batch.
    pub fn len(&self) -> u64 {
        self.last_index - self.first_index
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the planner needs to know about a stage.
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub input: &'a str,
    pub output: &'a str,
    pub total: u64,
    pub sizing: BatchSizing,
    pub test_mode: bool,
}

/// Plan the batches of a stage and mark the ones whose output exists.
pub async fn plan_batches(datasets: &Datasets, request: PlanRequest<'_>) -> Result<Vec<BatchJob>> {
    let ranges = batch_ranges(request.total, request.sizing)?;

    let jobs: Vec<BatchJob> = stream::iter(ranges)
        .map(|range| async move {
            let output =
                batch_output_key(request.output, range.start, range.end, request.test_mode);
            let done = datasets.exists(&output).await?;
            Ok::<_, PipelineError>(BatchJob {
                input: request.input.to_string(),
                first_index: range.start,
                last_index: range.end,
                output,
                done,
            })
        })
        .buffered(EXISTS_CONCURRENCY)
        .try_collect()
        .await?;

    let done = jobs.iter().filter(|job| job.done).count();
    tracing::debug!(
        "{}: {} of {} batches have already been done",
        request.output,
        done,
        jobs.len()
    );
    Ok(jobs)
}
