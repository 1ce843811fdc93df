//! jobs::gate
//!
//! Concurrency gate for job submission.
//!
//! # Invariant
//!
//! For any job with `max_concurrency = N`, the global count of its
//! active (triggered or pending) copies never exceeds N, even when the
//! substrate's index lags behind reality.
//!
//! The gate therefore never submits optimistically. When the observed
//! active count is at the limit it waits and re-reads the index; a prior
//! abort or completion must become observable before the new copy is
//! submitted. If the limit is still saturated after the final attempt the
//! submission is skipped for this tick and retried on the next one.

use std::time::Duration;

use tracing::{debug, warn};

use super::traits::{JobError, JobSpec, JobSubstrate};

/// Delay between index re-reads while the limit is saturated.
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Index re-reads before giving up for the tick.
const MAX_ATTEMPTS: u32 = 5;

/// Result of a gated submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitDecision {
    /// The job was submitted.
    Submitted,
    /// The concurrency limit stayed saturated; retry next tick.
    Saturated,
}

/// Submit `spec`, enforcing `max_concurrency` against the substrate's
/// global index.
///
/// With no limit the submission goes straight through.
///
/// # Errors
///
/// Propagates substrate errors from the index reads and the submission.
pub async fn submit_gated(
    substrate: &dyn JobSubstrate,
    spec: &JobSpec,
    max_concurrency: Option<u32>,
) -> Result<SubmitDecision, JobError> {
    let Some(limit) = max_concurrency else {
        substrate.submit(spec).await?;
        return Ok(SubmitDecision::Submitted);
    };

    for attempt in 0..MAX_ATTEMPTS {
        let active = substrate
            .jobs()
            .await?
            .iter()
            .filter(|job| job.queue_key == spec.queue_key && job.state.is_active())
            .count();

        if (active as u32) < limit {
            substrate.submit(spec).await?;
            return Ok(SubmitDecision::Submitted);
        }

        debug!(
            job = %spec.name,
            queue = %spec.queue_key,
            active,
            limit,
            attempt,
            "concurrency limit saturated, waiting for index to settle"
        );
        tokio::time::sleep(REQUEUE_DELAY).await;
    }

    warn!(
        job = %spec.name,
        queue = %spec.queue_key,
        limit,
        "concurrency limit still saturated, deferring to next tick"
    );
    Ok(SubmitDecision::Saturated)
}
