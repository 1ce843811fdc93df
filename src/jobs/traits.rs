//! jobs::traits
//!
//! Capability trait for the test-job execution substrate.
//!
//! # Design
//!
//! The controller never runs tests. It submits jobs keyed by
//! `(job name, refs)`, polls the substrate's index to learn which jobs
//! are pending or passing, and aborts superseded jobs by name. Results
//! arrive out of order; the refs key ties a result back to the exact
//! `(base sha, head shas)` tuple it tested.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::{BranchName, Sha};

/// Errors from the job substrate.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The substrate rejected a submission.
    #[error("job submission failed: {0}")]
    SubmitFailed(String),

    /// The substrate could not be reached.
    #[error("job substrate unavailable: {0}")]
    Unavailable(String),
}

/// One PR head included in a job's refs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRef {
    /// PR number.
    pub number: u64,
    /// PR head sha.
    pub sha: Sha,
}

/// The exact code a job tests: a base commit plus the PR heads merged
/// onto it.
///
/// One head means a plain retest; several mean a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRefs {
    /// Organization.
    pub org: String,
    /// Repository.
    pub repo: String,
    /// Base branch under test.
    pub base_branch: BranchName,
    /// Base branch head at submission time.
    pub base_sha: Sha,
    /// PR heads included, in merge order.
    pub pulls: Vec<PullRef>,
}

impl JobRefs {
    /// Stable index key: `"org/repo@baseSHA+headSHA[+headSHA...]"`.
    ///
    /// Two jobs with equal keys tested exactly the same code.
    pub fn key(&self) -> String {
        let mut key = format!("{}/{}@{}", self.org, self.repo, self.base_sha);
        for pull in &self.pulls {
            key.push('+');
            key.push_str(pull.sha.as_str());
        }
        key
    }
}

/// Lifecycle state of a job in the substrate's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Accepted but not yet scheduled.
    Triggered,
    /// Running.
    Pending,
    /// Finished green.
    Success,
    /// Finished red.
    Failure,
    /// Cancelled before completion.
    Aborted,
}

impl JobState {
    /// Whether the job still occupies a concurrency slot.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Triggered | JobState::Pending)
    }
}

/// A job as reported by the substrate's index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Job name.
    pub name: String,
    /// Concurrency accounting key (queue name, or the job name).
    pub queue_key: String,
    /// What the job tests.
    pub refs: JobRefs,
    /// Current state.
    pub state: JobState,
}

/// A submission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Job name.
    pub name: String,
    /// Concurrency accounting key (queue name, or the job name).
    pub queue_key: String,
    /// What to test.
    pub refs: JobRefs,
}

/// The job-execution substrate.
///
/// Implementations must be `Send + Sync`; the sync controller submits and
/// queries from parallel per-pool workers.
#[async_trait]
pub trait JobSubstrate: Send + Sync {
    /// Submit a job.
    async fn submit(&self, spec: &JobSpec) -> Result<(), JobError>;

    /// The currently indexed jobs, all states.
    async fn jobs(&self) -> Result<Vec<Job>, JobError>;

    /// Abort the active copies of a job at the given refs key.
    async fn abort(&self, name: &str, refs_key: &str) -> Result<(), JobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(c: char) -> Sha {
        Sha::new(c.to_string().repeat(40)).unwrap()
    }

    #[test]
    fn refs_key_single_head() {
        let refs = JobRefs {
            org: "o".into(),
            repo: "r".into(),
            base_branch: BranchName::new("main").unwrap(),
            base_sha: sha('b'),
            pulls: vec![PullRef {
                number: 1,
                sha: sha('a'),
            }],
        };
        assert_eq!(
            refs.key(),
            format!("o/r@{}+{}", "b".repeat(40), "a".repeat(40))
        );
    }

    #[test]
    fn refs_key_batch_preserves_order() {
        let refs = JobRefs {
            org: "o".into(),
            repo: "r".into(),
            base_branch: BranchName::new("main").unwrap(),
            base_sha: sha('b'),
            pulls: vec![
                PullRef {
                    number: 2,
                    sha: sha('c'),
                },
                PullRef {
                    number: 1,
                    sha: sha('a'),
                },
            ],
        };
        assert_eq!(
            refs.key(),
            format!(
                "o/r@{}+{}+{}",
                "b".repeat(40),
                "c".repeat(40),
                "a".repeat(40)
            )
        );
    }

    #[test]
    fn active_states() {
        assert!(JobState::Triggered.is_active());
        assert!(JobState::Pending.is_active());
        assert!(!JobState::Success.is_active());
        assert!(!JobState::Failure.is_active());
        assert!(!JobState::Aborted.is_active());
    }
}
