//! engine::actions
//!
//! Action engine: effectful execution of per-pool decisions.
//!
//! # Semantics
//!
//! - `Trigger` / `TriggerBatch` submit test jobs tagged with the current
//!   `(base sha, head shas)` tuple. A job that already exists with
//!   identical refs is not resubmitted.
//! - `Merge` / `MergeBatch` call the forge; a conflict marks the PR for
//!   this tick's status pass and the engine proceeds with other PRs.
//! - `PoolBlocked` and `Wait` mutate nothing.
//!
//! Actions within a pool run sequentially; pools are fanned out by the
//! tick runner.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use super::merge::{merge_pull_request, MergeError};
use super::policy::ResolvedPolicy;
use super::pool::{retest_contexts, Action, Pool};
use crate::core::config::{Presubmit, TideConfig};
use crate::core::types::{PoolKey, PrKey, PullRequest};
use crate::forge::{ForgeClient, MergeOutcome};
use crate::jobs::{submit_gated, Job, JobRefs, JobSpec, JobState, JobSubstrate, PullRef};

/// What executing one pool's action changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOutcome {
    /// PRs merged.
    pub merged: Vec<PrKey>,
    /// Jobs submitted, by name.
    pub triggered: Vec<String>,
    /// PRs that turned out to conflict mid-tick.
    pub conflicted: Vec<PrKey>,
}

/// Executes pool actions against the forge and the job substrate.
pub struct ActionEngine<'a> {
    forge: &'a dyn ForgeClient,
    substrate: &'a dyn JobSubstrate,
    config: &'a TideConfig,
    policies: &'a BTreeMap<PoolKey, ResolvedPolicy>,
    jobs: &'a [Job],
}

impl<'a> ActionEngine<'a> {
    /// Create an engine over this tick's inputs.
    pub fn new(
        forge: &'a dyn ForgeClient,
        substrate: &'a dyn JobSubstrate,
        config: &'a TideConfig,
        policies: &'a BTreeMap<PoolKey, ResolvedPolicy>,
        jobs: &'a [Job],
    ) -> Self {
        Self {
            forge,
            substrate,
            config,
            policies,
            jobs,
        }
    }

    /// Execute the pool's chosen action.
    ///
    /// Never fails the tick: per-PR and per-job failures are logged and
    /// folded into the outcome.
    pub async fn execute(
        &self,
        pool: &Pool,
        prs: &BTreeMap<PrKey, &PullRequest>,
    ) -> ActionOutcome {
        match pool.action {
            Action::Wait | Action::PoolBlocked => ActionOutcome::default(),
            Action::Trigger => self.trigger(pool, prs).await,
            Action::TriggerBatch => self.trigger_batch(pool, prs).await,
            Action::Merge | Action::MergeBatch => self.merge_targets(pool, prs).await,
        }
    }

    async fn trigger(&self, pool: &Pool, prs: &BTreeMap<PrKey, &PullRequest>) -> ActionOutcome {
        let mut outcome = ActionOutcome::default();
        let Some(target) = pool.targets.first() else {
            return outcome;
        };
        let Some(pr) = prs.get(target) else {
            return outcome;
        };
        let Some(base_sha) = pool.base_sha.clone().or_else(|| pr.base_sha.clone()) else {
            warn!(pool = %pool.key, pr = %target, "base sha unknown, deferring retest");
            return outcome;
        };

        let policy_default = ResolvedPolicy::default();
        let policy = self.policies.get(&pool.key).unwrap_or(&policy_default);
        let stale = retest_contexts(policy, pr, self.jobs);
        if stale.is_empty() {
            return outcome;
        }

        let refs = JobRefs {
            org: pool.key.org.clone(),
            repo: pool.key.repo.clone(),
            base_branch: pool.key.branch.clone(),
            base_sha,
            pulls: vec![PullRef {
                number: pr.key.number,
                sha: pr.head_sha.clone(),
            }],
        };

        let mut changes: Option<Vec<String>> = None;
        for presubmit in self.config.presubmits_for(&pool.key.org, &pool.key.repo) {
            if !stale.iter().any(|c| c.as_str() == presubmit.context()) {
                continue;
            }
            if presubmit.is_conditional() {
                let files = match self.changed_files(pr, &mut changes).await {
                    Some(files) => files,
                    None => continue,
                };
                if !should_run_conditional(presubmit, &files) {
                    continue;
                }
            }
            self.submit(presubmit, &refs, &mut outcome).await;
        }

        outcome
    }

    async fn trigger_batch(
        &self,
        pool: &Pool,
        prs: &BTreeMap<PrKey, &PullRequest>,
    ) -> ActionOutcome {
        let mut outcome = ActionOutcome::default();
        let Some(base_sha) = pool.base_sha.clone() else {
            warn!(pool = %pool.key, "base sha unknown, deferring batch");
            return outcome;
        };

        let mut pulls = Vec::new();
        for key in &pool.targets {
            match prs.get(key) {
                Some(pr) => pulls.push(PullRef {
                    number: pr.key.number,
                    sha: pr.head_sha.clone(),
                }),
                None => {
                    warn!(pool = %pool.key, pr = %key, "batch member missing from snapshot");
                    return outcome;
                }
            }
        }
        let refs = JobRefs {
            org: pool.key.org.clone(),
            repo: pool.key.repo.clone(),
            base_branch: pool.key.branch.clone(),
            base_sha,
            pulls,
        };

        // Stale batch runs for this pool are wasted capacity once a new
        // batch launches; abort them.
        for job in self.jobs {
            let stale_batch = job.state.is_active()
                && job.refs.org == pool.key.org
                && job.refs.repo == pool.key.repo
                && job.refs.base_branch == pool.key.branch
                && job.refs.pulls.len() >= 2
                && job.refs.key() != refs.key();
            if stale_batch {
                if let Err(e) = self.substrate.abort(&job.name, &job.refs.key()).await {
                    warn!(job = %job.name, error = %e, "could not abort stale batch job");
                }
            }
        }

        for presubmit in self.config.presubmits_for(&pool.key.org, &pool.key.repo) {
            let runs = presubmit.always_run
                && !presubmit.optional
                && !presubmit.skip_report
                && presubmit.runs_against(pool.key.branch.as_str());
            if runs {
                self.submit(presubmit, &refs, &mut outcome).await;
            }
        }

        info!(pool = %pool.key, batch = refs.key(), jobs = outcome.triggered.len(), "launched batch");
        outcome
    }

    async fn merge_targets(
        &self,
        pool: &Pool,
        prs: &BTreeMap<PrKey, &PullRequest>,
    ) -> ActionOutcome {
        let mut outcome = ActionOutcome::default();

        for key in &pool.targets {
            let Some(pr) = prs.get(key) else {
                continue;
            };
            match merge_pull_request(self.forge, self.config, pr).await {
                Ok(MergeOutcome::Merged) => {
                    info!(pr = %key, "merged");
                    outcome.merged.push(key.clone());
                }
                Ok(MergeOutcome::Conflict) => {
                    warn!(pr = %key, "merge refused for conflict, marking");
                    outcome.conflicted.push(key.clone());
                }
                Err(MergeError::ConflictingOverrides(labels)) => {
                    // Selection avoids these; a mid-tick label change can
                    // still surface one here.
                    warn!(pr = %key, labels = labels.join(","), "conflicting override labels");
                }
                Err(MergeError::Forge(e)) => {
                    warn!(pr = %key, error = %e, "merge failed, retrying next tick");
                }
            }
        }

        outcome
    }

    /// Fetch the PR's changed files once, lazily.
    async fn changed_files(
        &self,
        pr: &PullRequest,
        cache: &mut Option<Vec<String>>,
    ) -> Option<Vec<String>> {
        if cache.is_none() {
            match self
                .forge
                .pull_request_changes(&pr.key.org, &pr.key.repo, pr.key.number)
                .await
            {
                Ok(files) => *cache = Some(files),
                Err(e) => {
                    warn!(pr = %pr.key, error = %e, "could not list changed files");
                    return None;
                }
            }
        }
        cache.clone()
    }

    async fn submit(&self, presubmit: &Presubmit, refs: &JobRefs, outcome: &mut ActionOutcome) {
        // An identical job that is active or already green makes this
        // submission redundant.
        let duplicate = self.jobs.iter().any(|job| {
            job.name == presubmit.name
                && job.refs.key() == refs.key()
                && (job.state.is_active() || job.state == JobState::Success)
        });
        if duplicate {
            return;
        }

        let spec = JobSpec {
            name: presubmit.name.clone(),
            queue_key: presubmit.queue_key().to_string(),
            refs: refs.clone(),
        };
        match submit_gated(self.substrate, &spec, presubmit.max_concurrency).await {
            Ok(crate::jobs::SubmitDecision::Submitted) => {
                outcome.triggered.push(presubmit.name.clone());
            }
            Ok(crate::jobs::SubmitDecision::Saturated) => {}
            Err(e) => {
                warn!(job = %presubmit.name, error = %e, "job submission failed");
            }
        }
    }
}

/// Whether a conditional presubmit should run for these changed files.
fn should_run_conditional(presubmit: &Presubmit, files: &[String]) -> bool {
    if let Some(pattern) = &presubmit.run_if_changed {
        match regex::Regex::new(pattern) {
            Ok(re) => return files.iter().any(|f| re.is_match(f)),
            Err(_) => return false,
        }
    }
    if let Some(pattern) = &presubmit.skip_if_only_changed {
        match regex::Regex::new(pattern) {
            Ok(re) => return !files.iter().all(|f| re.is_match(f)),
            Err(_) => return false,
        }
    }
    true
}

/// Collect the PRs marked conflicting across all pool outcomes.
pub fn conflicted_set(outcomes: &[ActionOutcome]) -> BTreeSet<PrKey> {
    outcomes
        .iter()
        .flat_map(|o| o.conflicted.iter().cloned())
        .collect()
}

/// The tick's PR snapshots indexed by key.
pub fn index_prs(prs: &[PullRequest]) -> BTreeMap<PrKey, &PullRequest> {
    let mut by_key = BTreeMap::new();
    for pr in prs {
        by_key.entry(pr.key.clone()).or_insert(pr);
    }
    by_key
}
