//! engine::pool
//!
//! Pool model and per-tick classification.
//!
//! # Design
//!
//! Pools are recomputed from scratch every tick and never persisted. The
//! builder is pure: every remote fact it needs (PR snapshots, resolved
//! context policies, blockers, the job index) is gathered beforehand and
//! passed in, so classification is deterministic given its inputs.
//!
//! A pool's members are referenced by key into the tick's flat PR vector;
//! pools carry no PR back-pointers and nothing outlives the tick.
//!
//! # Action selection
//!
//! Per pool, in priority order: blocked pools freeze; a green PR merges;
//! a green still-valid batch merges; a running still-valid batch is
//! waited on; a new batch forms; a stale PR retests; otherwise wait.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::error;

use super::blockers::BlockerSet;
use super::merge::determine_method;
use super::policy::ResolvedPolicy;
use crate::core::config::{QueryConfig, TideConfig};
use crate::core::types::{
    ContextState, MergeableState, PoolKey, PrKey, PullRequest, Sha,
};
use crate::jobs::{Job, JobRefs, JobState};

/// The per-pool decision for this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    /// Nothing to do.
    Wait,
    /// Retest one PR.
    Trigger,
    /// Launch a batch test.
    TriggerBatch,
    /// Merge one PR.
    Merge,
    /// Merge a tested batch.
    MergeBatch,
    /// Merges are frozen by blocker issues.
    PoolBlocked,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Wait => "Wait",
            Action::Trigger => "Trigger",
            Action::TriggerBatch => "TriggerBatch",
            Action::Merge => "Merge",
            Action::MergeBatch => "MergeBatch",
            Action::PoolBlocked => "PoolBlocked",
        };
        write!(f, "{name}")
    }
}

/// One merge pool, computed for one tick.
#[derive(Debug, Clone)]
pub struct Pool {
    /// Pool identity.
    pub key: PoolKey,
    /// Member PRs: full query matches, not conflicting.
    pub members: Vec<PrKey>,
    /// Members whose required contexts are all green.
    pub successful: Vec<PrKey>,
    /// Members waiting on in-flight tests.
    pub pending: Vec<PrKey>,
    /// Members with stale or failed required contexts.
    pub needs_retest: Vec<PrKey>,
    /// Issue numbers freezing this pool, ascending.
    pub blockers: Vec<u64>,
    /// The chosen action.
    pub action: Action,
    /// The PRs the action applies to (merge target, retest target, or
    /// batch members, in order).
    pub targets: Vec<PrKey>,
    /// Refs of the batch backing a `MergeBatch`/batch `Wait` decision.
    pub batch_refs: Option<JobRefs>,
    /// The base sha this pool classified against, when known.
    pub base_sha: Option<Sha>,
    /// Why the pool's context policy failed to resolve, if it did. A pool
    /// with a broken policy never acts.
    pub policy_error: Option<String>,
}

impl Pool {
    /// Whether `key` is a member of this pool.
    pub fn contains(&self, key: &PrKey) -> bool {
        self.members.contains(key)
    }

    /// Whether the PR is being merged this tick.
    pub fn merging(&self, key: &PrKey) -> bool {
        match self.action {
            Action::Merge | Action::MergeBatch => self.targets.contains(key),
            _ => false,
        }
    }
}

/// Everything classification needs beyond the PR snapshots.
pub struct TickInputs<'a> {
    /// Configuration snapshot.
    pub config: &'a TideConfig,
    /// Resolved context policy per pool.
    pub policies: &'a BTreeMap<PoolKey, ResolvedPolicy>,
    /// This tick's merge blockers.
    pub blockers: &'a BlockerSet,
    /// The job substrate's current index.
    pub jobs: &'a [Job],
    /// PRs whose unknown merge-state has exhausted its retry budget;
    /// treated as conflicting for this tick.
    pub unknown_exhausted: &'a BTreeSet<PrKey>,
    /// Pools whose context policy failed to resolve, with the reason.
    pub policy_errors: &'a BTreeMap<PoolKey, String>,
}

/// How far a PR is from matching a query.
///
/// Field order mirrors the status ladder: labels, then branch, author,
/// milestone, approval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryMismatch {
    /// Required label groups with no member present (raw group strings).
    pub missing_label_groups: Vec<String>,
    /// Forbidden labels the PR carries.
    pub forbidden_labels: Vec<String>,
    /// The PR's base branch is outside the query's branches.
    pub branch_forbidden: bool,
    /// The query wants this author.
    pub author_mismatch: Option<String>,
    /// The query wants this milestone.
    pub milestone_mismatch: Option<String>,
    /// The query wants an approved review decision.
    pub approval_missing: bool,
}

impl QueryMismatch {
    /// Count of unmet requirements.
    pub fn distance(&self) -> usize {
        self.missing_label_groups.len()
            + self.forbidden_labels.len()
            + usize::from(self.branch_forbidden)
            + usize::from(self.author_mismatch.is_some())
            + usize::from(self.milestone_mismatch.is_some())
            + usize::from(self.approval_missing)
    }

    /// Whether the query matches fully.
    pub fn is_match(&self) -> bool {
        self.distance() == 0
    }
}

/// Evaluate one query against one PR.
pub fn evaluate_query(query: &QueryConfig, pr: &PullRequest) -> QueryMismatch {
    let mut mismatch = QueryMismatch::default();

    for group in &query.labels {
        let satisfied = group.split(',').any(|label| pr.labels.contains(label));
        if !satisfied {
            mismatch.missing_label_groups.push(group.clone());
        }
    }
    for label in &query.missing_labels {
        if pr.labels.contains(label) {
            mismatch.forbidden_labels.push(label.clone());
        }
    }
    mismatch.branch_forbidden = !query.applies_to_branch(&pr.base_branch);
    if let Some(author) = &query.author {
        if author != &pr.author {
            mismatch.author_mismatch = Some(author.clone());
        }
    }
    if let Some(milestone) = &query.milestone {
        if pr.milestone.as_deref() != Some(milestone.as_str()) {
            mismatch.milestone_mismatch = Some(milestone.clone());
        }
    }
    if query.review_approved_required {
        mismatch.approval_missing =
            pr.review_decision != Some(crate::core::types::ReviewDecision::Approved);
    }

    mismatch
}

/// Whether the PR targets the scope (orgs/repos) of the query.
///
/// Scope is separate from the mismatch distance: a PR from an unrelated
/// repo is not "close" to any query over other repos.
pub fn query_covers(query: &QueryConfig, pr: &PullRequest) -> bool {
    let slug = pr.key.slug();
    if query.excluded_repos.iter().any(|r| r == &slug) {
        return false;
    }
    query.orgs.iter().any(|o| o == &pr.key.org) || query.repos.iter().any(|r| r == &slug)
}

/// The index of the first `priority` entry whose labels the PR fully
/// carries; entries are ordered, earlier wins. PRs matching no entry rank
/// after all that do.
pub fn priority_rank(config: &TideConfig, pr: &PullRequest) -> usize {
    config
        .priority
        .iter()
        .position(|entry| pr.has_all_labels(entry.labels.iter().map(String::as_str)))
        .unwrap_or(config.priority.len())
}

/// Sort keys by `(priority rank, ascending PR number)`.
fn priority_order(config: &TideConfig, prs: &BTreeMap<PrKey, &PullRequest>, keys: &mut [PrKey]) {
    keys.sort_by_key(|key| {
        let rank = prs
            .get(key)
            .map(|pr| priority_rank(config, pr))
            .unwrap_or(usize::MAX);
        (rank, key.number)
    });
}

/// Contexts needing a fresh test run for this PR: required contexts that
/// are missing or failed with no active up-to-date job covering them.
pub fn retest_contexts(
    policy: &ResolvedPolicy,
    pr: &PullRequest,
    jobs: &[Job],
) -> Vec<String> {
    let covered: BTreeSet<&str> = jobs
        .iter()
        .filter(|job| {
            job.state.is_active()
                && job.refs.org == pr.key.org
                && job.refs.repo == pr.key.repo
                && job.refs.pulls.len() == 1
                && job.refs.pulls[0].number == pr.key.number
                && job.refs.pulls[0].sha == pr.head_sha
        })
        .map(|job| job.name.as_str())
        .collect();

    policy
        .unsatisfied(&pr.contexts)
        .into_iter()
        .filter(|context| {
            let running_on_forge = matches!(pr.contexts.get(context), Some(ContextState::Pending));
            // Job names and contexts coincide unless configured otherwise;
            // the action engine maps back through the presubmit table.
            !running_on_forge && !covered.contains(context.as_str())
        })
        .collect()
}

/// Build every pool for this tick.
///
/// PRs are deduplicated by key, grouped by `(org, repo, base branch)`,
/// and classified. Pools come out sorted by key; a PR lands in exactly
/// one pool.
pub fn build_pools(inputs: &TickInputs<'_>, prs: &[PullRequest]) -> Vec<Pool> {
    // Flat per-tick index; first occurrence wins on duplicates.
    let mut by_key: BTreeMap<PrKey, &PullRequest> = BTreeMap::new();
    for pr in prs {
        by_key.entry(pr.key.clone()).or_insert(pr);
    }

    let mut grouped: BTreeMap<PoolKey, Vec<&PullRequest>> = BTreeMap::new();
    for pr in by_key.values() {
        let key = PoolKey::new(&pr.key.org, &pr.key.repo, pr.base_branch.clone());
        grouped.entry(key).or_default().push(pr);
    }

    grouped
        .into_iter()
        .map(|(key, members)| classify_pool(inputs, key, &members, &by_key))
        .collect()
}

fn classify_pool(
    inputs: &TickInputs<'_>,
    key: PoolKey,
    candidates: &[&PullRequest],
    by_key: &BTreeMap<PrKey, &PullRequest>,
) -> Pool {
    let config = inputs.config;
    let policy_default = ResolvedPolicy::default();
    let policy = inputs.policies.get(&key).unwrap_or(&policy_default);

    // Membership: full query match, not conflicting.
    let mut members: Vec<PrKey> = Vec::new();
    for pr in candidates {
        let conflicting = match pr.mergeable {
            MergeableState::Conflicting => true,
            MergeableState::Unknown => inputs.unknown_exhausted.contains(&pr.key),
            MergeableState::Clean => false,
        };
        if conflicting {
            continue;
        }
        let matched = config
            .queries
            .iter()
            .any(|q| query_covers(q, pr) && evaluate_query(q, pr).is_match());
        if matched {
            members.push(pr.key.clone());
        }
    }
    priority_order(config, by_key, &mut members);

    let blockers: Vec<u64> = inputs
        .blockers
        .applicable(&key.org, &key.repo, key.branch.as_str())
        .iter()
        .map(|b| b.number)
        .collect();

    let base_sha = pool_base_sha(candidates);
    let policy_error = inputs.policy_errors.get(&key).cloned();

    if !blockers.is_empty() {
        return Pool {
            key,
            members,
            successful: Vec::new(),
            pending: Vec::new(),
            needs_retest: Vec::new(),
            blockers,
            action: Action::PoolBlocked,
            targets: Vec::new(),
            batch_refs: None,
            base_sha,
            policy_error,
        };
    }

    // A pool with a broken context policy cannot classify safely; its
    // members surface the error through the status controller instead.
    if policy_error.is_some() {
        return Pool {
            key,
            members,
            successful: Vec::new(),
            pending: Vec::new(),
            needs_retest: Vec::new(),
            blockers,
            action: Action::Wait,
            targets: Vec::new(),
            batch_refs: None,
            base_sha,
            policy_error,
        };
    }

    // Partition members by test state.
    let mut successful = Vec::new();
    let mut pending = Vec::new();
    let mut needs_retest = Vec::new();
    for member in &members {
        let pr = by_key[member];
        let unsatisfied = policy.unsatisfied(&pr.contexts);
        if unsatisfied.is_empty() {
            if pr.mergeable == MergeableState::Conflicting {
                // Should be unreachable: conflicting PRs are not members.
                error!(pr = %member, "conflicting PR classified successful, excluding");
                continue;
            }
            successful.push(member.clone());
        } else if retest_contexts(policy, pr, inputs.jobs).is_empty() {
            pending.push(member.clone());
        } else {
            needs_retest.push(member.clone());
        }
    }

    // Merge the best green PR, unless it carries conflicting override
    // labels (those surface as status errors instead).
    let merge_target = successful
        .iter()
        .find(|key| determine_method(config, by_key[*key]).is_ok())
        .cloned();
    if let Some(target) = merge_target {
        return Pool {
            key,
            members,
            successful,
            pending,
            needs_retest,
            blockers,
            action: Action::Merge,
            targets: vec![target],
            batch_refs: None,
            base_sha,
            policy_error: None,
        };
    }

    // Batch handling.
    let batch_limit = config.batch_size_limit_for(&key.org, &key.repo);
    let batching_enabled = batch_limit != -1;
    let existing = find_valid_batch(inputs, &key, by_key, base_sha.as_ref());

    if batching_enabled {
        if let Some(batch) = &existing {
            if batch.successful {
                let targets: Vec<PrKey> = batch
                    .refs
                    .pulls
                    .iter()
                    .map(|p| PrKey::new(&key.org, &key.repo, p.number))
                    .collect();
                return Pool {
                    key,
                    members,
                    successful,
                    pending,
                    needs_retest,
                    blockers,
                    action: Action::MergeBatch,
                    targets,
                    batch_refs: Some(batch.refs.clone()),
                    base_sha,
                    policy_error: None,
                };
            }
            if batch.pending && config.prioritize_existing_batches_for(&key.org, &key.repo) {
                return Pool {
                    key,
                    members,
                    successful,
                    pending,
                    needs_retest,
                    blockers,
                    action: Action::Wait,
                    targets: Vec::new(),
                    batch_refs: Some(batch.refs.clone()),
                    base_sha,
                    policy_error: None,
                };
            }
        }

        // Form a new batch from the not-yet-green members.
        let mut candidates: Vec<PrKey> = members
            .iter()
            .filter(|k| !successful.contains(k))
            .cloned()
            .collect();
        priority_order(config, by_key, &mut candidates);
        if batch_limit > 0 {
            candidates.truncate(batch_limit as usize);
        }
        if candidates.len() >= 2 {
            return Pool {
                key,
                members,
                successful,
                pending,
                needs_retest,
                blockers,
                action: Action::TriggerBatch,
                targets: candidates,
                batch_refs: None,
                base_sha,
                policy_error: None,
            };
        }
    }

    // Retest the highest-priority stale member.
    if let Some(target) = needs_retest.first().cloned() {
        return Pool {
            key,
            members,
            successful,
            pending,
            needs_retest,
            blockers,
            action: Action::Trigger,
            targets: vec![target],
            batch_refs: None,
            base_sha,
            policy_error: None,
        };
    }

    Pool {
        key,
        members,
        successful,
        pending,
        needs_retest,
        blockers,
        action: Action::Wait,
        targets: Vec::new(),
        batch_refs: None,
        base_sha,
        policy_error: None,
    }
}

/// The base sha most members agree on (the forge's eventually-consistent
/// view can lag for a minority of PRs).
fn pool_base_sha(candidates: &[&PullRequest]) -> Option<Sha> {
    let mut counts: BTreeMap<&Sha, usize> = BTreeMap::new();
    for pr in candidates {
        if let Some(sha) = &pr.base_sha {
            *counts.entry(sha).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(sha, _)| sha.clone())
}

struct BatchCandidate {
    refs: JobRefs,
    successful: bool,
    pending: bool,
}

/// Find a previously launched batch that is still valid for this pool:
/// every batched head still matches a current member and the base sha has
/// not moved.
fn find_valid_batch(
    inputs: &TickInputs<'_>,
    key: &PoolKey,
    by_key: &BTreeMap<PrKey, &PullRequest>,
    base_sha: Option<&Sha>,
) -> Option<BatchCandidate> {
    let mut by_refs: BTreeMap<String, Vec<&Job>> = BTreeMap::new();
    for job in inputs.jobs {
        if job.refs.org == key.org
            && job.refs.repo == key.repo
            && job.refs.base_branch == key.branch
            && job.refs.pulls.len() >= 2
        {
            by_refs.entry(job.refs.key()).or_default().push(job);
        }
    }

    for jobs in by_refs.values() {
        let refs = &jobs[0].refs;

        let still_applies = refs.pulls.iter().all(|pull| {
            by_key
                .get(&PrKey::new(&key.org, &key.repo, pull.number))
                .map(|pr| pr.head_sha == pull.sha)
                .unwrap_or(false)
        });
        let base_matches = match base_sha {
            Some(current) => &refs.base_sha == current,
            // Unknown base: nothing disproves the batch.
            None => true,
        };
        if !still_applies || !base_matches {
            continue;
        }

        let required: Vec<&str> = inputs
            .config
            .presubmits_for(&key.org, &key.repo)
            .iter()
            .filter(|job| {
                job.always_run && !job.optional && !job.skip_report
                    && job.runs_against(key.branch.as_str())
            })
            .map(|job| job.name.as_str())
            .collect();

        let any_failed = jobs
            .iter()
            .any(|j| matches!(j.state, JobState::Failure | JobState::Aborted));
        let all_required_green = required.iter().all(|name| {
            jobs.iter()
                .any(|j| j.name == *name && j.state == JobState::Success)
        });
        let pending = jobs.iter().any(|j| j.state.is_active());

        return Some(BatchCandidate {
            refs: refs.clone(),
            successful: !any_failed && !required.is_empty() && all_required_green,
            pending,
        });
    }

    None
}
