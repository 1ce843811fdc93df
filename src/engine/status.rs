//! engine::status
//!
//! Status controller: the per-PR context explaining pool membership.
//!
//! # Design
//!
//! For every PR seen this tick the controller computes an expected
//! `(state, description, target url)` tuple from the pool snapshot and
//! the configured queries, then publishes it, suppressing writes whose
//! tuple equals the last one published. Computation is pure; the only
//! state the controller keeps is the last-published record per PR plus a
//! do-not-update set that serializes in-flight writes. Both are
//! process-local and rebuilt after a restart by simply republishing once.
//!
//! # Description ladder
//!
//! The description names the first unmet requirement, in this order:
//! conflicting override labels, merge conflict, pool blockers, then the
//! closest query's unmet predicates (labels, forbidden labels, branch,
//! author, milestone, approval), then not-yet-green contexts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use tracing::{debug, warn};

use super::merge::determine_method;
use super::policy::ResolvedPolicy;
use super::pool::{evaluate_query, query_covers, Action, Pool, QueryMismatch};
use crate::core::config::{lookup_most_specific, QueryConfig, TideConfig};
use crate::core::types::{ContextState, PoolKey, PrKey, PullRequest, StatusRecord};
use crate::forge::{ForgeClient, StatusPayload};

/// GitHub truncates status descriptions at this length.
const MAX_DESCRIPTION_LENGTH: usize = 140;

/// Contexts beyond this count collapse into `"Retesting N jobs."`.
const MAX_LISTED_CONTEXTS: usize = 3;

/// Statistics from one status pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Statuses written.
    pub updated: usize,
    /// Statuses skipped as redundant or write-locked.
    pub skipped: usize,
    /// Writes that failed and will be retried next pass.
    pub failed: usize,
}

/// The status controller's process-local state.
#[derive(Debug, Default)]
pub struct StatusController {
    /// Last tuple published per PR, to suppress redundant writes.
    last_published: Mutex<HashMap<PrKey, StatusRecord>>,
    /// PRs with a write currently in flight.
    in_flight: Mutex<BTreeSet<PrKey>>,
}

impl StatusController {
    /// Create a controller with no publish history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish expected statuses for every PR in the snapshot.
    ///
    /// Failures are per PR: a failed write is logged, keeps the previous
    /// record, and is retried on the next pass.
    #[allow(clippy::too_many_arguments)]
    pub async fn run_pass(
        &self,
        forge: &dyn ForgeClient,
        config: &TideConfig,
        pools: &[Pool],
        policies: &BTreeMap<PoolKey, ResolvedPolicy>,
        prs: &[PullRequest],
        marked_conflicting: &BTreeSet<PrKey>,
    ) -> PassStats {
        let mut stats = PassStats::default();

        for pr in prs {
            let expected = expected_status(config, pools, policies, pr, marked_conflicting);

            let redundant = {
                let published = self.last_published.lock().expect("status lock poisoned");
                published.get(&pr.key) == Some(&expected)
            };
            if redundant {
                stats.skipped += 1;
                continue;
            }

            // One write in flight per PR; the set is released only after
            // the forge call returns.
            {
                let mut in_flight = self.in_flight.lock().expect("status lock poisoned");
                if !in_flight.insert(pr.key.clone()) {
                    stats.skipped += 1;
                    continue;
                }
            }

            let payload = StatusPayload {
                context: config.status_context.clone(),
                state: expected.state,
                description: expected.description.clone(),
                target_url: expected.target_url.clone(),
            };
            let result = forge
                .create_status(&pr.key.org, &pr.key.repo, &pr.head_sha, &payload)
                .await;

            self.in_flight
                .lock()
                .expect("status lock poisoned")
                .remove(&pr.key);

            match result {
                Ok(()) => {
                    debug!(pr = %pr.key, state = %expected.state, "published status");
                    self.last_published
                        .lock()
                        .expect("status lock poisoned")
                        .insert(pr.key.clone(), expected);
                    stats.updated += 1;
                }
                Err(e) => {
                    warn!(pr = %pr.key, error = %e, "status write failed, will retry");
                    stats.failed += 1;
                }
            }
        }

        stats
    }
}

/// Compute the status tuple for one PR, purely from this tick's inputs.
pub fn expected_status(
    config: &TideConfig,
    pools: &[Pool],
    policies: &BTreeMap<PoolKey, ResolvedPolicy>,
    pr: &PullRequest,
    marked_conflicting: &BTreeSet<PrKey>,
) -> StatusRecord {
    let pool_key = PoolKey::new(&pr.key.org, &pr.key.repo, pr.base_branch.clone());
    let pool = pools.iter().find(|p| p.key == pool_key);

    let (state, description) = expected_state_and_description(
        config,
        pool,
        policies.get(&pool_key),
        pr,
        marked_conflicting,
    );

    StatusRecord {
        state,
        description: truncate(description),
        target_url: target_url(config, pr),
    }
}

fn expected_state_and_description(
    config: &TideConfig,
    pool: Option<&Pool>,
    policy: Option<&ResolvedPolicy>,
    pr: &PullRequest,
    marked_conflicting: &BTreeSet<PrKey>,
) -> (ContextState, String) {
    if let Some(pool) = pool {
        if matches!(pool.action, Action::Merge | Action::MergeBatch)
            && pool.successful.contains(&pr.key)
        {
            return (ContextState::Success, "In merge pool.".to_string());
        }
    }

    // 1. Conflicting merge-method override labels.
    if determine_method(config, pr).is_err() {
        return (
            ContextState::Error,
            "Not mergeable. PR has conflicting merge method override labels".to_string(),
        );
    }

    // 2. Merge conflict, reported by the forge or discovered mid-tick.
    if pr.mergeable == crate::core::types::MergeableState::Conflicting
        || marked_conflicting.contains(&pr.key)
    {
        return (
            ContextState::Error,
            "Not mergeable. PR has a merge conflict.".to_string(),
        );
    }

    // 3. Pool blockers.
    if let Some(pool) = pool {
        if pool.action == Action::PoolBlocked && !pool.blockers.is_empty() {
            let issues = pool
                .blockers
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return (
                ContextState::Error,
                format!("Not mergeable. Merging is blocked by issues {issues}."),
            );
        }
    }

    // A broken context policy is a configuration error surfaced on every
    // PR it affects.
    if let Some(reason) = pool.and_then(|p| p.policy_error.as_deref()) {
        return (
            ContextState::Error,
            format!("Not mergeable. Invalid context policy: {reason}"),
        );
    }

    // 4-10. Query requirements, then test state.
    if config.display_all_tide_queries_in_status {
        all_queries_description(config, policy, pr)
    } else {
        closest_query_description(config, policy, pr)
    }
}

fn closest_query_description(
    config: &TideConfig,
    policy: Option<&ResolvedPolicy>,
    pr: &PullRequest,
) -> (ContextState, String) {
    let closest = config
        .queries
        .iter()
        .filter(|q| query_covers(q, pr))
        .map(|q| (q, evaluate_query(q, pr)))
        .min_by_key(|(_, m)| m.distance());

    match closest {
        Some((_, mismatch)) if !mismatch.is_match() => (
            ContextState::Pending,
            format!(
                "Not mergeable. {}",
                requirement_text(&mismatch, pr.base_branch.as_str())
            ),
        ),
        Some(_) => jobs_description(policy, pr),
        None => (
            ContextState::Pending,
            format!(
                "Not mergeable. No Tide query for branch {} found.",
                pr.base_branch
            ),
        ),
    }
}

fn all_queries_description(
    config: &TideConfig,
    policy: Option<&ResolvedPolicy>,
    pr: &PullRequest,
) -> (ContextState, String) {
    let applicable: Vec<(&QueryConfig, QueryMismatch)> = config
        .queries
        .iter()
        .filter(|q| query_covers(q, pr) && q.applies_to_branch(&pr.base_branch))
        .map(|q| (q, evaluate_query(q, pr)))
        .collect();

    if applicable.is_empty() {
        return (
            ContextState::Pending,
            format!(
                "Not mergeable. No Tide query for branch {} found.",
                pr.base_branch
            ),
        );
    }
    if applicable.iter().any(|(_, m)| m.is_match()) {
        return jobs_description(policy, pr);
    }

    let reasons: Vec<String> = applicable
        .iter()
        .map(|(_, m)| requirement_text(m, pr.base_branch.as_str()))
        .collect();
    (
        ContextState::Pending,
        format!("Not mergeable. {}", reasons.join(" OR ")),
    )
}

/// The first unmet predicate of a mismatch, as one sentence.
fn requirement_text(mismatch: &QueryMismatch, branch: &str) -> String {
    if !mismatch.missing_label_groups.is_empty() {
        let rendered: Vec<String> = mismatch
            .missing_label_groups
            .iter()
            .map(|group| group.split(',').collect::<Vec<_>>().join(" or "))
            .collect();
        let noun = if mismatch.missing_label_groups.len() > 1 {
            "labels"
        } else {
            "label"
        };
        return format!("Needs {} {noun}.", rendered.join(", "));
    }
    if !mismatch.forbidden_labels.is_empty() {
        let noun = if mismatch.forbidden_labels.len() > 1 {
            "labels"
        } else {
            "label"
        };
        return format!(
            "Should not have {} {noun}.",
            mismatch.forbidden_labels.join(", ")
        );
    }
    if mismatch.branch_forbidden {
        return format!("Merging to branch {branch} is forbidden.");
    }
    if let Some(author) = &mismatch.author_mismatch {
        return format!("Must be by author {author}.");
    }
    if let Some(milestone) = &mismatch.milestone_mismatch {
        return format!("Must be in milestone {milestone}.");
    }
    if mismatch.approval_missing {
        return "PullRequest is missing sufficient approving review(s).".to_string();
    }
    // A zero-distance mismatch has no requirement text; callers branch on
    // is_match() first.
    String::new()
}

/// Description for a PR that matches a query but is not green yet.
fn jobs_description(policy: Option<&ResolvedPolicy>, pr: &PullRequest) -> (ContextState, String) {
    let unsatisfied = policy
        .map(|p| p.unsatisfied(&pr.contexts))
        .unwrap_or_default();

    if unsatisfied.is_empty() {
        // Every requirement is met; the sync controller will pick it up.
        return (ContextState::Success, "In merge pool.".to_string());
    }
    if unsatisfied.len() > MAX_LISTED_CONTEXTS {
        return (
            ContextState::Pending,
            format!("Not mergeable. Retesting {} jobs.", unsatisfied.len()),
        );
    }
    (
        ContextState::Pending,
        format!("Not mergeable. Retesting: {}", unsatisfied.join(", ")),
    )
}

/// Resolve the status link for a PR.
///
/// `target_urls` wins by most-specific key; otherwise a dashboard link is
/// synthesized from `pr_status_base_urls`.
fn target_url(config: &TideConfig, pr: &PullRequest) -> Option<String> {
    if let Some(url) = lookup_most_specific(&config.target_urls, &pr.key.org, &pr.key.repo) {
        return Some(url.clone());
    }
    let base = lookup_most_specific(&config.pr_status_base_urls, &pr.key.org, &pr.key.repo)?;
    let query = format!(
        "is:pr repo:{} author:{} head:{}",
        pr.key.slug(),
        pr.author,
        pr.head_ref
    );
    let escaped: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
    Some(format!("{base}?query={escaped}"))
}

fn truncate(description: String) -> String {
    if description.len() <= MAX_DESCRIPTION_LENGTH {
        return description;
    }
    let mut truncated: String = description
        .chars()
        .take(MAX_DESCRIPTION_LENGTH - 3)
        .collect();
    truncated.push_str("...");
    truncated
}
