//! engine::merge
//!
//! Merge method resolution and execution.
//!
//! # Method resolution
//!
//! For `(org, repo, branch)`, first match wins:
//!
//! 1. exact key `"org/repo@branch"`
//! 2. a branch pattern under `[merge_method.org.repos.repo.branches]`,
//!    patterns tried in lexicographic order
//! 3. exact key `"org/repo"`
//! 4. the repo's `merge_type`, or the `"*"` repo's
//! 5. the org's `merge_type`
//! 6. `"merge"`
//!
//! Override labels on the PR outrank all of it; carrying two override
//! labels at once is an error and the PR is not merged.

use regex::Regex;
use thiserror::Error;
use tracing::warn;

use crate::core::config::{MergeMethodEntry, TideConfig};
use crate::core::types::PullRequest;
use crate::forge::{ForgeClient, ForgeError, MergeMethod, MergeOutcome, MergeRequest};

/// Errors from merge execution.
#[derive(Debug, Error)]
pub enum MergeError {
    /// The PR carries more than one merge-method override label.
    #[error("conflicting merge method override labels: {}", .0.join(", "))]
    ConflictingOverrides(Vec<String>),

    /// The forge rejected the merge for non-conflict reasons.
    #[error(transparent)]
    Forge(#[from] ForgeError),
}

/// Resolve the configured merge method for `(org, repo, branch)`.
pub fn resolve_method(config: &TideConfig, org: &str, repo: &str, branch: &str) -> MergeMethod {
    let methods = &config.merge_method;

    // 1. Exact org/repo@branch key.
    if let Some(MergeMethodEntry::Method(m)) = methods.get(&format!("{org}/{repo}@{branch}")) {
        return *m;
    }

    let org_entry = match methods.get(org) {
        Some(MergeMethodEntry::Org(o)) => Some(o),
        _ => None,
    };

    // 2. Branch patterns, lexicographic key order, first match wins.
    if let Some(repo_entry) = org_entry.and_then(|o| o.repos.get(repo)) {
        for (pattern, method) in &repo_entry.branches {
            match Regex::new(&format!("^(?:{pattern})$")) {
                Ok(re) if re.is_match(branch) => return *method,
                Ok(_) => {}
                // Validation compiles every pattern at load; an error here
                // means the snapshot predates a stricter check.
                Err(e) => warn!(pattern, error = %e, "skipping unparseable branch pattern"),
            }
        }
    }

    // 3. Exact org/repo key.
    if let Some(MergeMethodEntry::Method(m)) = methods.get(&format!("{org}/{repo}")) {
        return *m;
    }

    // 4. Repo-level merge_type, with "*" fallback.
    if let Some(org_entry) = org_entry {
        if let Some(m) = org_entry.repos.get(repo).and_then(|r| r.merge_type) {
            return m;
        }
        if let Some(m) = org_entry.repos.get("*").and_then(|r| r.merge_type) {
            return m;
        }
        // 5. Org-level merge_type.
        if let Some(m) = org_entry.merge_type {
            return m;
        }
    }

    // 6. Default.
    MergeMethod::default()
}

/// Determine the effective merge method for a PR, applying override
/// labels.
///
/// # Errors
///
/// `MergeError::ConflictingOverrides` when the PR carries two or more
/// override labels.
pub fn determine_method(config: &TideConfig, pr: &PullRequest) -> Result<MergeMethod, MergeError> {
    let overrides: Vec<(&str, MergeMethod)> = [
        (config.squash_override_label.as_str(), MergeMethod::Squash),
        (config.rebase_override_label.as_str(), MergeMethod::Rebase),
        (config.merge_override_label.as_str(), MergeMethod::Merge),
    ]
    .into_iter()
    .filter(|(label, _)| pr.labels.contains(*label))
    .collect();

    match overrides.as_slice() {
        [] => Ok(resolve_method(
            config,
            &pr.key.org,
            &pr.key.repo,
            pr.base_branch.as_str(),
        )),
        [(_, method)] => Ok(*method),
        several => Err(MergeError::ConflictingOverrides(
            several.iter().map(|(label, _)| label.to_string()).collect(),
        )),
    }
}

/// Merge one PR.
///
/// Transient forge failures are retried once; a conflict is returned as
/// an outcome for the caller to mark, not retried.
///
/// # Errors
///
/// `MergeError::ConflictingOverrides` before any forge call;
/// `MergeError::Forge` after the retry is also lost.
pub async fn merge_pull_request(
    forge: &dyn ForgeClient,
    config: &TideConfig,
    pr: &PullRequest,
) -> Result<MergeOutcome, MergeError> {
    let method = determine_method(config, pr)?;

    let request = MergeRequest {
        sha: pr.head_sha.clone(),
        method,
        // The forge composes its own title except for squash, where the
        // PR title is the whole story.
        commit_title: match method {
            MergeMethod::Squash => Some(format!("{} (#{})", pr.title, pr.key.number)),
            _ => None,
        },
        commit_body: None,
    };

    match forge
        .merge(&pr.key.org, &pr.key.repo, pr.key.number, &request)
        .await
    {
        Ok(outcome) => Ok(outcome),
        Err(e) if e.is_transient() => {
            warn!(pr = %pr.key, error = %e, "merge failed transiently, retrying once");
            Ok(forge
                .merge(&pr.key.org, &pr.key.repo, pr.key.number, &request)
                .await?)
        }
        Err(e) => Err(e.into()),
    }
}
