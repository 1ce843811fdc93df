//! forge::mock
//!
//! Mock forge implementation for deterministic testing.
//!
//! # Design
//!
//! The mock forge provides a deterministic implementation of the
//! `ForgeClient` trait. It stores PRs, issues, and context roll-ups in
//! memory and allows configuring failure scenarios per method.
//!
//! Search filtering is intentionally coarse: a stored PR or issue is
//! returned when the search string mentions its org (`org:"o"`) or its
//! repo (`repo:"o/r"`), or mentions neither. The controllers re-classify
//! every result against the configured queries, so returning a superset
//! is exactly what the real search API does too.
//!
//! # Example
//!
//! ```
//! use tideway::forge::mock::MockForge;
//! use tideway::forge::ForgeClient;
//!
//! # tokio_test::block_on(async {
//! let forge = MockForge::new();
//! let prs = forge.search_pull_requests("is:pr org:\"o\"").await.unwrap();
//! assert!(prs.is_empty());
//! # });
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::traits::{
    ForgeClient, ForgeError, Issue, MergeOutcome, MergeRequest, StatusPayload,
};
use crate::core::types::{ContextMap, PrKey, PullRequest, Sha};

/// Mock forge for testing.
///
/// Thread-safe via internal `Arc<Mutex<...>>` wrapping; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockForge {
    inner: Arc<Mutex<MockForgeInner>>,
}

/// Internal mutable state.
#[derive(Debug, Default)]
struct MockForgeInner {
    /// Open PRs by key.
    prs: BTreeMap<PrKey, PullRequest>,
    /// Keys of PRs that have been merged through the mock.
    merged: BTreeSet<PrKey>,
    /// Stored issues.
    issues: Vec<Issue>,
    /// Context roll-ups by `(org, repo, sha)`.
    contexts: HashMap<(String, String, Sha), ContextMap>,
    /// Changed files by PR key.
    changes: HashMap<PrKey, Vec<String>>,
    /// Branch-protection contexts by `(org, repo, branch)`.
    protection: HashMap<(String, String, String), Vec<String>>,
    /// Merge outcome overrides by PR key.
    merge_outcomes: HashMap<PrKey, MergeOutcome>,
    /// Method to fail on (for testing error paths).
    fail_on: Option<FailOn>,
    /// Recorded operations for verification.
    operations: Vec<MockOperation>,
}

/// Configuration for which operation should fail.
#[derive(Debug, Clone)]
pub enum FailOn {
    /// Fail `search_pull_requests` with the given error.
    SearchPullRequests(ForgeError),
    /// Fail `search_issues` with the given error.
    SearchIssues(ForgeError),
    /// Fail `combined_status` with the given error.
    CombinedStatus(ForgeError),
    /// Fail `create_status` with the given error.
    CreateStatus(ForgeError),
    /// Fail `merge` with the given error.
    Merge(ForgeError),
}

/// A recorded operation, for asserting on side effects.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOperation {
    /// A PR search ran with this query.
    SearchPullRequests(String),
    /// An issue search ran with this query.
    SearchIssues(String),
    /// A status was published.
    CreateStatus {
        /// Organization.
        org: String,
        /// Repository.
        repo: String,
        /// Commit the status was set on.
        sha: Sha,
        /// The published payload.
        status: StatusPayload,
    },
    /// A merge was attempted.
    Merge {
        /// The PR that was merged.
        key: PrKey,
        /// The request that was sent.
        request: MergeRequest,
    },
}

/// Whether a search string targets `(org, repo)`.
///
/// Empty targeting (no org/repo tokens) matches everything.
fn query_targets(query: &str, org: &str, repo: &str) -> bool {
    let has_selectors = query.contains("org:\"") || query.contains("repo:\"");
    if !has_selectors {
        return true;
    }
    query.contains(&format!("org:\"{org}\"")) || query.contains(&format!("repo:\"{org}/{repo}\""))
}

impl MockForge {
    /// Create an empty mock forge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) an open PR.
    pub fn add_pull_request(&self, pr: PullRequest) {
        let mut inner = self.inner.lock().unwrap();
        inner.merged.remove(&pr.key);
        inner.prs.insert(pr.key.clone(), pr);
    }

    /// Add an issue.
    pub fn add_issue(&self, issue: Issue) {
        self.inner.lock().unwrap().issues.push(issue);
    }

    /// Set the context roll-up for a commit.
    pub fn set_contexts(&self, org: &str, repo: &str, sha: &Sha, contexts: ContextMap) {
        self.inner
            .lock()
            .unwrap()
            .contexts
            .insert((org.to_string(), repo.to_string(), sha.clone()), contexts);
    }

    /// Set the changed files for a PR.
    pub fn set_changes(&self, key: &PrKey, files: Vec<String>) {
        self.inner.lock().unwrap().changes.insert(key.clone(), files);
    }

    /// Set branch-protection required contexts for a branch.
    pub fn set_protection(&self, org: &str, repo: &str, branch: &str, contexts: Vec<String>) {
        self.inner.lock().unwrap().protection.insert(
            (org.to_string(), repo.to_string(), branch.to_string()),
            contexts,
        );
    }

    /// Force the outcome of merging a specific PR.
    pub fn set_merge_outcome(&self, key: &PrKey, outcome: MergeOutcome) {
        self.inner
            .lock()
            .unwrap()
            .merge_outcomes
            .insert(key.clone(), outcome);
    }

    /// Configure a method to fail.
    pub fn fail_on(&self, fail: FailOn) {
        self.inner.lock().unwrap().fail_on = Some(fail);
    }

    /// Clear any configured failure.
    pub fn clear_failure(&self) {
        self.inner.lock().unwrap().fail_on = None;
    }

    /// Keys of PRs merged through the mock, in order-independent form.
    pub fn merged(&self) -> BTreeSet<PrKey> {
        self.inner.lock().unwrap().merged.clone()
    }

    /// All recorded operations, in call order.
    pub fn operations(&self) -> Vec<MockOperation> {
        self.inner.lock().unwrap().operations.clone()
    }

    /// The statuses published for a commit, in call order.
    pub fn statuses_for(&self, sha: &Sha) -> Vec<StatusPayload> {
        self.inner
            .lock()
            .unwrap()
            .operations
            .iter()
            .filter_map(|op| match op {
                MockOperation::CreateStatus { sha: s, status, .. } if s == sha => {
                    Some(status.clone())
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ForgeClient for MockForge {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn search_pull_requests(&self, query: &str) -> Result<Vec<PullRequest>, ForgeError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .operations
            .push(MockOperation::SearchPullRequests(query.to_string()));
        if let Some(FailOn::SearchPullRequests(e)) = &inner.fail_on {
            return Err(e.clone());
        }
        Ok(inner
            .prs
            .values()
            .filter(|pr| !inner.merged.contains(&pr.key))
            .filter(|pr| query_targets(query, &pr.key.org, &pr.key.repo))
            .cloned()
            .collect())
    }

    async fn search_issues(&self, query: &str) -> Result<Vec<Issue>, ForgeError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .operations
            .push(MockOperation::SearchIssues(query.to_string()));
        if let Some(FailOn::SearchIssues(e)) = &inner.fail_on {
            return Err(e.clone());
        }
        Ok(inner
            .issues
            .iter()
            .filter(|issue| query_targets(query, &issue.org, &issue.repo))
            .cloned()
            .collect())
    }

    async fn combined_status(
        &self,
        org: &str,
        repo: &str,
        sha: &Sha,
    ) -> Result<ContextMap, ForgeError> {
        let inner = self.inner.lock().unwrap();
        if let Some(FailOn::CombinedStatus(e)) = &inner.fail_on {
            return Err(e.clone());
        }
        Ok(inner
            .contexts
            .get(&(org.to_string(), repo.to_string(), sha.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_status(
        &self,
        org: &str,
        repo: &str,
        sha: &Sha,
        status: &StatusPayload,
    ) -> Result<(), ForgeError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(FailOn::CreateStatus(e)) = &inner.fail_on {
            return Err(e.clone());
        }
        inner.operations.push(MockOperation::CreateStatus {
            org: org.to_string(),
            repo: repo.to_string(),
            sha: sha.clone(),
            status: status.clone(),
        });
        Ok(())
    }

    async fn merge(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        request: &MergeRequest,
    ) -> Result<MergeOutcome, ForgeError> {
        let key = PrKey::new(org, repo, number);
        let mut inner = self.inner.lock().unwrap();
        if let Some(FailOn::Merge(e)) = &inner.fail_on {
            return Err(e.clone());
        }
        inner.operations.push(MockOperation::Merge {
            key: key.clone(),
            request: request.clone(),
        });
        if !inner.prs.contains_key(&key) {
            return Err(ForgeError::NotFound(format!("{key}")));
        }
        let outcome = inner
            .merge_outcomes
            .get(&key)
            .copied()
            .unwrap_or(MergeOutcome::Merged);
        if outcome == MergeOutcome::Merged {
            inner.merged.insert(key);
        }
        Ok(outcome)
    }

    async fn pull_request_changes(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<String>, ForgeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .changes
            .get(&PrKey::new(org, repo, number))
            .cloned()
            .unwrap_or_default())
    }

    async fn branch_protection_contexts(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<String>, ForgeError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .protection
            .get(&(org.to_string(), repo.to_string(), branch.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
