//! forge::traits
//!
//! Forge trait definition for interacting with the code host.
//!
//! # Design
//!
//! The `ForgeClient` trait is async because forge operations involve
//! network I/O. All methods return `Result` to handle API errors
//! gracefully. The controllers depend only on this trait; the concrete
//! GitHub client and the in-memory mock both implement it.
//!
//! Merge conflicts are an expected domain outcome, not an error: `merge`
//! returns [`MergeOutcome::Conflict`] for them and reserves `Err` for
//! transient and permission failures.
//!
//! # Example
//!
//! ```ignore
//! use tideway::forge::{ForgeClient, StatusPayload};
//! use tideway::core::types::ContextState;
//!
//! async fn publish(forge: &dyn ForgeClient) -> Result<(), ForgeError> {
//!     let prs = forge.search_pull_requests("is:pr state:open org:\"o\"").await?;
//!     for pr in &prs {
//!         forge.create_status(&pr.key.org, &pr.key.repo, &pr.head_sha, &StatusPayload {
//!             context: "tide".to_string(),
//!             state: ContextState::Pending,
//!             description: "Not mergeable. Needs lgtm label.".to_string(),
//!             target_url: None,
//!         }).await?;
//!     }
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use thiserror::Error;

use crate::core::types::{ContextMap, ContextState, PullRequest, Sha};

/// Errors from forge operations.
///
/// These error types map to common failure modes when interacting with a
/// remote code host.
#[derive(Debug, Clone, Error)]
pub enum ForgeError {
    /// Authentication failed (invalid token, expired, insufficient permissions).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limit exceeded.
    #[error("rate limited")]
    RateLimited,

    /// API returned an error.
    #[error("API error: {status} - {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Network or connection error.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The remote call did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),
}

impl ForgeError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ForgeError::RateLimited
                | ForgeError::NetworkError(_)
                | ForgeError::Timeout(_)
                | ForgeError::ApiError { status: 500..=599, .. }
        )
    }
}

/// An issue returned from an issue search.
///
/// Only the fields the blocker tracker reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// Issue number.
    pub number: u64,
    /// Issue title.
    pub title: String,
    /// Organization the issue lives in.
    pub org: String,
    /// Repository the issue lives in.
    pub repo: String,
}

/// A status write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPayload {
    /// Context name the status is published under.
    pub context: String,
    /// Status state.
    pub state: ContextState,
    /// Human-readable description.
    pub description: String,
    /// Optional details link.
    pub target_url: Option<String>,
}

/// Merge method for merging a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    /// Create a merge commit.
    #[default]
    Merge,
    /// Squash all commits and merge.
    Squash,
    /// Rebase commits onto the base branch.
    Rebase,
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeMethod::Merge => write!(f, "merge"),
            MergeMethod::Squash => write!(f, "squash"),
            MergeMethod::Rebase => write!(f, "rebase"),
        }
    }
}

/// A merge request for a single PR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Head sha the merge is conditional on; the forge rejects the merge
    /// if the PR head moved.
    pub sha: Sha,
    /// Merge method.
    pub method: MergeMethod,
    /// Commit title override.
    pub commit_title: Option<String>,
    /// Commit body override.
    pub commit_body: Option<String>,
}

/// Outcome of a merge call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The PR was merged.
    Merged,
    /// The forge refused the merge because of a conflict or a moved head.
    Conflict,
}

/// The `ForgeClient` trait for interacting with the code host.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the client is shared across the
/// sync and status controllers and across fan-out workers. Rate-limit
/// accounting is the implementation's concern.
///
/// # Error Handling
///
/// All methods return `Result<T, ForgeError>`. Callers isolate failures
/// per shard or per PR; a single failed call never aborts a tick.
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Get the forge name (e.g., "github").
    fn name(&self) -> &'static str;

    /// Run a PR search and return one snapshot per open result.
    ///
    /// The returned snapshots carry everything except the status roll-up,
    /// which is fetched lazily via [`combined_status`](Self::combined_status).
    ///
    /// # Errors
    ///
    /// - `RateLimited` / `NetworkError` / `Timeout` on transient failures
    /// - `ApiError` if the search string is rejected
    async fn search_pull_requests(&self, query: &str) -> Result<Vec<PullRequest>, ForgeError>;

    /// Run an issue search.
    async fn search_issues(&self, query: &str) -> Result<Vec<Issue>, ForgeError>;

    /// Fetch the combined status roll-up for a commit.
    ///
    /// Classic commit statuses and check runs are merged into one map
    /// keyed by context name.
    async fn combined_status(
        &self,
        org: &str,
        repo: &str,
        sha: &Sha,
    ) -> Result<ContextMap, ForgeError>;

    /// Publish a status context on a commit.
    async fn create_status(
        &self,
        org: &str,
        repo: &str,
        sha: &Sha,
        status: &StatusPayload,
    ) -> Result<(), ForgeError>;

    /// Merge a pull request.
    ///
    /// # Errors
    ///
    /// A merge refused for conflicts is `Ok(MergeOutcome::Conflict)`, not
    /// an error. `Err` is reserved for transient and permission failures.
    async fn merge(
        &self,
        org: &str,
        repo: &str,
        number: u64,
        request: &MergeRequest,
    ) -> Result<MergeOutcome, ForgeError>;

    /// List the filenames changed by a pull request.
    ///
    /// Fetched lazily; only needed when a job's change-based trigger rule
    /// must be evaluated.
    async fn pull_request_changes(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Result<Vec<String>, ForgeError>;

    /// Required status contexts from branch protection, empty if the
    /// branch is unprotected.
    async fn branch_protection_contexts(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<String>, ForgeError>;
}
