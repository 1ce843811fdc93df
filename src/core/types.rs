//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`BranchName`] - Validated Git branch name
//! - [`Sha`] - Git commit identifier (40 hex chars)
//! - [`PrKey`] - Stable identity of a pull request, `(org, repo, number)`
//! - [`PoolKey`] - Identity of a merge pool, `(org, repo, base branch)`
//! - [`PullRequest`] - One tick's snapshot of a pull request
//! - [`ContextState`] - State of a single status context
//! - [`MergeableState`] - The forge's merge-state tri-value
//! - [`ReviewDecision`] - The forge's review-decision tri-value
//!
//! # Validation
//!
//! `BranchName` and `Sha` enforce validity at construction time. Invalid
//! values cannot be represented, preventing entire classes of bugs.
//!
//! # Examples
//!
//! ```
//! use tideway::core::types::{BranchName, PrKey, Sha};
//!
//! let branch = BranchName::new("release-1.2").unwrap();
//! let sha = Sha::new("abc123def4567890abc123def4567890abc12345").unwrap();
//! let key = PrKey::new("kubernetes", "test-infra", 42);
//! assert_eq!(key.to_string(), "kubernetes/test-infra#42");
//!
//! assert!(BranchName::new("invalid..name").is_err());
//! assert!(Sha::new("not-a-sha").is_err());
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from type validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid branch name: {0}")]
    InvalidBranchName(String),

    #[error("invalid commit sha: {0}")]
    InvalidSha(String),
}

/// A validated Git branch name.
///
/// Branch names must conform to Git's refname rules (see
/// `git check-ref-format`):
/// - Cannot be empty
/// - Cannot start with `.` or `-`
/// - Cannot end with `.lock` or `/`
/// - Cannot contain `..`, `@{`, `//`, or ASCII control characters
/// - Cannot contain spaces, `~`, `^`, `:`, `\`, `?`, `*`, `[`
/// - Cannot be exactly `@`
///
/// # Example
///
/// ```
/// use tideway::core::types::BranchName;
///
/// let name = BranchName::new("feature/my-branch").unwrap();
/// assert_eq!(name.as_str(), "feature/my-branch");
///
/// assert!(BranchName::new("").is_err());
/// assert!(BranchName::new(".hidden").is_err());
/// assert!(BranchName::new("has space").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BranchName(String);

impl BranchName {
    /// Create a new validated branch name.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidBranchName` if the name violates Git's
    /// refname rules.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Validate a branch name against Git's refname rules.
    fn validate(name: &str) -> Result<(), TypeError> {
        if name.is_empty() {
            return Err(TypeError::InvalidBranchName(
                "branch name cannot be empty".into(),
            ));
        }
        if name == "@" {
            return Err(TypeError::InvalidBranchName(
                "branch name cannot be '@' (reserved)".into(),
            ));
        }
        if name.starts_with('.') || name.starts_with('-') {
            return Err(TypeError::InvalidBranchName(
                "branch name cannot start with '.' or '-'".into(),
            ));
        }
        if name.ends_with('/') || name.ends_with(".lock") {
            return Err(TypeError::InvalidBranchName(
                "branch name cannot end with '/' or '.lock'".into(),
            ));
        }
        if name.contains("..") || name.contains("//") || name.contains("@{") {
            return Err(TypeError::InvalidBranchName(
                "branch name cannot contain '..', '//', or '@{'".into(),
            ));
        }
        for c in name.chars() {
            if c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '\\' | '?' | '*' | '[')
            {
                return Err(TypeError::InvalidBranchName(format!(
                    "branch name cannot contain '{}'",
                    c.escape_default()
                )));
            }
        }
        if name
            .split('/')
            .any(|c| c.starts_with('.') || c.ends_with(".lock"))
        {
            return Err(TypeError::InvalidBranchName(
                "branch name component cannot start with '.' or end with '.lock'".into(),
            ));
        }
        Ok(())
    }

    /// Get the branch name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for BranchName {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BranchName> for String {
    fn from(value: BranchName) -> Self {
        value.0
    }
}

/// A validated Git commit identifier (full 40-character hex SHA).
///
/// # Example
///
/// ```
/// use tideway::core::types::Sha;
///
/// let sha = Sha::new("abc123def4567890abc123def4567890abc12345").unwrap();
/// assert_eq!(sha.as_str().len(), 40);
///
/// assert!(Sha::new("abc123").is_err());
/// assert!(Sha::new("zzz123def4567890abc123def4567890abc12345").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha(String);

impl Sha {
    /// Create a new validated commit sha.
    ///
    /// # Errors
    ///
    /// Returns `TypeError::InvalidSha` unless the value is exactly 40 hex
    /// characters. The stored form is lowercase.
    pub fn new(sha: impl Into<String>) -> Result<Self, TypeError> {
        let sha = sha.into();
        if sha.len() != 40 {
            return Err(TypeError::InvalidSha(format!(
                "expected 40 characters, got {}",
                sha.len()
            )));
        }
        if !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TypeError::InvalidSha("non-hex character".into()));
        }
        Ok(Self(sha.to_ascii_lowercase()))
    }

    /// Get the sha as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Sha {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Sha> for String {
    fn from(value: Sha) -> Self {
        value.0
    }
}

/// Stable identity of a pull request: `(org, repo, number)`.
///
/// Pools and controllers refer to pull requests by key, never by reference.
/// PR snapshots live in a flat per-tick vector; anything longer-lived than a
/// tick holds a `PrKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrKey {
    /// Organization (owner) login.
    pub org: String,
    /// Repository name.
    pub repo: String,
    /// Pull request number.
    pub number: u64,
}

impl PrKey {
    /// Create a pull request key.
    pub fn new(org: impl Into<String>, repo: impl Into<String>, number: u64) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
            number,
        }
    }

    /// The `"org/repo"` slug this PR belongs to.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }
}

impl fmt::Display for PrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.org, self.repo, self.number)
    }
}

/// Identity of a merge pool: `(org, repo, base branch)`.
///
/// All pull requests in a pool target the same base branch of the same
/// repository and are subject to the same merge decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    /// Organization (owner) login.
    pub org: String,
    /// Repository name.
    pub repo: String,
    /// Base branch the pool merges into.
    pub branch: BranchName,
}

impl PoolKey {
    /// Create a pool key.
    pub fn new(org: impl Into<String>, repo: impl Into<String>, branch: BranchName) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
            branch,
        }
    }

    /// The `"org/repo"` slug this pool belongs to.
    pub fn slug(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.org, self.repo, self.branch)
    }
}

/// State of a single status context on a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    /// The context reported success.
    Success,
    /// The context is still running (or queued).
    Pending,
    /// The context reported failure.
    Failure,
    /// The context reported an infrastructure error.
    Error,
}

impl ContextState {
    /// Whether this state counts as green for merge eligibility.
    pub fn is_success(self) -> bool {
        matches!(self, ContextState::Success)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextState::Success => write!(f, "success"),
            ContextState::Pending => write!(f, "pending"),
            ContextState::Failure => write!(f, "failure"),
            ContextState::Error => write!(f, "error"),
        }
    }
}

/// The forge's merge-state tri-value for a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeableState {
    /// The PR can be merged cleanly.
    Clean,
    /// The PR conflicts with its base branch.
    Conflicting,
    /// The forge has not finished computing mergeability.
    Unknown,
}

impl fmt::Display for MergeableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeableState::Clean => write!(f, "clean"),
            MergeableState::Conflicting => write!(f, "conflicting"),
            MergeableState::Unknown => write!(f, "unknown"),
        }
    }
}

/// The forge's review-decision tri-value for a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    /// Required reviews are satisfied.
    Approved,
    /// At least one reviewer requested changes.
    ChangesRequested,
    /// Required reviews have not been given yet.
    ReviewRequired,
}

/// Roll-up of status contexts at a PR head, keyed by context name.
///
/// Combines classic commit statuses and check runs into one logical map.
pub type ContextMap = BTreeMap<String, ContextState>;

/// One tick's snapshot of a pull request.
///
/// Immutable for the duration of a tick. Rebuilt from the forge on the next
/// tick; no component holds one across ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Stable identity.
    pub key: PrKey,
    /// PR title.
    pub title: String,
    /// Author login.
    pub author: String,
    /// Head commit of the PR.
    pub head_sha: Sha,
    /// Head ref (branch) name.
    pub head_ref: String,
    /// Base branch the PR targets.
    pub base_branch: BranchName,
    /// The base branch head the forge last evaluated this PR against.
    pub base_sha: Option<Sha>,
    /// Labels currently on the PR.
    pub labels: BTreeSet<String>,
    /// Milestone title, if assigned.
    pub milestone: Option<String>,
    /// Whether the PR is a draft.
    pub draft: bool,
    /// Merge-state as reported by the forge.
    pub mergeable: MergeableState,
    /// Review decision, when the forge computes one.
    pub review_decision: Option<ReviewDecision>,
    /// Status roll-up at `head_sha`, keyed by context name.
    pub contexts: ContextMap,
}

impl PullRequest {
    /// Whether the PR carries every label in `wanted`.
    pub fn has_all_labels<'a, I>(&self, wanted: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        wanted.into_iter().all(|l| self.labels.contains(l))
    }
}

/// The last status tuple published for a PR head.
///
/// Kept only to suppress redundant writes; not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    /// Published state.
    pub state: ContextState,
    /// Published description.
    pub description: String,
    /// Published target URL, if any.
    pub target_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_valid() {
        for name in ["main", "release-1.2", "feature/x", "user@feature"] {
            assert!(BranchName::new(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn branch_name_invalid() {
        for name in [
            "",
            "@",
            ".hidden",
            "-flag",
            "a..b",
            "a//b",
            "a@{b",
            "trailing/",
            "x.lock",
            "has space",
            "col:on",
            "a/.b",
        ] {
            assert!(BranchName::new(name).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn sha_validation() {
        let sha = Sha::new("ABC123DEF4567890abc123def4567890abc12345").unwrap();
        // Normalized to lowercase.
        assert_eq!(sha.as_str(), "abc123def4567890abc123def4567890abc12345");

        assert!(Sha::new("abc123").is_err());
        assert!(Sha::new("g".repeat(40)).is_err());
    }

    #[test]
    fn pr_key_display() {
        let key = PrKey::new("o", "r", 42);
        assert_eq!(key.to_string(), "o/r#42");
        assert_eq!(key.slug(), "o/r");
    }

    #[test]
    fn pool_key_display() {
        let key = PoolKey::new("o", "r", BranchName::new("main").unwrap());
        assert_eq!(key.to_string(), "o/r:main");
    }

    #[test]
    fn context_state_display_and_success() {
        assert_eq!(ContextState::Success.to_string(), "success");
        assert_eq!(ContextState::Pending.to_string(), "pending");
        assert!(ContextState::Success.is_success());
        assert!(!ContextState::Failure.is_success());
    }

    #[test]
    fn branch_name_serde_roundtrip() {
        let branch = BranchName::new("release/v2").unwrap();
        let json = serde_json::to_string(&branch).unwrap();
        let parsed: BranchName = serde_json::from_str(&json).unwrap();
        assert_eq!(branch, parsed);

        // Invalid names are rejected at deserialization time.
        assert!(serde_json::from_str::<BranchName>("\"a..b\"").is_err());
    }

    #[test]
    fn has_all_labels() {
        let pr = PullRequest {
            key: PrKey::new("o", "r", 1),
            title: "t".into(),
            author: "a".into(),
            head_sha: Sha::new("1".repeat(40)).unwrap(),
            head_ref: "feature".into(),
            base_branch: BranchName::new("main").unwrap(),
            base_sha: None,
            labels: ["lgtm".to_string(), "approved".to_string()].into(),
            milestone: None,
            draft: false,
            mergeable: MergeableState::Clean,
            review_decision: None,
            contexts: ContextMap::new(),
        };
        assert!(pr.has_all_labels(["lgtm"]));
        assert!(pr.has_all_labels(["lgtm", "approved"]));
        assert!(!pr.has_all_labels(["lgtm", "missing"]));
    }
}
