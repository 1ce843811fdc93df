//! core::config::schema
//!
//! Configuration schema types for the merge controller.
//!
//! # Layout
//!
//! One TOML document configures both controllers. The interesting surfaces:
//!
//! - `[[queries]]` - which PRs are candidates for merge
//! - `[merge_method]` - per org/repo/branch merge strategy
//! - `[batch_size_limit]` / `[prioritize_existing_batches]` - batch tuning
//! - `[[priority]]` - label sets that order merge candidates
//! - `[context_options]` - required-context policy overrides
//! - `[presubmits]` - test jobs per `"org/repo"`
//! - `[target_urls]` / `[pr_status_base_urls]` - status link resolution
//!
//! # Validation
//!
//! Config values are validated after parsing. Invalid queries, malformed
//! `org/repo` slugs, unparseable branch patterns, and conflicting label
//! rules are load-time errors, never tick-time surprises.
//!
//! # Example
//!
//! ```toml
//! sync_period_secs = 60
//! max_workers = 20
//! status_context = "tide"
//! blocker_label = "merge-blocker"
//!
//! [[queries]]
//! orgs = ["kubernetes"]
//! labels = ["lgtm", "approved"]
//! missing_labels = ["do-not-merge/hold"]
//!
//! [merge_method]
//! "kubernetes/test-infra" = "squash"
//!
//! [batch_size_limit]
//! "*" = 5
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::core::types::BranchName;
use crate::forge::MergeMethod;

fn default_sync_period_secs() -> u64 {
    60
}

fn default_max_workers() -> usize {
    20
}

fn default_status_context() -> String {
    "tide".to_string()
}

fn default_squash_label() -> String {
    "tide/merge-method-squash".to_string()
}

fn default_rebase_label() -> String {
    "tide/merge-method-rebase".to_string()
}

fn default_merge_label() -> String {
    "tide/merge-method-merge".to_string()
}

fn default_unknown_mergeable_retries() -> u32 {
    3
}

/// Default batch size bound when no `batch_size_limit` key matches.
pub const DEFAULT_BATCH_SIZE_LIMIT: i64 = 5;

/// Top-level controller configuration.
///
/// Supplied to the engine as an atomic snapshot; the engine never reads the
/// file itself. Swapping snapshots between ticks is allowed, mid-tick is not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TideConfig {
    /// Seconds between sync ticks.
    pub sync_period_secs: u64,

    /// Seconds between status-controller passes. Defaults to `sync_period_secs`.
    pub status_update_period_secs: Option<u64>,

    /// Upper bound on concurrently processed pools and fan-out fetches.
    pub max_workers: usize,

    /// Name of the status context this controller publishes.
    pub status_context: String,

    /// Emit one search per org (required when auth tokens are org-scoped).
    pub org_scoped_auth: bool,

    /// Membership queries. A PR is a candidate iff it fully matches at
    /// least one query.
    pub queries: Vec<QueryConfig>,

    /// Issue label that marks merge blockers. Blocker tracking is disabled
    /// when unset.
    pub blocker_label: Option<String>,

    /// Ordered label sets; PRs matching an earlier entry merge first.
    pub priority: Vec<PriorityEntry>,

    /// Batch size bound by most-specific key: `"org/repo"`, `"org"`, `"*"`.
    /// `0` removes the bound, `-1` disables batching.
    pub batch_size_limit: BTreeMap<String, i64>,

    /// Whether a still-valid in-flight batch is preferred over forming a
    /// new one. Most-specific key wins; default `true`.
    pub prioritize_existing_batches: BTreeMap<String, bool>,

    /// Merge strategy selection. Keys are `"org"`, `"org/repo"`, or
    /// `"org/repo@branch"`; org entries may carry nested repo and branch
    /// pattern tables.
    pub merge_method: BTreeMap<String, MergeMethodEntry>,

    /// Label that overrides the merge method to squash.
    pub squash_override_label: String,

    /// Label that overrides the merge method to rebase.
    pub rebase_override_label: String,

    /// Label that overrides the merge method to merge.
    pub merge_override_label: String,

    /// Status link by most-specific key: `"org/repo"`, `"org"`, `"*"`.
    pub target_urls: BTreeMap<String, String>,

    /// Dashboard base URL used to synthesize a status link when no
    /// `target_urls` key matches. Mutually exclusive with `target_urls`
    /// at any one match level.
    pub pr_status_base_urls: BTreeMap<String, String>,

    /// Show every query applying to the PR's branch in the status
    /// description, joined with `" OR "`.
    pub display_all_tide_queries_in_status: bool,

    /// Required-context policy overrides, in org -> repo -> branch order.
    pub context_options: ContextPolicyOptions,

    /// Treat non-conditional manually-triggered jobs as required.
    pub require_manually_triggered_jobs: bool,

    /// Presubmit job definitions keyed by `"org/repo"`.
    pub presubmits: BTreeMap<String, Vec<Presubmit>>,

    /// How many consecutive ticks a PR with unknown merge-state is retried
    /// before being treated as conflicting.
    pub unknown_mergeable_retries: u32,
}

impl Default for TideConfig {
    fn default() -> Self {
        Self {
            sync_period_secs: default_sync_period_secs(),
            status_update_period_secs: None,
            max_workers: default_max_workers(),
            status_context: default_status_context(),
            org_scoped_auth: false,
            queries: Vec::new(),
            blocker_label: None,
            priority: Vec::new(),
            batch_size_limit: BTreeMap::new(),
            prioritize_existing_batches: BTreeMap::new(),
            merge_method: BTreeMap::new(),
            squash_override_label: default_squash_label(),
            rebase_override_label: default_rebase_label(),
            merge_override_label: default_merge_label(),
            target_urls: BTreeMap::new(),
            pr_status_base_urls: BTreeMap::new(),
            display_all_tide_queries_in_status: false,
            context_options: ContextPolicyOptions::default(),
            require_manually_triggered_jobs: false,
            presubmits: BTreeMap::new(),
            unknown_mergeable_retries: default_unknown_mergeable_retries(),
        }
    }
}

impl TideConfig {
    /// Seconds between sync ticks, as a `Duration`.
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }

    /// Seconds between status passes, as a `Duration`.
    ///
    /// Falls back to the sync period when unset.
    pub fn status_update_period(&self) -> Duration {
        Duration::from_secs(
            self.status_update_period_secs
                .unwrap_or(self.sync_period_secs),
        )
    }

    /// Batch size bound for `(org, repo)`, most-specific key first.
    pub fn batch_size_limit_for(&self, org: &str, repo: &str) -> i64 {
        super::lookup_most_specific(&self.batch_size_limit, org, repo)
            .copied()
            .unwrap_or(DEFAULT_BATCH_SIZE_LIMIT)
    }

    /// Whether an in-flight batch should be preferred over a new one.
    pub fn prioritize_existing_batches_for(&self, org: &str, repo: &str) -> bool {
        super::lookup_most_specific(&self.prioritize_existing_batches, org, repo)
            .copied()
            .unwrap_or(true)
    }

    /// Presubmit jobs configured for `(org, repo)`.
    pub fn presubmits_for(&self, org: &str, repo: &str) -> &[Presubmit] {
        self.presubmits
            .get(&format!("{org}/{repo}"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Validate the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` encountered: invalid period or
    /// worker bound, invalid query (see [`QueryConfig::validate`]),
    /// malformed merge-method keys or branch patterns, a key present in
    /// both `target_urls` and `pr_status_base_urls`, or duplicate contexts
    /// across context-policy sets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_period_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "sync_period_secs must be positive".into(),
            ));
        }
        if self.status_update_period_secs == Some(0) {
            return Err(ConfigError::InvalidValue(
                "status_update_period_secs must be positive".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "max_workers must be positive".into(),
            ));
        }
        if self.status_context.is_empty() {
            return Err(ConfigError::InvalidValue(
                "status_context cannot be empty".into(),
            ));
        }

        for (i, query) in self.queries.iter().enumerate() {
            query
                .validate()
                .map_err(|e| ConfigError::InvalidValue(format!("queries[{i}]: {e}")))?;
        }

        let override_labels = [
            &self.squash_override_label,
            &self.rebase_override_label,
            &self.merge_override_label,
        ];
        let distinct: BTreeSet<_> = override_labels.iter().collect();
        if distinct.len() != override_labels.len() {
            return Err(ConfigError::InvalidValue(
                "merge-method override labels must be distinct".into(),
            ));
        }

        self.validate_merge_method()?;
        self.validate_status_urls()?;
        self.context_options.validate()?;

        for (slug, jobs) in &self.presubmits {
            validate_slug(slug)
                .map_err(|e| ConfigError::InvalidValue(format!("presubmits key {slug:?}: {e}")))?;
            let mut seen = BTreeSet::new();
            for job in jobs {
                if job.name.is_empty() {
                    return Err(ConfigError::InvalidValue(format!(
                        "presubmit in {slug} has an empty name"
                    )));
                }
                if !seen.insert(job.context().to_string()) {
                    return Err(ConfigError::InvalidValue(format!(
                        "duplicate presubmit context {:?} in {slug}",
                        job.context()
                    )));
                }
                for pattern in [&job.run_if_changed, &job.skip_if_only_changed]
                    .into_iter()
                    .flatten()
                {
                    Regex::new(pattern).map_err(|e| {
                        ConfigError::InvalidValue(format!(
                            "presubmit {} in {slug}: bad pattern {pattern:?}: {e}",
                            job.name
                        ))
                    })?;
                }
            }
        }

        Ok(())
    }

    fn validate_merge_method(&self) -> Result<(), ConfigError> {
        for (key, entry) in &self.merge_method {
            match key.split('@').collect::<Vec<_>>()[..] {
                [slug, branch] => {
                    validate_slug(slug).map_err(|e| {
                        ConfigError::InvalidValue(format!("merge_method key {key:?}: {e}"))
                    })?;
                    BranchName::new(branch).map_err(|e| {
                        ConfigError::InvalidValue(format!("merge_method key {key:?}: {e}"))
                    })?;
                }
                [org_or_slug] => {
                    if org_or_slug.contains('/') {
                        validate_slug(org_or_slug).map_err(|e| {
                            ConfigError::InvalidValue(format!("merge_method key {key:?}: {e}"))
                        })?;
                    } else if org_or_slug.is_empty() {
                        return Err(ConfigError::InvalidValue(
                            "merge_method key cannot be empty".into(),
                        ));
                    }
                }
                _ => {
                    return Err(ConfigError::InvalidValue(format!(
                        "merge_method key {key:?} has more than one '@'"
                    )));
                }
            }

            if let MergeMethodEntry::Org(org) = entry {
                for (repo, rc) in &org.repos {
                    for pattern in rc.branches.keys() {
                        Regex::new(pattern).map_err(|e| {
                            ConfigError::InvalidValue(format!(
                                "merge_method[{key}].repos[{repo}]: bad branch pattern {pattern:?}: {e}"
                            ))
                        })?;
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_status_urls(&self) -> Result<(), ConfigError> {
        for key in self.target_urls.keys() {
            if self.pr_status_base_urls.contains_key(key) {
                return Err(ConfigError::InvalidValue(format!(
                    "key {key:?} appears in both target_urls and pr_status_base_urls"
                )));
            }
        }
        Ok(())
    }
}

/// One declarative membership query.
///
/// A PR is a candidate iff every predicate of at least one query holds.
/// Each `labels` entry may be a comma-separated OR group: `"a,b"` means
/// "label `a` or label `b`".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryConfig {
    /// Orgs whose repos are all included.
    pub orgs: Vec<String>,

    /// Individually included repos, as `"org/repo"`.
    pub repos: Vec<String>,

    /// Repos excluded from an included org, as `"org/repo"`.
    pub excluded_repos: Vec<String>,

    /// Required author login.
    pub author: Option<String>,

    /// Required labels; each entry may be an OR group (`"a,b"`).
    pub labels: Vec<String>,

    /// Labels that must be absent.
    pub missing_labels: Vec<String>,

    /// Required milestone title.
    pub milestone: Option<String>,

    /// Base branches the query applies to. Empty means all branches.
    pub included_branches: Vec<BranchName>,

    /// Base branches the query never applies to.
    pub excluded_branches: Vec<BranchName>,

    /// Require the forge review decision to be approved.
    pub review_approved_required: bool,
}

impl QueryConfig {
    /// Validate this query.
    ///
    /// # Errors
    ///
    /// Rejects: empty org entries or orgs containing `/`; repos not of the
    /// form `"org/repo"`; excluded repos whose org is not included; a label
    /// listed as both required and forbidden; simultaneous included and
    /// excluded branches; duplicates within any list; and a query that
    /// targets neither an org nor a repo.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orgs.is_empty() && self.repos.is_empty() {
            return Err(ConfigError::InvalidValue(
                "query must target at least one org or repo".into(),
            ));
        }

        for org in &self.orgs {
            if org.is_empty() {
                return Err(ConfigError::InvalidValue("org cannot be empty".into()));
            }
            if org.contains('/') {
                return Err(ConfigError::InvalidValue(format!(
                    "org {org:?} cannot contain '/'"
                )));
            }
        }
        for repo in self.repos.iter().chain(&self.excluded_repos) {
            validate_slug(repo)?;
        }
        for excluded in &self.excluded_repos {
            let org = excluded.split('/').next().unwrap_or("");
            if !self.orgs.iter().any(|o| o == org) {
                return Err(ConfigError::InvalidValue(format!(
                    "excluded repo {excluded:?} is not under an included org"
                )));
            }
        }

        // A label may not be simultaneously required and forbidden. OR
        // groups are checked member-wise.
        for group in &self.labels {
            for label in group.split(',') {
                if self.missing_labels.iter().any(|m| m == label) {
                    return Err(ConfigError::InvalidValue(format!(
                        "label {label:?} is both required and forbidden"
                    )));
                }
            }
        }

        if !self.included_branches.is_empty() && !self.excluded_branches.is_empty() {
            return Err(ConfigError::InvalidValue(
                "cannot both include and exclude branches".into(),
            ));
        }

        check_duplicates("orgs", &self.orgs)?;
        check_duplicates("repos", &self.repos)?;
        check_duplicates("excluded_repos", &self.excluded_repos)?;
        check_duplicates("labels", &self.labels)?;
        check_duplicates("missing_labels", &self.missing_labels)?;
        check_duplicates(
            "included_branches",
            &self
                .included_branches
                .iter()
                .map(|b| b.as_str().to_string())
                .collect::<Vec<_>>(),
        )?;
        check_duplicates(
            "excluded_branches",
            &self
                .excluded_branches
                .iter()
                .map(|b| b.as_str().to_string())
                .collect::<Vec<_>>(),
        )?;

        Ok(())
    }

    /// Whether this query applies to PRs targeting `branch`.
    pub fn applies_to_branch(&self, branch: &BranchName) -> bool {
        if self.excluded_branches.contains(branch) {
            return false;
        }
        self.included_branches.is_empty() || self.included_branches.contains(branch)
    }
}

/// One ordered priority entry: a PR matches iff it carries every label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorityEntry {
    /// Labels that must all be present.
    pub labels: BTreeSet<String>,
}

/// A `merge_method` table entry: either a bare method or an org table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MergeMethodEntry {
    /// `"org/repo" = "squash"` style entries.
    Method(MergeMethod),
    /// `[merge_method.org]` style entries with nested repo tables.
    Org(OrgMergeMethod),
}

/// Org-level merge method configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgMergeMethod {
    /// Method for every repo of the org without a more specific rule.
    pub merge_type: Option<MergeMethod>,
    /// Per-repo rules; the key `"*"` applies to all repos.
    pub repos: BTreeMap<String, RepoMergeMethod>,
}

/// Repo-level merge method configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoMergeMethod {
    /// Method for every branch without a matching pattern.
    pub merge_type: Option<MergeMethod>,
    /// Branch-pattern rules; patterns are anchored regexes evaluated in
    /// lexicographic key order, first match wins.
    pub branches: BTreeMap<String, MergeMethod>,
}

/// One level of required-context policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextPolicy {
    /// Merge branch-protection required contexts into the required set.
    pub from_branch_protection: Option<bool>,
    /// Contexts that are always required.
    pub required_contexts: Vec<String>,
    /// Contexts required only if they appear on the head.
    pub required_if_present_contexts: Vec<String>,
    /// Contexts that never gate a merge.
    pub optional_contexts: Vec<String>,
}

impl ContextPolicy {
    /// Overlay `other` on top of `self`, field by field.
    ///
    /// Context lists are unioned; the branch-protection flag from the more
    /// specific level wins when set.
    pub fn merged_with(&self, other: &ContextPolicy) -> ContextPolicy {
        fn union(a: &[String], b: &[String]) -> Vec<String> {
            let mut set: BTreeSet<String> = a.iter().cloned().collect();
            set.extend(b.iter().cloned());
            set.into_iter().collect()
        }
        ContextPolicy {
            from_branch_protection: other.from_branch_protection.or(self.from_branch_protection),
            required_contexts: union(&self.required_contexts, &other.required_contexts),
            required_if_present_contexts: union(
                &self.required_if_present_contexts,
                &other.required_if_present_contexts,
            ),
            optional_contexts: union(&self.optional_contexts, &other.optional_contexts),
        }
    }

    /// A context listed in more than one set is a configuration error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for context in self
            .required_contexts
            .iter()
            .chain(&self.required_if_present_contexts)
            .chain(&self.optional_contexts)
        {
            if !seen.insert(context.as_str()) {
                return Err(ConfigError::InvalidValue(format!(
                    "context {context:?} appears in more than one context set"
                )));
            }
        }
        Ok(())
    }
}

/// Required-context policy overrides, layered org -> repo -> branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextPolicyOptions {
    /// Global defaults.
    #[serde(flatten)]
    pub policy: ContextPolicy,
    /// Per-org overrides.
    pub orgs: BTreeMap<String, OrgContextPolicy>,
}

/// Org-level context policy with per-repo overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgContextPolicy {
    /// Org defaults.
    #[serde(flatten)]
    pub policy: ContextPolicy,
    /// Per-repo overrides.
    pub repos: BTreeMap<String, RepoContextPolicy>,
}

/// Repo-level context policy with per-branch overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoContextPolicy {
    /// Repo defaults.
    #[serde(flatten)]
    pub policy: ContextPolicy,
    /// Per-branch overrides.
    pub branches: BTreeMap<String, ContextPolicy>,
}

impl ContextPolicyOptions {
    /// Resolve the static policy for `(org, repo, branch)` by folding the
    /// override levels most-general first.
    pub fn resolve(&self, org: &str, repo: &str, branch: &str) -> ContextPolicy {
        let mut policy = self.policy.clone();
        if let Some(o) = self.orgs.get(org) {
            policy = policy.merged_with(&o.policy);
            if let Some(r) = o.repos.get(repo) {
                policy = policy.merged_with(&r.policy);
                if let Some(b) = r.branches.get(branch) {
                    policy = policy.merged_with(b);
                }
            }
        }
        policy
    }

    /// Validate every level of the override tree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()?;
        for (org, o) in &self.orgs {
            o.policy
                .validate()
                .map_err(|e| ConfigError::InvalidValue(format!("context_options.orgs.{org}: {e}")))?;
            for (repo, r) in &o.repos {
                r.policy.validate().map_err(|e| {
                    ConfigError::InvalidValue(format!("context_options {org}/{repo}: {e}"))
                })?;
                for (branch, b) in &r.branches {
                    b.validate().map_err(|e| {
                        ConfigError::InvalidValue(format!(
                            "context_options {org}/{repo}@{branch}: {e}"
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// One presubmit job definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Presubmit {
    /// Job name.
    pub name: String,

    /// Status context the job reports under. Defaults to the job name.
    pub context: Option<String>,

    /// The job runs on every PR of the repo.
    pub always_run: bool,

    /// The job never gates a merge.
    pub optional: bool,

    /// The job does not report a status context.
    pub skip_report: bool,

    /// Run only when a changed file matches this pattern.
    pub run_if_changed: Option<String>,

    /// Skip when every changed file matches this pattern.
    pub skip_if_only_changed: Option<String>,

    /// Branches the job runs against. Empty means all branches.
    pub branches: Vec<String>,

    /// Branches the job never runs against.
    pub skip_branches: Vec<String>,

    /// Global cap on concurrently pending copies of this job.
    pub max_concurrency: Option<u32>,

    /// Jobs sharing a queue name share a `max_concurrency` budget.
    pub job_queue_name: Option<String>,
}

impl Presubmit {
    /// The status context this job reports under.
    pub fn context(&self) -> &str {
        self.context.as_deref().unwrap_or(&self.name)
    }

    /// Whether the job has a change-based trigger condition.
    pub fn is_conditional(&self) -> bool {
        self.run_if_changed.is_some() || self.skip_if_only_changed.is_some()
    }

    /// Whether the job applies to PRs targeting `branch`.
    pub fn runs_against(&self, branch: &str) -> bool {
        if self.skip_branches.iter().any(|b| b == branch) {
            return false;
        }
        self.branches.is_empty() || self.branches.iter().any(|b| b == branch)
    }

    /// The concurrency accounting key: the queue name when set, else the
    /// job name.
    pub fn queue_key(&self) -> &str {
        self.job_queue_name.as_deref().unwrap_or(&self.name)
    }
}

/// Validate an `"org/repo"` slug.
pub(crate) fn validate_slug(slug: &str) -> Result<(), ConfigError> {
    let mut parts = slug.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(org), Some(repo), None) if !org.is_empty() && !repo.is_empty() => Ok(()),
        _ => Err(ConfigError::InvalidValue(format!(
            "{slug:?} is not of the form \"org/repo\""
        ))),
    }
}

fn check_duplicates(field: &str, values: &[String]) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for value in values {
        if !seen.insert(value.as_str()) {
            return Err(ConfigError::InvalidValue(format!(
                "duplicate entry {value:?} in {field}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(name: &str) -> BranchName {
        BranchName::new(name).unwrap()
    }

    #[test]
    fn defaults() {
        let config = TideConfig::default();
        assert_eq!(config.sync_period(), Duration::from_secs(60));
        assert_eq!(config.status_update_period(), Duration::from_secs(60));
        assert_eq!(config.max_workers, 20);
        assert_eq!(config.status_context, "tide");
        assert_eq!(config.unknown_mergeable_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn status_period_falls_back_to_sync_period() {
        let config = TideConfig {
            sync_period_secs: 30,
            ..Default::default()
        };
        assert_eq!(config.status_update_period(), Duration::from_secs(30));

        let config = TideConfig {
            sync_period_secs: 30,
            status_update_period_secs: Some(120),
            ..Default::default()
        };
        assert_eq!(config.status_update_period(), Duration::from_secs(120));
    }

    #[test]
    fn query_requires_target() {
        let query = QueryConfig::default();
        assert!(query.validate().is_err());
    }

    #[test]
    fn query_rejects_bad_orgs_and_repos() {
        let query = QueryConfig {
            orgs: vec!["bad/org".into()],
            ..Default::default()
        };
        assert!(query.validate().is_err());

        let query = QueryConfig {
            repos: vec!["not-a-slug".into()],
            ..Default::default()
        };
        assert!(query.validate().is_err());
    }

    #[test]
    fn query_rejects_excluded_repo_outside_included_orgs() {
        let query = QueryConfig {
            orgs: vec!["o".into()],
            excluded_repos: vec!["other/r".into()],
            ..Default::default()
        };
        assert!(query.validate().is_err());

        let query = QueryConfig {
            orgs: vec!["o".into()],
            excluded_repos: vec!["o/r".into()],
            ..Default::default()
        };
        assert!(query.validate().is_ok());
    }

    #[test]
    fn query_rejects_label_conflicts_and_duplicates() {
        let query = QueryConfig {
            orgs: vec!["o".into()],
            labels: vec!["lgtm,approved".into()],
            missing_labels: vec!["approved".into()],
            ..Default::default()
        };
        assert!(query.validate().is_err());

        let query = QueryConfig {
            orgs: vec!["o".into()],
            labels: vec!["lgtm".into(), "lgtm".into()],
            ..Default::default()
        };
        assert!(query.validate().is_err());
    }

    #[test]
    fn query_rejects_simultaneous_branch_include_exclude() {
        let query = QueryConfig {
            orgs: vec!["o".into()],
            included_branches: vec![branch("main")],
            excluded_branches: vec![branch("release")],
            ..Default::default()
        };
        assert!(query.validate().is_err());
    }

    #[test]
    fn query_branch_applicability() {
        let all = QueryConfig {
            orgs: vec!["o".into()],
            ..Default::default()
        };
        assert!(all.applies_to_branch(&branch("main")));

        let included = QueryConfig {
            orgs: vec!["o".into()],
            included_branches: vec![branch("main")],
            ..Default::default()
        };
        assert!(included.applies_to_branch(&branch("main")));
        assert!(!included.applies_to_branch(&branch("release")));

        let excluded = QueryConfig {
            orgs: vec!["o".into()],
            excluded_branches: vec![branch("release")],
            ..Default::default()
        };
        assert!(excluded.applies_to_branch(&branch("main")));
        assert!(!excluded.applies_to_branch(&branch("release")));
    }

    #[test]
    fn batch_size_limit_most_specific_wins() {
        let config = TideConfig {
            batch_size_limit: [("*".to_string(), 2), ("o".to_string(), 3)].into(),
            ..Default::default()
        };
        assert_eq!(config.batch_size_limit_for("o", "r"), 3);
        assert_eq!(config.batch_size_limit_for("other", "r"), 2);

        let config = TideConfig {
            batch_size_limit: [("o".to_string(), 3), ("o/r".to_string(), 7)].into(),
            ..Default::default()
        };
        assert_eq!(config.batch_size_limit_for("o", "r"), 7);
        assert_eq!(config.batch_size_limit_for("o", "other"), 3);
        assert_eq!(
            config.batch_size_limit_for("unrelated", "r"),
            DEFAULT_BATCH_SIZE_LIMIT
        );
    }

    #[test]
    fn merge_method_entry_parses_both_shapes() {
        let toml = r#"
            [merge_method]
            "o/r" = "squash"
            "o/r@release" = "rebase"

            [merge_method.k8s]
            merge_type = "merge"

            [merge_method.k8s.repos.test-infra]
            merge_type = "squash"

            [merge_method.k8s.repos.test-infra.branches]
            "release-.*" = "merge"
        "#;
        let config: TideConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.merge_method.get("o/r"),
            Some(MergeMethodEntry::Method(MergeMethod::Squash))
        ));
        assert!(matches!(
            config.merge_method.get("k8s"),
            Some(MergeMethodEntry::Org(_))
        ));
    }

    #[test]
    fn merge_method_rejects_bad_keys_and_patterns() {
        let config = TideConfig {
            merge_method: [(
                "o/r@a@b".to_string(),
                MergeMethodEntry::Method(MergeMethod::Merge),
            )]
            .into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TideConfig {
            merge_method: [(
                "o".to_string(),
                MergeMethodEntry::Org(OrgMergeMethod {
                    merge_type: None,
                    repos: [(
                        "r".to_string(),
                        RepoMergeMethod {
                            merge_type: None,
                            branches: [("[".to_string(), MergeMethod::Merge)].into(),
                        },
                    )]
                    .into(),
                }),
            )]
            .into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn status_url_maps_are_mutually_exclusive_per_key() {
        let config = TideConfig {
            target_urls: [("*".to_string(), "https://tide.example.com".to_string())].into(),
            pr_status_base_urls: [("*".to_string(), "https://pr.example.com".to_string())].into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TideConfig {
            target_urls: [("o/r".to_string(), "https://tide.example.com".to_string())].into(),
            pr_status_base_urls: [("*".to_string(), "https://pr.example.com".to_string())].into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn context_policy_resolution_layers() {
        let toml = r#"
            [context_options]
            required_contexts = ["global"]

            [context_options.orgs.o]
            required_contexts = ["org-wide"]

            [context_options.orgs.o.repos.r]
            optional_contexts = ["flaky"]

            [context_options.orgs.o.repos.r.branches.main]
            required_contexts = ["main-only"]
            from_branch_protection = true
        "#;
        let config: TideConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());

        let policy = config.context_options.resolve("o", "r", "main");
        assert_eq!(
            policy.required_contexts,
            vec!["global", "main-only", "org-wide"]
        );
        assert_eq!(policy.optional_contexts, vec!["flaky"]);
        assert_eq!(policy.from_branch_protection, Some(true));

        let other = config.context_options.resolve("o", "other", "main");
        assert_eq!(other.required_contexts, vec!["global", "org-wide"]);
        assert!(other.optional_contexts.is_empty());
    }

    #[test]
    fn context_policy_rejects_duplicates_across_sets() {
        let policy = ContextPolicy {
            required_contexts: vec!["e2e".into()],
            optional_contexts: vec!["e2e".into()],
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn presubmit_accessors() {
        let job = Presubmit {
            name: "unit".into(),
            ..Default::default()
        };
        assert_eq!(job.context(), "unit");
        assert_eq!(job.queue_key(), "unit");
        assert!(!job.is_conditional());
        assert!(job.runs_against("main"));

        let job = Presubmit {
            name: "e2e".into(),
            context: Some("ci/e2e".into()),
            run_if_changed: Some(r"^pkg/".into()),
            branches: vec!["main".into()],
            job_queue_name: Some("heavy".into()),
            ..Default::default()
        };
        assert_eq!(job.context(), "ci/e2e");
        assert_eq!(job.queue_key(), "heavy");
        assert!(job.is_conditional());
        assert!(job.runs_against("main"));
        assert!(!job.runs_against("release"));
    }

    #[test]
    fn presubmit_duplicate_context_rejected() {
        let config = TideConfig {
            presubmits: [(
                "o/r".to_string(),
                vec![
                    Presubmit {
                        name: "a".into(),
                        context: Some("ci".into()),
                        ..Default::default()
                    },
                    Presubmit {
                        name: "b".into(),
                        context: Some("ci".into()),
                        ..Default::default()
                    },
                ],
            )]
            .into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn full_example_parses() {
        let toml = r#"
            sync_period_secs = 60
            max_workers = 20
            status_context = "tide"
            blocker_label = "merge-blocker"
            org_scoped_auth = false
            display_all_tide_queries_in_status = true

            [[queries]]
            orgs = ["o"]
            labels = ["lgtm", "approved"]
            missing_labels = ["do-not-merge/hold"]

            [[queries]]
            repos = ["other/repo"]
            author = "release-bot"
            included_branches = ["release-1.2"]

            [[priority]]
            labels = ["urgent"]

            [[priority]]
            labels = ["kind/bug"]

            [batch_size_limit]
            "*" = 5
            "o" = 3

            [target_urls]
            "*" = "https://deck.example.com/tide"

            [presubmits]
            "o/r" = [
                { name = "unit", always_run = true },
                { name = "e2e", run_if_changed = "^test/" },
            ]
        "#;
        let config: TideConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.queries.len(), 2);
        assert_eq!(config.priority.len(), 2);
        assert_eq!(config.presubmits_for("o", "r").len(), 2);
        assert!(config.presubmits_for("o", "missing").is_empty());
    }
}
