//! engine::query
//!
//! Query planner: declarative membership queries to forge search strings.
//!
//! # Design
//!
//! Planning is pure and infallible; every input that could make it fail
//! is rejected when the configuration is validated. The plan maps a
//! *shard* (an org bucket, or the global bucket `"*"` when auth is not
//! org-scoped) to a set of search strings. Shards fail independently at
//! fetch time: losing one org's searches never poisons another's.
//!
//! Identical search strings produced by different queries collapse into
//! one, which is why shards hold sets.
//!
//! # Example
//!
//! ```
//! use tideway::core::config::{QueryConfig, TideConfig};
//! use tideway::engine::query::plan_pr_searches;
//!
//! let config = TideConfig {
//!     queries: vec![QueryConfig {
//!         orgs: vec!["o".into()],
//!         labels: vec!["lgtm".into()],
//!         ..Default::default()
//!     }],
//!     ..Default::default()
//! };
//! let plan = plan_pr_searches(&config);
//! let shard = plan.get("*").unwrap();
//! assert!(shard.iter().next().unwrap().contains("label:\"lgtm\""));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::core::config::{QueryConfig, TideConfig};

/// The shard key used when searches are not org-scoped.
///
/// `"*"` cannot collide with a real org; validation rejects empty org
/// names and orgs never contain `*` on the forge.
pub const GLOBAL_SHARD: &str = "*";

/// A search plan: shard key to the search strings to run there.
pub type SearchPlan = BTreeMap<String, BTreeSet<String>>;

/// Plan the PR discovery searches for every configured query.
pub fn plan_pr_searches(config: &TideConfig) -> SearchPlan {
    let mut plan = SearchPlan::new();

    for query in &config.queries {
        if config.org_scoped_auth {
            for (org, scope) in org_buckets(query) {
                plan.entry(org)
                    .or_default()
                    .insert(search_string(query, &scope));
            }
        } else {
            let scope = Scope {
                orgs: query.orgs.clone(),
                repos: query.repos.clone(),
                excluded_repos: query.excluded_repos.clone(),
            };
            plan.entry(GLOBAL_SHARD.to_string())
                .or_default()
                .insert(search_string(query, &scope));
        }
    }

    plan
}

/// Plan the merge-blocker issue searches.
///
/// One search per query scope, sharded exactly like PR discovery, so an
/// org-scoped token never sees another org's issues.
pub fn plan_blocker_searches(config: &TideConfig, blocker_label: &str) -> SearchPlan {
    let mut plan = SearchPlan::new();

    for query in &config.queries {
        if config.org_scoped_auth {
            for (org, scope) in org_buckets(query) {
                plan.entry(org)
                    .or_default()
                    .insert(blocker_string(blocker_label, &scope));
            }
        } else {
            let scope = Scope {
                orgs: query.orgs.clone(),
                repos: query.repos.clone(),
                excluded_repos: query.excluded_repos.clone(),
            };
            plan.entry(GLOBAL_SHARD.to_string())
                .or_default()
                .insert(blocker_string(blocker_label, &scope));
        }
    }

    plan
}

/// Org/repo selectors of one search.
#[derive(Debug, Clone, Default)]
struct Scope {
    orgs: Vec<String>,
    repos: Vec<String>,
    excluded_repos: Vec<String>,
}

/// Split one query's selectors into per-org buckets.
///
/// A repo selector routes to its owning org's bucket; an excluded repo
/// routes to its org's bucket (validation guarantees that org is
/// included).
fn org_buckets(query: &QueryConfig) -> BTreeMap<String, Scope> {
    let mut buckets: BTreeMap<String, Scope> = BTreeMap::new();

    for org in &query.orgs {
        buckets.entry(org.clone()).or_default().orgs.push(org.clone());
    }
    for repo in &query.repos {
        let org = repo.split('/').next().unwrap_or_default().to_string();
        buckets.entry(org).or_default().repos.push(repo.clone());
    }
    for excluded in &query.excluded_repos {
        let org = excluded.split('/').next().unwrap_or_default().to_string();
        if let Some(scope) = buckets.get_mut(&org) {
            scope.excluded_repos.push(excluded.clone());
        }
    }

    buckets
}

/// Render one query as a forge search string.
fn search_string(query: &QueryConfig, scope: &Scope) -> String {
    let mut tokens = vec![
        "is:pr".to_string(),
        "state:open".to_string(),
        "archived:false".to_string(),
    ];

    if let Some(author) = &query.author {
        tokens.push(format!("author:\"{author}\""));
    }
    if let Some(milestone) = &query.milestone {
        tokens.push(format!("milestone:\"{milestone}\""));
    }
    if query.review_approved_required {
        tokens.push("review:approved".to_string());
    }
    for branch in &query.included_branches {
        tokens.push(format!("base:\"{branch}\""));
    }
    for branch in &query.excluded_branches {
        tokens.push(format!("-base:\"{branch}\""));
    }
    for group in &query.labels {
        let alternatives: Vec<String> = group.split(',').map(|l| format!("\"{l}\"")).collect();
        tokens.push(format!("label:{}", alternatives.join(",")));
    }
    for label in &query.missing_labels {
        tokens.push(format!("-label:\"{label}\""));
    }

    tokens.extend(scope_tokens(scope));
    tokens.join(" ")
}

/// Render one blocker search string.
fn blocker_string(blocker_label: &str, scope: &Scope) -> String {
    let mut tokens = vec![
        "is:issue".to_string(),
        "state:open".to_string(),
        format!("label:\"{blocker_label}\""),
    ];
    tokens.extend(scope_tokens(scope));
    tokens.join(" ")
}

fn scope_tokens(scope: &Scope) -> Vec<String> {
    let mut tokens = Vec::new();
    for org in &scope.orgs {
        tokens.push(format!("org:\"{org}\""));
    }
    for repo in &scope.repos {
        tokens.push(format!("repo:\"{repo}\""));
    }
    for excluded in &scope.excluded_repos {
        tokens.push(format!("-repo:\"{excluded}\""));
    }
    tokens
}

/// Split a search string back into its tokens, respecting quoting.
///
/// The inverse of planning, used to check that generated strings carry
/// exactly the intended token multiset.
pub fn parse_tokens(search: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in search.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
