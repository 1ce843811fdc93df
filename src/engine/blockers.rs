//! engine::blockers
//!
//! Merge-blocker tracker.
//!
//! # Design
//!
//! An open issue carrying the configured blocker label freezes merges in
//! its repository. Branch directives in the issue title
//! (`branch:"release-1.2"` or `branch:main`) narrow the freeze to those
//! branches; a title with no directives blocks every branch of the repo.
//!
//! The tracker refetches from scratch each tick; a closed blocker simply
//! stops appearing. Shard failures drop only that shard's blockers for
//! the tick, which fails open: an unreachable org merges as if it had no
//! blockers, matching the discovery path that will not see its PRs
//! either.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use super::query::plan_blocker_searches;
use crate::core::config::TideConfig;
use crate::forge::ForgeClient;

/// One merge blocker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocker {
    /// Issue number.
    pub number: u64,
    /// Issue title, verbatim.
    pub title: String,
    /// Branches the blocker applies to. Empty means all branches.
    pub branches: BTreeSet<String>,
}

/// All blockers seen this tick, grouped by `(org, repo)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockerSet {
    by_repo: BTreeMap<(String, String), Vec<Blocker>>,
}

impl BlockerSet {
    /// Blockers that apply to `(org, repo, branch)`.
    ///
    /// A blocker applies when its branch set is empty or contains the
    /// branch. Returned in ascending issue-number order.
    pub fn applicable(&self, org: &str, repo: &str, branch: &str) -> Vec<&Blocker> {
        let mut blockers: Vec<&Blocker> = self
            .by_repo
            .get(&(org.to_string(), repo.to_string()))
            .map(|list| {
                list.iter()
                    .filter(|b| b.branches.is_empty() || b.branches.contains(branch))
                    .collect()
            })
            .unwrap_or_default();
        blockers.sort_by_key(|b| b.number);
        blockers
    }

    /// Whether any blocker exists anywhere.
    pub fn is_empty(&self) -> bool {
        self.by_repo.is_empty()
    }

    fn insert(&mut self, org: String, repo: String, blocker: Blocker) {
        let list = self.by_repo.entry((org, repo)).or_default();
        if !list.iter().any(|b| b.number == blocker.number) {
            list.push(blocker);
        }
    }
}

/// Fetch this tick's blockers.
///
/// Returns an empty set when no blocker label is configured. Shard
/// failures are logged and skipped.
pub async fn fetch_blockers(forge: &dyn ForgeClient, config: &TideConfig) -> BlockerSet {
    let mut set = BlockerSet::default();
    let Some(label) = &config.blocker_label else {
        return set;
    };

    for (shard, searches) in plan_blocker_searches(config, label) {
        for search in searches {
            match forge.search_issues(&search).await {
                Ok(issues) => {
                    for issue in issues {
                        let branches = parse_branches(&issue.title);
                        set.insert(
                            issue.org,
                            issue.repo,
                            Blocker {
                                number: issue.number,
                                title: issue.title,
                                branches,
                            },
                        );
                    }
                }
                Err(e) => {
                    warn!(shard = %shard, error = %e, "blocker search failed, skipping shard");
                }
            }
        }
    }

    set
}

fn branch_directive_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?:^|\s)branch:(?:"([^"]+)"|([^\s"]+))"#).expect("static pattern compiles")
    })
}

/// Extract branch directives from a blocker title, case preserved.
pub fn parse_branches(title: &str) -> BTreeSet<String> {
    branch_directive_pattern()
        .captures_iter(title)
        .filter_map(|caps| {
            caps.get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str().to_string())
        })
        .collect()
}

/// Render branch directives in the form `parse_branches` reads back.
///
/// The inverse of parsing, used to check the directive syntax round-trips.
pub fn format_branches(branches: &BTreeSet<String>) -> String {
    branches
        .iter()
        .map(|b| format!("branch:\"{b}\""))
        .collect::<Vec<_>>()
        .join(" ")
}
