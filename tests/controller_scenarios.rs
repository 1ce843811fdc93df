//! End-to-end controller scenarios against the mock forge.
//!
//! Each test drives a full sync tick plus a status pass and asserts on
//! the externally observable effects: merges, submitted jobs, and the
//! published status tuples.

use std::sync::Arc;

use tideway::core::config::{
    MergeMethodEntry, Presubmit, QueryConfig, StaticConfigSource, TideConfig,
};
use tideway::core::types::{
    BranchName, ContextMap, ContextState, MergeableState, PrKey, PullRequest, Sha,
};
use tideway::engine::merge::resolve_method;
use tideway::engine::{Controller, SystemClock};
use tideway::forge::mock::MockForge;
use tideway::forge::{Issue, MergeMethod};
use tideway::jobs::memory::InMemorySubstrate;
use tideway::jobs::JobSubstrate;

fn sha(c: char) -> Sha {
    Sha::new(c.to_string().repeat(40)).unwrap()
}

fn pull_request(number: u64, branch: &str, labels: &[&str]) -> PullRequest {
    PullRequest {
        key: PrKey::new("o", "r", number),
        title: format!("PR {number}"),
        author: "dev".into(),
        head_sha: Sha::new(format!("{number:040x}")).unwrap(),
        head_ref: format!("feature-{number}"),
        base_branch: BranchName::new(branch).unwrap(),
        base_sha: Some(sha('b')),
        labels: labels.iter().map(|l| l.to_string()).collect(),
        milestone: None,
        draft: false,
        mergeable: MergeableState::Clean,
        review_decision: None,
        contexts: ContextMap::new(),
    }
}

fn two_label_config() -> TideConfig {
    TideConfig {
        queries: vec![QueryConfig {
            orgs: vec!["o".into()],
            labels: vec!["L1".into(), "L2".into()],
            ..Default::default()
        }],
        presubmits: [(
            "o/r".to_string(),
            vec![Presubmit {
                name: "e2e".into(),
                always_run: true,
                ..Default::default()
            }],
        )]
        .into(),
        ..Default::default()
    }
}

fn controller(forge: &MockForge, substrate: &InMemorySubstrate, config: TideConfig) -> Controller {
    Controller::new(
        Arc::new(forge.clone()),
        Arc::new(substrate.clone()),
        Arc::new(StaticConfigSource::new(config)),
        Arc::new(SystemClock),
    )
}

fn set_green_e2e(forge: &MockForge, pr: &PullRequest) {
    forge.set_contexts(
        "o",
        "r",
        &pr.head_sha,
        [("e2e".to_string(), ContextState::Success)].into(),
    );
}

/// S1: a PR matching the query with all required contexts green is
/// merged, and its status reads "In merge pool.".
#[tokio::test]
async fn in_pool_all_green() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let pr = pull_request(42, "main", &["L1", "L2"]);
    set_green_e2e(&forge, &pr);
    forge.add_pull_request(pr.clone());

    let controller = controller(&forge, &substrate, two_label_config());
    let report = controller.tick().await;
    assert_eq!(report.merged, 1);

    controller.status_pass().await;
    let published = forge.statuses_for(&pr.head_sha);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].state, ContextState::Success);
    assert_eq!(published[0].description, "In merge pool.");
    assert_eq!(published[0].context, "tide");
}

/// S2: a PR missing one required label is pending with the label named.
#[tokio::test]
async fn missing_label() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let pr = pull_request(42, "main", &["L1"]);
    set_green_e2e(&forge, &pr);
    forge.add_pull_request(pr.clone());

    let controller = controller(&forge, &substrate, two_label_config());
    let report = controller.tick().await;
    assert_eq!(report.merged, 0);

    controller.status_pass().await;
    let published = forge.statuses_for(&pr.head_sha);
    assert_eq!(published[0].state, ContextState::Pending);
    assert_eq!(published[0].description, "Not mergeable. Needs L2 label.");
}

/// S3: conflicting merge-method override labels are an error status and
/// the PR is never merged.
#[tokio::test]
async fn conflicting_merge_method_labels() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let pr = pull_request(
        42,
        "main",
        &["L1", "L2", "tide/merge-method-merge", "tide/merge-method-squash"],
    );
    set_green_e2e(&forge, &pr);
    forge.add_pull_request(pr.clone());

    let controller = controller(&forge, &substrate, two_label_config());
    let report = controller.tick().await;
    assert_eq!(report.merged, 0);
    assert!(forge.merged().is_empty());

    controller.status_pass().await;
    let published = forge.statuses_for(&pr.head_sha);
    assert_eq!(published[0].state, ContextState::Error);
    assert_eq!(
        published[0].description,
        "Not mergeable. PR has conflicting merge method override labels"
    );
}

/// S4: an open blocker issue with a branch directive freezes the branch's
/// pool and the status names the issue.
#[tokio::test]
async fn blocked_branch() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let pr = pull_request(7, "main", &["L1", "L2"]);
    set_green_e2e(&forge, &pr);
    forge.add_pull_request(pr.clone());
    forge.add_issue(Issue {
        number: 9,
        title: "BLOCK branch:main".into(),
        org: "o".into(),
        repo: "r".into(),
    });

    let mut config = two_label_config();
    config.blocker_label = Some("merge-blocker".into());
    let controller = controller(&forge, &substrate, config);
    let report = controller.tick().await;
    assert_eq!(report.merged, 0);
    assert!(forge.merged().is_empty());

    controller.status_pass().await;
    let published = forge.statuses_for(&pr.head_sha);
    assert_eq!(published[0].state, ContextState::Error);
    assert_eq!(
        published[0].description,
        "Not mergeable. Merging is blocked by issues 9."
    );
}

/// S5: with required contexts `{foo, bar}` and only `foo` green, the
/// status lists the missing context by name.
#[tokio::test]
async fn two_required_contexts_one_pending() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let mut config = two_label_config();
    config.presubmits = [(
        "o/r".to_string(),
        vec![
            Presubmit {
                name: "foo".into(),
                always_run: true,
                ..Default::default()
            },
            Presubmit {
                name: "bar".into(),
                always_run: true,
                ..Default::default()
            },
        ],
    )]
    .into();

    let pr = pull_request(42, "main", &["L1", "L2"]);
    forge.set_contexts(
        "o",
        "r",
        &pr.head_sha,
        [("foo".to_string(), ContextState::Success)].into(),
    );
    forge.add_pull_request(pr.clone());

    let controller = controller(&forge, &substrate, config);
    controller.tick().await;
    controller.status_pass().await;

    let published = forge.statuses_for(&pr.head_sha);
    assert_eq!(published[0].state, ContextState::Pending);
    assert_eq!(published[0].description, "Not mergeable. Retesting: bar");
}

/// S6: the org-level batch size limit overrides the wildcard, so three
/// eligible PRs batch together.
#[tokio::test]
async fn batch_size_bound() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let mut config = two_label_config();
    config.batch_size_limit = [("*".to_string(), 2), ("o".to_string(), 3)].into();

    for n in 1..=3 {
        forge.add_pull_request(pull_request(n, "main", &["L1", "L2"]));
    }

    let controller = controller(&forge, &substrate, config);
    let report = controller.tick().await;
    // One batch of all three, running the single always-run job.
    assert_eq!(report.triggered, 1);
    let jobs = substrate.jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].refs.pulls.len(), 3);
}

/// S7: merge-method precedence; the branch-specific key outranks the
/// repo-wide key.
#[test]
fn merge_method_precedence() {
    let config = TideConfig {
        merge_method: [
            (
                "o/r@release".to_string(),
                MergeMethodEntry::Method(MergeMethod::Rebase),
            ),
            (
                "o/r".to_string(),
                MergeMethodEntry::Method(MergeMethod::Squash),
            ),
        ]
        .into(),
        ..Default::default()
    };

    assert_eq!(
        resolve_method(&config, "o", "r", "release"),
        MergeMethod::Rebase
    );
    assert_eq!(resolve_method(&config, "o", "r", "main"), MergeMethod::Squash);
}

/// A merged PR disappears from the next tick's discovery; its pool
/// settles back to waiting.
#[tokio::test]
async fn merged_pr_leaves_the_pool() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let pr = pull_request(42, "main", &["L1", "L2"]);
    set_green_e2e(&forge, &pr);
    forge.add_pull_request(pr.clone());

    let controller = controller(&forge, &substrate, two_label_config());
    assert_eq!(controller.tick().await.merged, 1);

    let report = controller.tick().await;
    assert_eq!(report.prs, 0);
    assert_eq!(report.merged, 0);
}

/// Suppression across passes: unchanged inputs publish exactly once.
#[tokio::test]
async fn status_published_once_for_unchanged_inputs() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let pr = pull_request(42, "main", &["L1"]);
    forge.add_pull_request(pr.clone());

    let controller = controller(&forge, &substrate, two_label_config());
    controller.tick().await;
    controller.status_pass().await;
    controller.status_pass().await;
    controller.tick().await;
    controller.status_pass().await;

    assert_eq!(forge.statuses_for(&pr.head_sha).len(), 1);
}

/// Batch completion: once the batch job succeeds at unchanged heads, the
/// next tick merges every batched PR.
#[tokio::test]
async fn batch_success_merges_all_members() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let pr1 = pull_request(1, "main", &["L1", "L2"]);
    let pr2 = pull_request(2, "main", &["L1", "L2"]);
    forge.add_pull_request(pr1.clone());
    forge.add_pull_request(pr2.clone());

    let controller = controller(&forge, &substrate, two_label_config());
    let report = controller.tick().await;
    assert_eq!(report.triggered, 1);

    // The batch job finishes green.
    let jobs = substrate.jobs().await.unwrap();
    substrate.set_state("e2e", &jobs[0].refs.key(), tideway::jobs::JobState::Success);

    let report = controller.tick().await;
    assert_eq!(report.merged, 2);
    let merged = forge.merged();
    assert!(merged.contains(&pr1.key));
    assert!(merged.contains(&pr2.key));
}

/// Priority labels order merges: the PR matching the earliest priority
/// entry merges first even with a higher number.
#[tokio::test]
async fn priority_orders_merges() {
    let forge = MockForge::new();
    let substrate = InMemorySubstrate::new();
    let mut config = two_label_config();
    config.priority = vec![tideway::core::config::PriorityEntry {
        labels: ["urgent".to_string()].into(),
    }];

    let ordinary = pull_request(1, "main", &["L1", "L2"]);
    let urgent = pull_request(9, "main", &["L1", "L2", "urgent"]);
    set_green_e2e(&forge, &ordinary);
    set_green_e2e(&forge, &urgent);
    forge.add_pull_request(ordinary);
    forge.add_pull_request(urgent.clone());

    let controller = controller(&forge, &substrate, config);
    controller.tick().await;
    // One PR merges per pool per tick; it must be the urgent one.
    let merged = forge.merged();
    assert_eq!(merged.len(), 1);
    assert!(merged.contains(&urgent.key));
}
