//! engine::runner
//!
//! The controller pair: the sync tick and the status cadence.
//!
//! # Architecture
//!
//! One tick runs the full pipeline:
//!
//! ```text
//! plan searches -> discover (parallel, per-shard isolation)
//!               -> hydrate roll-ups (parallel, per-PR isolation)
//!               -> fetch blockers
//!               -> resolve context policies
//!               -> build pools (pure)
//!               -> execute actions (parallel pools, serial within)
//!               -> leave a snapshot for the status controller
//! ```
//!
//! The status controller runs on its own cadence against the latest
//! snapshot. Both loops live in [`Controller::serve`]; a shutdown future
//! cancels in-flight work and discards the partial tick.
//!
//! # Failure isolation
//!
//! A failed search shard drops only its orgs for the tick. A failed
//! roll-up drops only that PR. A failed policy resolution drops only that
//! pool (configuration errors instead surface as status errors). Nothing
//! here aborts a tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use super::actions::{conflicted_set, index_prs, ActionEngine, ActionOutcome};
use super::blockers::fetch_blockers;
use super::policy::{resolve_policy, PolicyError, ResolvedPolicy};
use super::pool::{build_pools, Pool, TickInputs};
use super::query::plan_pr_searches;
use super::status::{PassStats, StatusController};
use super::Clock;
use crate::core::config::{ConfigSource, TideConfig};
use crate::core::types::{MergeableState, PoolKey, PrKey, PullRequest, Sha};
use crate::forge::ForgeClient;
use crate::jobs::JobSubstrate;

/// What one sync tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// PRs in the snapshot after discovery.
    pub prs: usize,
    /// Pools classified.
    pub pools: usize,
    /// PRs merged.
    pub merged: usize,
    /// Jobs submitted.
    pub triggered: usize,
    /// Search shards dropped for errors.
    pub failed_shards: usize,
}

/// Per-PR bookkeeping for the unknown-merge-state retry window.
#[derive(Debug, Clone)]
struct UnknownRetry {
    head: Sha,
    ticks: u32,
}

/// Per-shard backoff after search failures.
#[derive(Debug, Clone, Default)]
struct ShardBackoff {
    /// Consecutive failed attempts.
    failures: u32,
    /// Ticks left to sit out before the next attempt.
    cooldown: u32,
}

/// Longest a shard sits out between attempts, in ticks.
const MAX_SHARD_COOLDOWN: u32 = 16;

/// What a tick leaves behind for the status cadence.
struct TickSnapshot {
    config: Arc<TideConfig>,
    prs: Vec<PullRequest>,
    pools: Vec<Pool>,
    policies: BTreeMap<PoolKey, ResolvedPolicy>,
    marked_conflicting: BTreeSet<PrKey>,
}

/// The merge controller: owns both periodic loops and all process-local
/// state.
pub struct Controller {
    forge: Arc<dyn ForgeClient>,
    substrate: Arc<dyn JobSubstrate>,
    config_source: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    status: StatusController,
    snapshot: Mutex<Option<Arc<TickSnapshot>>>,
    unknown_retries: Mutex<HashMap<PrKey, UnknownRetry>>,
    shard_backoff: Mutex<HashMap<String, ShardBackoff>>,
}

impl Controller {
    /// Create a controller over the given capabilities.
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        substrate: Arc<dyn JobSubstrate>,
        config_source: Arc<dyn ConfigSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            forge,
            substrate,
            config_source,
            clock,
            status: StatusController::new(),
            snapshot: Mutex::new(None),
            unknown_retries: Mutex::new(HashMap::new()),
            shard_backoff: Mutex::new(HashMap::new()),
        }
    }

    /// Run one sync tick.
    pub async fn tick(&self) -> TickReport {
        let started = self.clock.now();
        let config = self.config_source.current();

        // 1. Discover candidates, isolating failures per shard.
        let (mut prs, failed_shards) = self.discover(&config).await;

        // 2. Hydrate head roll-ups, isolating failures per PR.
        prs = self.hydrate(&config, prs).await;

        // 3. Blockers.
        let blockers = fetch_blockers(self.forge.as_ref(), &config).await;

        // 4. Context policies per pool; forge failures drop the pool's
        // PRs from the tick, configuration errors surface via status.
        let pool_keys: BTreeSet<PoolKey> = prs
            .iter()
            .map(|pr| PoolKey::new(&pr.key.org, &pr.key.repo, pr.base_branch.clone()))
            .collect();
        let mut policies = BTreeMap::new();
        let mut policy_errors = BTreeMap::new();
        let mut dropped_pools = BTreeSet::new();
        for key in pool_keys {
            match resolve_policy(
                self.forge.as_ref(),
                &config,
                &key.org,
                &key.repo,
                key.branch.as_str(),
            )
            .await
            {
                Ok(policy) => {
                    policies.insert(key, policy);
                }
                Err(PolicyError::ConflictingContext(context)) => {
                    warn!(pool = %key, context, "conflicting context policy");
                    policy_errors.insert(
                        key,
                        format!("context {context:?} appears in more than one context set"),
                    );
                }
                Err(PolicyError::Forge(e)) => {
                    warn!(pool = %key, error = %e, "policy resolution failed, dropping pool");
                    dropped_pools.insert(key);
                }
            }
        }
        if !dropped_pools.is_empty() {
            prs.retain(|pr| {
                !dropped_pools.contains(&PoolKey::new(
                    &pr.key.org,
                    &pr.key.repo,
                    pr.base_branch.clone(),
                ))
            });
        }

        // 5. Unknown-merge-state retry window.
        let unknown_exhausted = self.advance_unknown_retries(&config, &prs);

        // 6. Classify.
        let jobs = match self.substrate.jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "job index unavailable, assuming empty");
                Vec::new()
            }
        };
        let inputs = TickInputs {
            config: &config,
            policies: &policies,
            blockers: &blockers,
            jobs: &jobs,
            unknown_exhausted: &unknown_exhausted,
            policy_errors: &policy_errors,
        };
        let pools = build_pools(&inputs, &prs);

        // 7. Act, pools in parallel, each pool serial.
        let by_key = index_prs(&prs);
        let engine = ActionEngine::new(
            self.forge.as_ref(),
            self.substrate.as_ref(),
            &config,
            &policies,
            &jobs,
        );
        let pending: Vec<_> = pools.iter().map(|pool| engine.execute(pool, &by_key)).collect();
        let outcomes: Vec<ActionOutcome> = stream::iter(pending)
            .buffer_unordered(config.max_workers)
            .collect()
            .await;

        let report = TickReport {
            prs: prs.len(),
            pools: pools.len(),
            merged: outcomes.iter().map(|o| o.merged.len()).sum(),
            triggered: outcomes.iter().map(|o| o.triggered.len()).sum(),
            failed_shards,
        };

        // 8. Snapshot for the status cadence.
        let marked_conflicting = conflicted_set(&outcomes);
        {
            let mut snapshot = self.snapshot.lock().expect("snapshot lock poisoned");
            *snapshot = Some(Arc::new(TickSnapshot {
                config: config.clone(),
                prs,
                pools,
                policies,
                marked_conflicting,
            }));
        }

        let elapsed = self.clock.now() - started;
        info!(
            prs = report.prs,
            pools = report.pools,
            merged = report.merged,
            triggered = report.triggered,
            failed_shards = report.failed_shards,
            duration_ms = elapsed.num_milliseconds(),
            "sync tick complete"
        );
        report
    }

    /// Run one status pass over the latest snapshot.
    pub async fn status_pass(&self) -> PassStats {
        let snapshot = {
            let guard = self.snapshot.lock().expect("snapshot lock poisoned");
            guard.clone()
        };
        let Some(snapshot) = snapshot else {
            return PassStats::default();
        };
        self.status
            .run_pass(
                self.forge.as_ref(),
                &snapshot.config,
                &snapshot.pools,
                &snapshot.policies,
                &snapshot.prs,
                &snapshot.marked_conflicting,
            )
            .await
    }

    /// Run both controllers until `shutdown` resolves.
    ///
    /// A tick overrunning its period finishes and the next starts
    /// immediately after; ticks never overlap. Shutdown cancels in-flight
    /// work and discards the partial tick.
    pub async fn serve<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        let config = self.config_source.current();
        let mut sync_timer = tokio::time::interval(config.sync_period());
        sync_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut status_timer = tokio::time::interval(config.status_update_period());
        status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = sync_timer.tick() => {
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("shutdown requested, discarding partial tick");
                            break;
                        }
                        _ = self.tick() => {}
                    }
                }
                _ = status_timer.tick() => {
                    tokio::select! {
                        _ = &mut shutdown => {
                            info!("shutdown requested, discarding partial status pass");
                            break;
                        }
                        _ = self.status_pass() => {}
                    }
                }
            }
        }
    }

    /// Phase 1: run every planned search, merge results, drop drafts.
    ///
    /// A shard that failed recently sits out an exponentially growing
    /// number of ticks before its searches run again.
    async fn discover(&self, config: &TideConfig) -> (Vec<PullRequest>, usize) {
        let plan = plan_pr_searches(config);

        // Split out the shards still cooling down from earlier failures.
        let mut failed = 0;
        let mut runnable = Vec::new();
        {
            let mut backoff = self.shard_backoff.lock().expect("backoff lock poisoned");
            for (shard, searches) in plan {
                match backoff.get_mut(&shard) {
                    Some(state) if state.cooldown > 0 => {
                        state.cooldown -= 1;
                        warn!(shard = %shard, remaining = state.cooldown, "shard backing off");
                        failed += 1;
                    }
                    _ => runnable.push((shard, searches)),
                }
            }
        }

        let shard_results: Vec<(String, Result<Vec<PullRequest>, ()>)> =
            stream::iter(runnable.into_iter())
                .map(|(shard, searches)| async move {
                    let mut found = Vec::new();
                    for search in searches {
                        match self.forge.search_pull_requests(&search).await {
                            Ok(prs) => found.extend(prs),
                            Err(e) => {
                                warn!(shard = %shard, error = %e, "search failed, dropping shard");
                                return (shard, Err(()));
                            }
                        }
                    }
                    (shard, Ok(found))
                })
                .buffer_unordered(config.max_workers)
                .collect()
                .await;

        let mut seen = BTreeSet::new();
        let mut prs = Vec::new();
        {
            let mut backoff = self.shard_backoff.lock().expect("backoff lock poisoned");
            for (shard, result) in shard_results {
                match result {
                    Ok(found) => {
                        backoff.remove(&shard);
                        for pr in found {
                            if pr.draft {
                                continue;
                            }
                            if seen.insert(pr.key.clone()) {
                                prs.push(pr);
                            }
                        }
                    }
                    Err(()) => {
                        failed += 1;
                        let state = backoff.entry(shard).or_default();
                        state.failures += 1;
                        state.cooldown =
                            (2u32.saturating_pow(state.failures) - 1).min(MAX_SHARD_COOLDOWN);
                    }
                }
            }
        }
        (prs, failed)
    }

    /// Phase 2: fetch head roll-ups; the controller's own context never
    /// counts toward classification.
    async fn hydrate(&self, config: &TideConfig, prs: Vec<PullRequest>) -> Vec<PullRequest> {
        let own_context = config.status_context.clone();
        let hydrated: Vec<Option<PullRequest>> = stream::iter(prs.into_iter())
            .map(|mut pr| {
                let own_context = own_context.clone();
                async move {
                    match self
                        .forge
                        .combined_status(&pr.key.org, &pr.key.repo, &pr.head_sha)
                        .await
                    {
                        Ok(mut contexts) => {
                            contexts.remove(&own_context);
                            pr.contexts = contexts;
                            Some(pr)
                        }
                        Err(e) => {
                            warn!(pr = %pr.key, error = %e, "roll-up fetch failed, dropping PR");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(config.max_workers)
            .collect()
            .await;
        hydrated.into_iter().flatten().collect()
    }

    /// Phase 5: advance the unknown-merge-state counters and return the
    /// PRs whose retry budget is spent.
    fn advance_unknown_retries(
        &self,
        config: &TideConfig,
        prs: &[PullRequest],
    ) -> BTreeSet<PrKey> {
        let mut retries = self.unknown_retries.lock().expect("retry lock poisoned");
        let mut exhausted = BTreeSet::new();
        let mut live = BTreeSet::new();

        for pr in prs {
            if pr.mergeable != MergeableState::Unknown {
                continue;
            }
            live.insert(pr.key.clone());
            let entry = retries
                .entry(pr.key.clone())
                .and_modify(|r| {
                    // A new head restarts the window.
                    if r.head != pr.head_sha {
                        r.head = pr.head_sha.clone();
                        r.ticks = 0;
                    }
                })
                .or_insert(UnknownRetry {
                    head: pr.head_sha.clone(),
                    ticks: 0,
                });
            entry.ticks += 1;
            if entry.ticks > config.unknown_mergeable_retries {
                exhausted.insert(pr.key.clone());
            }
        }

        // PRs that resolved or vanished stop being tracked.
        retries.retain(|key, _| live.contains(key));
        exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::config::{Presubmit, QueryConfig, StaticConfigSource};
    use crate::core::types::{BranchName, ContextMap, ContextState};
    use crate::engine::SystemClock;
    use crate::forge::mock::MockForge;
    use crate::forge::{ForgeError, Issue};
    use crate::jobs::memory::InMemorySubstrate;

    fn sha(c: char) -> Sha {
        Sha::new(c.to_string().repeat(40)).unwrap()
    }

    fn pr(org: &str, number: u64, labels: &[&str]) -> PullRequest {
        PullRequest {
            key: PrKey::new(org, "r", number),
            title: format!("PR {number}"),
            author: "dev".into(),
            head_sha: Sha::new(format!("{number:040x}")).unwrap(),
            head_ref: format!("feature-{number}"),
            base_branch: BranchName::new("main").unwrap(),
            base_sha: Some(sha('b')),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            milestone: None,
            draft: false,
            mergeable: MergeableState::Clean,
            review_decision: None,
            contexts: ContextMap::new(),
        }
    }

    fn config() -> TideConfig {
        TideConfig {
            queries: vec![QueryConfig {
                orgs: vec!["o".into()],
                labels: vec!["lgtm".into()],
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

    fn controller(
        forge: MockForge,
        substrate: InMemorySubstrate,
        config: TideConfig,
    ) -> Controller {
        Controller::new(
            Arc::new(forge),
            Arc::new(substrate),
            Arc::new(StaticConfigSource::new(config)),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn tick_merges_green_pr() {
        let forge = MockForge::new();
        let green = pr("o", 1, &["lgtm"]);
        forge.set_contexts(
            "o",
            "r",
            &green.head_sha,
            [("e2e".to_string(), ContextState::Success)].into(),
        );
        forge.add_pull_request(green.clone());

        let controller = controller(forge.clone(), InMemorySubstrate::new(), config());
        let report = controller.tick().await;

        assert_eq!(report.prs, 1);
        assert_eq!(report.pools, 1);
        assert_eq!(report.merged, 1);
        assert!(forge.merged().contains(&green.key));
    }

    #[tokio::test]
    async fn tick_triggers_missing_tests_then_status_reports() {
        let forge = MockForge::new();
        let stale = pr("o", 1, &["lgtm"]);
        forge.add_pull_request(stale.clone());

        let substrate = InMemorySubstrate::new();
        let controller = controller(forge.clone(), substrate.clone(), config());
        let report = controller.tick().await;
        assert_eq!(report.triggered, 1);
        assert_eq!(substrate.submitted_names(), vec!["e2e"]);

        let stats = controller.status_pass().await;
        assert_eq!(stats.updated, 1);
        let published = forge.statuses_for(&stale.head_sha);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].state, ContextState::Pending);
        assert_eq!(published[0].description, "Not mergeable. Retesting: e2e");
    }

    #[tokio::test]
    async fn own_status_context_is_ignored_in_rollups() {
        let forge = MockForge::new();
        let green = pr("o", 1, &["lgtm"]);
        forge.set_contexts(
            "o",
            "r",
            &green.head_sha,
            [
                ("e2e".to_string(), ContextState::Success),
                // A stale failing self-status must not block the merge.
                ("tide".to_string(), ContextState::Failure),
            ]
            .into(),
        );
        forge.add_pull_request(green.clone());

        let controller = controller(forge.clone(), InMemorySubstrate::new(), config());
        let report = controller.tick().await;
        assert_eq!(report.merged, 1);
    }

    #[tokio::test]
    async fn failed_search_drops_shard_but_not_tick() {
        let forge = MockForge::new();
        forge.fail_on(crate::forge::mock::FailOn::SearchPullRequests(
            ForgeError::RateLimited,
        ));

        let controller = controller(forge, InMemorySubstrate::new(), config());
        let report = controller.tick().await;
        assert_eq!(report.prs, 0);
        assert_eq!(report.failed_shards, 1);
    }

    #[tokio::test]
    async fn failed_shard_backs_off_exponentially() {
        let forge = MockForge::new();
        forge.add_pull_request(pr("o", 1, &["lgtm"]));
        forge.fail_on(crate::forge::mock::FailOn::SearchPullRequests(
            ForgeError::RateLimited,
        ));

        let controller = controller(forge.clone(), InMemorySubstrate::new(), config());

        // Tick 1 fails the shard; tick 2 sits out the cooldown even
        // though the forge has recovered.
        assert_eq!(controller.tick().await.failed_shards, 1);
        forge.clear_failure();
        let report = controller.tick().await;
        assert_eq!(report.failed_shards, 1);
        assert_eq!(report.prs, 0);

        // Tick 3 retries and succeeds; the backoff state resets.
        let report = controller.tick().await;
        assert_eq!(report.failed_shards, 0);
        assert_eq!(report.prs, 1);
    }

    #[tokio::test]
    async fn blocked_pool_merges_nothing() {
        let forge = MockForge::new();
        let green = pr("o", 1, &["lgtm"]);
        forge.set_contexts(
            "o",
            "r",
            &green.head_sha,
            [("e2e".to_string(), ContextState::Success)].into(),
        );
        forge.add_pull_request(green.clone());
        forge.add_issue(Issue {
            number: 9,
            title: "freeze branch:main".into(),
            org: "o".into(),
            repo: "r".into(),
        });

        let mut config = config();
        config.blocker_label = Some("merge-blocker".into());
        let controller = controller(forge.clone(), InMemorySubstrate::new(), config);
        let report = controller.tick().await;

        assert_eq!(report.merged, 0);
        assert!(forge.merged().is_empty());

        controller.status_pass().await;
        let published = forge.statuses_for(&green.head_sha);
        assert_eq!(
            published[0].description,
            "Not mergeable. Merging is blocked by issues 9."
        );
    }

    #[tokio::test]
    async fn unknown_mergeable_retry_window() {
        let forge = MockForge::new();
        let mut unknown = pr("o", 1, &["lgtm"]);
        unknown.mergeable = MergeableState::Unknown;
        forge.set_contexts(
            "o",
            "r",
            &unknown.head_sha,
            [("e2e".to_string(), ContextState::Success)].into(),
        );
        forge.add_pull_request(unknown.clone());
        forge.set_merge_outcome(&unknown.key, crate::forge::MergeOutcome::Conflict);

        let mut config = config();
        config.unknown_mergeable_retries = 2;
        let controller = controller(forge.clone(), InMemorySubstrate::new(), config);

        // Within the window the PR stays eligible (the merge attempt
        // conflicts, which is fine).
        let report = controller.tick().await;
        assert_eq!(report.pools, 1);
        assert_eq!(report.merged, 0);

        // Exhaust the window: the next ticks stop selecting it.
        controller.tick().await;
        let ops_before = forge.operations().len();
        controller.tick().await;
        let merge_attempts = forge.operations()[ops_before..]
            .iter()
            .filter(|op| matches!(op, crate::forge::mock::MockOperation::Merge { .. }))
            .count();
        assert_eq!(merge_attempts, 0);
    }

    #[tokio::test]
    async fn status_pass_without_tick_is_a_noop() {
        let forge = MockForge::new();
        let controller = controller(forge.clone(), InMemorySubstrate::new(), config());
        let stats = controller.status_pass().await;
        assert_eq!(stats, PassStats::default());
        assert!(forge.operations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn serve_runs_until_shutdown() {
        let forge = MockForge::new();
        forge.add_pull_request(pr("o", 1, &["lgtm"]));
        let substrate = InMemorySubstrate::new();
        let controller = Arc::new(controller(forge.clone(), substrate.clone(), config()));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let serving = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .serve(async {
                        rx.await.ok();
                    })
                    .await;
            })
        };

        // Let a couple of periods elapse, then stop.
        tokio::time::sleep(std::time::Duration::from_secs(130)).await;
        tx.send(()).unwrap();
        serving.await.unwrap();

        // At least one tick ran and submitted the missing job.
        assert!(!substrate.submitted_names().is_empty());
    }

    #[tokio::test]
    async fn unknown_retry_window_resets_on_new_head() {
        let forge = MockForge::new();
        let mut unknown = pr("o", 1, &["lgtm"]);
        unknown.mergeable = MergeableState::Unknown;
        forge.add_pull_request(unknown.clone());

        let mut config = config();
        config.unknown_mergeable_retries = 1;
        let controller = controller(forge.clone(), InMemorySubstrate::new(), config);

        controller.tick().await; // ticks = 1, within budget
        controller.tick().await; // ticks = 2, exhausted

        // New head: the window restarts and the PR is a candidate again.
        let mut repushed = unknown.clone();
        repushed.head_sha = sha('e');
        forge.add_pull_request(repushed);
        let report = controller.tick().await;
        assert_eq!(report.prs, 1);
        assert_eq!(report.pools, 1);
    }
}
