//! engine::policy
//!
//! Required-context resolution for a branch.
//!
//! # Design
//!
//! Three disjoint context sets gate a merge:
//!
//! - **required**: contexts that must be green at the PR head
//! - **required-if-present**: contexts that gate only when they appear
//!   (jobs with change-based triggers)
//! - **optional**: contexts that never gate
//!
//! Sets are built from the presubmit job definitions, merged with the
//! static `context_options` overrides in org -> repo -> branch order, and
//! finally with branch-protection required contexts when the resolved
//! policy asks for them. A context landing in two sets is a configuration
//! error surfaced per PR, never a crash.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::core::config::TideConfig;
use crate::core::types::{ContextMap, ContextState};
use crate::forge::{ForgeClient, ForgeError};

/// Errors from policy resolution.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A context ended up in more than one set.
    #[error("context {0:?} appears in more than one context set")]
    ConflictingContext(String),

    /// Branch protection could not be read.
    #[error(transparent)]
    Forge(#[from] ForgeError),
}

/// The resolved context policy for one `(org, repo, branch)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPolicy {
    /// Contexts that must be green.
    pub required: BTreeSet<String>,
    /// Contexts that must be green when present.
    pub required_if_present: BTreeSet<String>,
    /// Contexts that never gate a merge.
    pub optional: BTreeSet<String>,
}

impl ResolvedPolicy {
    /// The required contexts that are not green in `contexts`.
    ///
    /// A missing required context counts as unsatisfied; a
    /// required-if-present context gates only when it appears.
    pub fn unsatisfied(&self, contexts: &ContextMap) -> Vec<String> {
        let mut failing = Vec::new();
        for name in &self.required {
            let green = contexts
                .get(name)
                .map(|s| s.is_success())
                .unwrap_or(false);
            if !green {
                failing.push(name.clone());
            }
        }
        for name in &self.required_if_present {
            if let Some(state) = contexts.get(name) {
                if !state.is_success() {
                    failing.push(name.clone());
                }
            }
        }
        failing.sort();
        failing
    }

    /// The unsatisfied contexts that are pending (as opposed to failed).
    pub fn pending(&self, contexts: &ContextMap) -> Vec<String> {
        self.unsatisfied(contexts)
            .into_iter()
            .filter(|name| {
                matches!(
                    contexts.get(name),
                    Some(ContextState::Pending) | None
                )
            })
            .collect()
    }

    fn check_disjoint(&self) -> Result<(), PolicyError> {
        for name in &self.required {
            if self.required_if_present.contains(name) || self.optional.contains(name) {
                return Err(PolicyError::ConflictingContext(name.clone()));
            }
        }
        for name in &self.required_if_present {
            if self.optional.contains(name) {
                return Err(PolicyError::ConflictingContext(name.clone()));
            }
        }
        Ok(())
    }
}

/// Resolve the context policy for `(org, repo, branch)`.
///
/// Branch protection is consulted only when the merged static policy sets
/// `from_branch_protection`.
///
/// # Errors
///
/// `PolicyError::ConflictingContext` when a context lands in two sets;
/// `PolicyError::Forge` when branch protection cannot be read.
pub async fn resolve_policy(
    forge: &dyn ForgeClient,
    config: &TideConfig,
    org: &str,
    repo: &str,
    branch: &str,
) -> Result<ResolvedPolicy, PolicyError> {
    let mut policy = ResolvedPolicy::default();

    for job in config.presubmits_for(org, repo) {
        if job.skip_report || !job.runs_against(branch) {
            continue;
        }
        let context = job.context().to_string();
        if job.optional {
            policy.optional.insert(context);
        } else if job.always_run {
            policy.required.insert(context);
        } else if job.is_conditional() {
            policy.required_if_present.insert(context);
        } else if config.require_manually_triggered_jobs {
            policy.required.insert(context);
        } else {
            // Manually triggered and unconditional: gate only when someone
            // actually ran it.
            policy.required_if_present.insert(context);
        }
    }

    let options = config.context_options.resolve(org, repo, branch);
    policy.required.extend(options.required_contexts.iter().cloned());
    policy
        .required_if_present
        .extend(options.required_if_present_contexts.iter().cloned());
    policy.optional.extend(options.optional_contexts.iter().cloned());

    if options.from_branch_protection.unwrap_or(false) {
        let protected = forge.branch_protection_contexts(org, repo, branch).await?;
        for context in protected {
            // Branch protection outranks weaker placements from job config.
            policy.required_if_present.remove(&context);
            policy.required.insert(context);
        }
    }

    policy.check_disjoint()?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ContextPolicy, Presubmit};
    use crate::forge::mock::MockForge;

    fn config_with_jobs(jobs: Vec<Presubmit>) -> TideConfig {
        TideConfig {
            presubmits: [("o/r".to_string(), jobs)].into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn classifies_job_kinds() {
        let config = config_with_jobs(vec![
            Presubmit {
                name: "unit".into(),
                always_run: true,
                ..Default::default()
            },
            Presubmit {
                name: "e2e".into(),
                run_if_changed: Some("^pkg/".into()),
                ..Default::default()
            },
            Presubmit {
                name: "lint".into(),
                optional: true,
                ..Default::default()
            },
            Presubmit {
                name: "bench".into(),
                skip_report: true,
                ..Default::default()
            },
            Presubmit {
                name: "manual".into(),
                ..Default::default()
            },
        ]);

        let forge = MockForge::new();
        let policy = resolve_policy(&forge, &config, "o", "r", "main")
            .await
            .unwrap();

        assert_eq!(policy.required, ["unit".to_string()].into());
        assert_eq!(
            policy.required_if_present,
            ["e2e".to_string(), "manual".to_string()].into()
        );
        assert_eq!(policy.optional, ["lint".to_string()].into());
    }

    #[tokio::test]
    async fn manually_triggered_jobs_can_be_required() {
        let mut config = config_with_jobs(vec![Presubmit {
            name: "manual".into(),
            ..Default::default()
        }]);
        config.require_manually_triggered_jobs = true;

        let forge = MockForge::new();
        let policy = resolve_policy(&forge, &config, "o", "r", "main")
            .await
            .unwrap();
        assert_eq!(policy.required, ["manual".to_string()].into());
    }

    #[tokio::test]
    async fn branch_filter_applies() {
        let config = config_with_jobs(vec![Presubmit {
            name: "release-only".into(),
            always_run: true,
            branches: vec!["release".into()],
            ..Default::default()
        }]);

        let forge = MockForge::new();
        let main = resolve_policy(&forge, &config, "o", "r", "main")
            .await
            .unwrap();
        assert!(main.required.is_empty());

        let release = resolve_policy(&forge, &config, "o", "r", "release")
            .await
            .unwrap();
        assert_eq!(release.required, ["release-only".to_string()].into());
    }

    #[tokio::test]
    async fn static_options_merge_in() {
        let mut config = config_with_jobs(vec![Presubmit {
            name: "unit".into(),
            always_run: true,
            ..Default::default()
        }]);
        config.context_options.policy = ContextPolicy {
            required_contexts: vec!["external-ci".into()],
            optional_contexts: vec!["coverage".into()],
            ..Default::default()
        };

        let forge = MockForge::new();
        let policy = resolve_policy(&forge, &config, "o", "r", "main")
            .await
            .unwrap();
        assert_eq!(
            policy.required,
            ["external-ci".to_string(), "unit".to_string()].into()
        );
        assert_eq!(policy.optional, ["coverage".to_string()].into());
    }

    #[tokio::test]
    async fn branch_protection_contexts_become_required() {
        let mut config = config_with_jobs(vec![Presubmit {
            name: "e2e".into(),
            run_if_changed: Some("^pkg/".into()),
            ..Default::default()
        }]);
        config.context_options.policy.from_branch_protection = Some(true);

        let forge = MockForge::new();
        forge.set_protection("o", "r", "main", vec!["e2e".into(), "dco".into()]);

        let policy = resolve_policy(&forge, &config, "o", "r", "main")
            .await
            .unwrap();
        // e2e was promoted out of required-if-present.
        assert_eq!(
            policy.required,
            ["dco".to_string(), "e2e".to_string()].into()
        );
        assert!(policy.required_if_present.is_empty());
    }

    #[tokio::test]
    async fn conflicting_sets_error() {
        let mut config = config_with_jobs(vec![Presubmit {
            name: "unit".into(),
            always_run: true,
            ..Default::default()
        }]);
        config.context_options.policy.optional_contexts = vec!["unit".into()];

        let forge = MockForge::new();
        let err = resolve_policy(&forge, &config, "o", "r", "main")
            .await
            .unwrap_err();
        assert!(matches!(err, PolicyError::ConflictingContext(name) if name == "unit"));
    }

    #[test]
    fn unsatisfied_and_pending() {
        let policy = ResolvedPolicy {
            required: ["unit".to_string(), "e2e".to_string()].into(),
            required_if_present: ["conditional".to_string()].into(),
            optional: ["lint".to_string()].into(),
        };

        let mut contexts = ContextMap::new();
        contexts.insert("unit".into(), ContextState::Success);
        contexts.insert("lint".into(), ContextState::Failure);

        // e2e is missing (counts as pending); conditional is absent (does
        // not gate); lint is optional.
        assert_eq!(policy.unsatisfied(&contexts), vec!["e2e".to_string()]);
        assert_eq!(policy.pending(&contexts), vec!["e2e".to_string()]);

        contexts.insert("conditional".into(), ContextState::Failure);
        contexts.insert("e2e".into(), ContextState::Pending);
        assert_eq!(
            policy.unsatisfied(&contexts),
            vec!["conditional".to_string(), "e2e".to_string()]
        );
        assert_eq!(policy.pending(&contexts), vec!["e2e".to_string()]);
    }
}
