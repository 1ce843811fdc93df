//! Tideway - merge automation for pull request pools
//!
//! Tideway continuously discovers open pull requests across
//! organizations, partitions them into per-`(org, repo, branch)` merge
//! pools, decides per pool whether to merge, test, batch-test, or wait,
//! and publishes a per-PR status context explaining the decision.
//!
//! # Architecture
//!
//! The codebase follows a strict layered architecture:
//!
//! - [`cli`] - Command-line interface layer (parses args, delegates to engine)
//! - [`engine`] - Query planning, pool classification, actions, controllers
//! - [`core`] - Domain types and configuration
//! - [`forge`] - Abstraction for the code host (GitHub v1)
//! - [`jobs`] - Abstraction for the test-job execution substrate
//!
//! # Correctness Invariants
//!
//! The controllers maintain the following invariants:
//!
//! 1. A PR belongs to at most one pool per tick
//! 2. A PR merges only with every required context green at its head
//! 3. A pool with merge blockers never merges anything
//! 4. Job concurrency limits hold even when the job index lags
//! 5. Pools are recomputed from scratch each tick; a restart loses nothing

pub mod cli;
pub mod core;
pub mod engine;
pub mod forge;
pub mod jobs;
