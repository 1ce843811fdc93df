//! core
//!
//! Core domain types and configuration for the merge controller.
//!
//! # Modules
//!
//! - [`types`] - Strong types: PrKey, PoolKey, BranchName, Sha, etc.
//! - [`config`] - Configuration schema, validation, and snapshots
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid states at compile time
//! - Configuration is validated at load time, never mid-tick
//! - All classification logic downstream of here is deterministic

pub mod config;
pub mod types;
