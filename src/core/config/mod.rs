//! core::config
//!
//! Configuration schema, loading, and snapshot handling.
//!
//! # Overview
//!
//! The engine never parses files. It consumes configuration through the
//! [`ConfigSource`] capability trait, which hands out atomic
//! `Arc<TideConfig>` snapshots. Snapshots may be swapped between ticks;
//! a tick always sees exactly one snapshot.
//!
//! # Sources
//!
//! - [`FileConfigSource`] - reads a TOML file, revalidates on `reload()`
//! - [`StaticConfigSource`] - a fixed snapshot, used by tests
//!
//! # Example
//!
//! ```no_run
//! use tideway::core::config::{ConfigSource, FileConfigSource};
//! use std::path::Path;
//!
//! let source = FileConfigSource::load(Path::new("/etc/tide/config.toml")).unwrap();
//! let config = source.current();
//! println!("syncing every {:?}", config.sync_period());
//! ```

pub mod schema;

pub use schema::{
    ContextPolicy, ContextPolicyOptions, MergeMethodEntry, OrgMergeMethod, Presubmit,
    PriorityEntry, QueryConfig, RepoMergeMethod, TideConfig, DEFAULT_BATCH_SIZE_LIMIT,
};

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// Errors from configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {message}")]
    ParseError { path: PathBuf, message: String },

    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Look up the most specific value for `(org, repo)` in a map keyed by
/// `"org/repo"`, `"org"`, or `"*"`.
pub fn lookup_most_specific<'a, T>(
    map: &'a BTreeMap<String, T>,
    org: &str,
    repo: &str,
) -> Option<&'a T> {
    map.get(&format!("{org}/{repo}"))
        .or_else(|| map.get(org))
        .or_else(|| map.get("*"))
}

/// Supplier of configuration snapshots.
///
/// Implementations must hand out internally consistent snapshots; the
/// engine pins one `Arc` per tick and never observes a partial update.
pub trait ConfigSource: Send + Sync {
    /// The current configuration snapshot.
    fn current(&self) -> Arc<TideConfig>;
}

/// File-backed configuration source.
///
/// Parses and validates at construction; `reload()` swaps in a new
/// snapshot atomically, keeping the old one on any error.
#[derive(Debug)]
pub struct FileConfigSource {
    path: PathBuf,
    snapshot: RwLock<Arc<TideConfig>>,
}

impl FileConfigSource {
    /// Load and validate configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            snapshot: RwLock::new(Arc::new(config)),
        })
    }

    /// Re-read the file and swap the snapshot.
    ///
    /// On error the previous snapshot stays in place.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let config = Self::read(&self.path)?;
        let mut guard = self.snapshot.write().expect("config lock poisoned");
        *guard = Arc::new(config);
        Ok(())
    }

    /// The path this source reads from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<TideConfig, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: TideConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }
}

impl ConfigSource for FileConfigSource {
    fn current(&self) -> Arc<TideConfig> {
        self.snapshot.read().expect("config lock poisoned").clone()
    }
}

/// Fixed configuration source for tests and one-shot runs.
pub struct StaticConfigSource(Arc<TideConfig>);

impl StaticConfigSource {
    /// Wrap a config in a static source.
    pub fn new(config: TideConfig) -> Self {
        Self(Arc::new(config))
    }
}

impl ConfigSource for StaticConfigSource {
    fn current(&self) -> Arc<TideConfig> {
        self.0.clone()
    }
}
