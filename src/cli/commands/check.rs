//! cli::commands::check
//!
//! Validate a configuration file and report every problem found.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::config::{ConfigSource, FileConfigSource};

/// Validate the configuration at `path`.
///
/// Prints a summary on success; returns an error (non-zero exit) when the
/// file cannot be read, parsed, or fails validation.
pub fn check(path: &Path) -> Result<()> {
    let source = FileConfigSource::load(path)
        .with_context(|| format!("configuration at {} is invalid", path.display()))?;

    let config = source.current();
    println!(
        "{}: OK ({} queries, {} presubmit repos, sync every {:?})",
        path.display(),
        config.queries.len(),
        config.presubmits.len(),
        config.sync_period(),
    );
    Ok(())
}
