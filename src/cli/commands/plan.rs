//! cli::commands::plan
//!
//! Print the forge searches the configuration would run, one per line,
//! exactly as the discovery phase executes them.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::config::{ConfigSource, FileConfigSource};
use crate::engine::query::{plan_blocker_searches, plan_pr_searches};

/// Print the planned searches for the configuration at `path`.
pub fn plan(path: &Path) -> Result<()> {
    let source = FileConfigSource::load(path)
        .with_context(|| format!("configuration at {} is invalid", path.display()))?;
    let config = source.current();

    for (shard, searches) in plan_pr_searches(&config) {
        for search in searches {
            println!("{shard}: {search}");
        }
    }
    if let Some(label) = &config.blocker_label {
        for (shard, searches) in plan_blocker_searches(&config, label) {
            for search in searches {
                println!("{shard}: {search}");
            }
        }
    }
    Ok(())
}
