//! cli::commands::serve
//!
//! Run the sync and status controllers.
//!
//! # Wiring
//!
//! The forge token comes from `$GITHUB_TOKEN`. The bundled job substrate
//! keeps its index in process; deployments that drive an external test
//! system embed the crate as a library and pass their own
//! [`crate::jobs::JobSubstrate`] to [`crate::engine::Controller`].

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::core::config::{ConfigSource, FileConfigSource};
use crate::engine::{Controller, SystemClock};
use crate::forge::github::GitHubForge;
use crate::jobs::memory::InMemorySubstrate;

/// Run the controllers against the configuration at `path`.
///
/// With `once`, runs a single sync tick and status pass and exits;
/// otherwise serves until SIGINT or SIGTERM, either of which cancels
/// in-flight work.
pub async fn serve(path: &Path, once: bool, github_api_url: Option<&str>) -> Result<()> {
    let source = FileConfigSource::load(path)
        .with_context(|| format!("configuration at {} is invalid", path.display()))?;
    let config = source.current();

    let token = std::env::var("GITHUB_TOKEN")
        .context("GITHUB_TOKEN must be set to the forge access token")?;
    let forge = match github_api_url {
        Some(url) => GitHubForge::with_api_base(token, url),
        None => GitHubForge::new(token),
    };

    info!(
        config = %path.display(),
        queries = config.queries.len(),
        sync_period = ?config.sync_period(),
        "starting controllers"
    );

    let controller = Controller::new(
        Arc::new(forge),
        Arc::new(InMemorySubstrate::new()),
        Arc::new(source),
        Arc::new(SystemClock),
    );

    if once {
        let report = controller.tick().await;
        let stats = controller.status_pass().await;
        println!(
            "tick: {} PRs in {} pools, {} merged, {} jobs triggered, {} shards failed; \
             status: {} updated, {} skipped, {} failed",
            report.prs,
            report.pools,
            report.merged,
            report.triggered,
            report.failed_shards,
            stats.updated,
            stats.skipped,
            stats.failed,
        );
        return Ok(());
    }

    // SIGTERM is what process managers send for graceful restarts; left
    // untrapped it would kill the process mid-tick.
    let mut sigterm =
        signal(SignalKind::terminate()).context("could not install the SIGTERM handler")?;
    controller
        .serve(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        })
        .await;
    Ok(())
}
