//! cli
//!
//! Command-line interface layer.
//!
//! # Responsibilities
//!
//! - Parse command-line arguments and global flags
//! - Initialize logging
//! - Delegate to command handlers
//!
//! The CLI layer is thin. It parses arguments via clap and dispatches to
//! the [`crate::engine`] through the command handlers; `anyhow` error
//! handling stops at this boundary.

pub mod args;
pub mod commands;

pub use args::{Cli, Command};

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Run the CLI application.
///
/// This is the main entry point called from `main.rs`.
pub async fn run() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.debug);
    commands::dispatch(cli.command).await
}

/// Initialize the tracing subscriber.
///
/// `--debug` overrides `RUST_LOG`; otherwise the filter defaults to
/// `info`.
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
