//! cli::commands
//!
//! Command dispatch and handlers.
//!
//! # Architecture
//!
//! Each command handler:
//! 1. Loads and validates the configuration
//! 2. Wires the capability implementations (forge, substrate, clock)
//! 3. Hands control to the engine
//!
//! Handlers do not talk to the forge directly; everything flows through
//! the engine's capability traits.

mod check;
mod plan;
mod serve;

pub use check::check;
pub use plan::plan;
pub use serve::serve;

use anyhow::Result;

use super::args::Command;

/// Dispatch a parsed command to its handler.
pub async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Serve {
            config,
            once,
            github_api_url,
        } => serve(&config, once, github_api_url.as_deref()).await,
        Command::Check { config } => check(&config),
        Command::Plan { config } => plan(&config),
    }
}
