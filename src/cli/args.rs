//! cli::args
//!
//! Command-line argument definitions using clap derive.
//!
//! # Global Flags
//!
//! - `--help` / `-h`: Show help
//! - `--version`: Show version
//! - `--debug`: Enable debug logging (overrides `RUST_LOG`)

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Tide - merge automation for pull request pools
#[derive(Parser, Debug)]
#[command(name = "tide")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Parser::parse()
    }
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sync and status controllers
    Serve {
        /// Path to the controller configuration file
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Run a single sync tick and status pass, then exit
        #[arg(long)]
        once: bool,

        /// GitHub API base URL (for GitHub Enterprise)
        #[arg(long, value_name = "URL")]
        github_api_url: Option<String>,
    },

    /// Validate a configuration file
    Check {
        /// Path to the controller configuration file
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
    },

    /// Print the forge searches the configuration plans
    Plan {
        /// Path to the controller configuration file
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_serve() {
        let cli = Cli::try_parse_from(["tide", "serve", "--config", "/etc/tide.toml", "--once"])
            .unwrap();
        match cli.command {
            Command::Serve { config, once, .. } => {
                assert_eq!(config, PathBuf::from("/etc/tide.toml"));
                assert!(once);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn parses_check_and_plan() {
        let cli = Cli::try_parse_from(["tide", "check", "--config", "tide.toml"]).unwrap();
        assert!(matches!(cli.command, Command::Check { .. }));

        let cli = Cli::try_parse_from(["tide", "--debug", "plan", "--config", "tide.toml"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.command, Command::Plan { .. }));
    }

    #[test]
    fn config_is_required() {
        assert!(Cli::try_parse_from(["tide", "serve"]).is_err());
    }
}
