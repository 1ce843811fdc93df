//! Binary entry point for the `tide` controller.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match tideway::cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
