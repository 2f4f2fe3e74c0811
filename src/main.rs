//! This file defines the chunkreduce binary entry point.

use std::process::ExitCode;

use chunkreduce::app;
use chunkreduce::cli;
use chunkreduce::tracing;

/// Application entry point
#[tokio::main]
async fn main() -> ExitCode {
    let args = cli::parse();
    tracing::init_tracing();
    match app::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error.log();
            ExitCode::FAILURE
        }
    }
}
