//! CLI entry point for the model-hosting bulk downloader.

use clap::Parser;
use modelvault_core::app;
use modelvault_core::cli::Args;
use modelvault_core::error::exit_code_for;

#[tokio::main]
async fn main() {
    // Parse CLI arguments first (before tracing init, so --help works without logs).
    let args = Args::parse();

    let outcome = app::run(args).await;
    let code = match &outcome {
        Ok(run_outcome) => exit_code_for(Ok(*run_outcome)),
        Err(err) => {
            eprintln!("modelvault-fetch: {err}");
            exit_code_for(Err(err))
        }
    };

    std::process::exit(code);
}
