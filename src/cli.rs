//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Bulk-download models and gallery images from an AI-model hosting service.
///
/// Enumerates a model or a user's published catalog, plans an organized destination
/// layout, and pulls every file and image with resumable, integrity-verified transfers.
#[derive(Parser, Debug)]
#[command(name = "modelvault-fetch")]
#[command(author, version, about)]
pub struct Args {
    /// What to fetch: `model:<id>` or `user:<handle>`.
    #[arg(short, long)]
    pub target: String,

    /// Directory models and images are written under (§4.4).
    #[arg(short, long, default_value = "./downloads")]
    pub output_dir: PathBuf,

    /// Directory holding the Task Store database and its `.bak` checkpoints (§4.8).
    #[arg(long, default_value = "./.state")]
    pub state_dir: PathBuf,

    /// API token for authenticated requests. Falls back to `CIVITAI_API_TOKEN` (§6.1).
    #[arg(long)]
    pub api_token: Option<String>,

    /// Ceiling on concurrent model-file downloads; the image pipeline runs at
    /// up to twice this (§4.9).
    #[arg(short = 'c', long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub max_concurrent_downloads: u8,

    /// Restrict downloads to versions whose `baseModel` contains one of these
    /// substrings (case-insensitive, repeatable). Empty means no filtering (§4.7).
    #[arg(long = "base-model")]
    pub base_model: Vec<String>,

    /// Re-download files even when a matching destination already exists (§4.10).
    #[arg(long)]
    pub no_skip_existing: bool,

    /// Increase output verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output.
    #[arg(short, long)]
    pub quiet: bool,
}
