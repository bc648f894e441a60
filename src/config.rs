//! Resolved runtime configuration (§6.1).
//!
//! Bridges parsed CLI [`crate::cli::Args`] and environment fallbacks into one
//! immutable [`Config`] the rest of the application reads from.

use std::path::PathBuf;

use thiserror::Error;

use crate::cli::Args;

/// Environment variable consulted when `--api-token` is not passed (§6.1).
const API_TOKEN_ENV_VAR: &str = "CIVITAI_API_TOKEN";

/// Errors raised while resolving CLI + environment input into a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--target must be either 'model:<id>' or 'user:<handle>', got '{0}'")]
    InvalidTarget(String),
}

/// What to enumerate: a single model, or everything published by a user (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Model(i64),
    User(String),
}

/// Fully resolved runtime configuration (§6.1).
#[derive(Debug, Clone)]
pub struct Config {
    pub target: Target,
    pub output_dir: PathBuf,
    pub state_dir: PathBuf,
    pub api_token: Option<String>,
    pub max_concurrent_downloads: usize,
    pub base_model_whitelist: Vec<String>,
    pub skip_existing: bool,
    pub verbose: u8,
    pub quiet: bool,
}

impl Config {
    /// Resolves CLI arguments plus environment fallbacks into a [`Config`] (§6.1).
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidTarget`] if `--target` is not `model:<id>` or
    /// `user:<handle>`.
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let target = parse_target(&args.target)?;

        let api_token = args
            .api_token
            .or_else(|| std::env::var(API_TOKEN_ENV_VAR).ok());

        let base_model_whitelist = args
            .base_model
            .into_iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();

        Ok(Self {
            target,
            output_dir: args.output_dir,
            state_dir: args.state_dir,
            api_token,
            max_concurrent_downloads: usize::from(args.max_concurrent_downloads),
            base_model_whitelist,
            skip_existing: !args.no_skip_existing,
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }

    /// The Task Store's backing SQLite file, under `state_dir` (§4.8).
    #[must_use]
    pub fn task_db_path(&self) -> PathBuf {
        self.state_dir.join("tasks.db")
    }
}

fn parse_target(raw: &str) -> Result<Target, ConfigError> {
    match raw.split_once(':') {
        Some(("model", id)) => id
            .parse::<i64>()
            .map(Target::Model)
            .map_err(|_| ConfigError::InvalidTarget(raw.to_string())),
        Some(("user", handle)) if !handle.is_empty() => Ok(Target::User(handle.to_string())),
        _ => Err(ConfigError::InvalidTarget(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(target: &str) -> Args {
        <Args as clap::Parser>::try_parse_from(["modelvault-fetch", "--target", target]).unwrap()
    }

    #[test]
    fn test_parse_model_target() {
        assert_eq!(parse_target("model:123").unwrap(), Target::Model(123));
    }

    #[test]
    fn test_parse_user_target() {
        assert_eq!(
            parse_target("user:alice").unwrap(),
            Target::User("alice".to_string())
        );
    }

    #[test]
    fn test_parse_target_rejects_unknown_prefix() {
        assert!(parse_target("collection:5").is_err());
    }

    #[test]
    fn test_parse_target_rejects_empty_user_handle() {
        assert!(parse_target("user:").is_err());
    }

    #[test]
    fn test_config_from_args_lowercases_base_model_whitelist() {
        let mut args = base_args("model:1");
        args.base_model = vec!["SDXL".to_string(), "Pony".to_string()];
        let config = Config::from_args(args).unwrap();
        assert_eq!(config.base_model_whitelist, vec!["sdxl", "pony"]);
    }

    #[test]
    fn test_config_skip_existing_defaults_true() {
        let config = Config::from_args(base_args("model:1")).unwrap();
        assert!(config.skip_existing);
    }
}
