//! CLI subcommand implementations.

pub mod config;
pub mod jobs;
pub mod serve;

use cronrelay_runtime::Config;

/// Load the configuration: file if given, then environment overrides.
pub fn load_config(path: Option<&String>) -> Result<Config, String> {
    let result = match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    };
    result.map_err(|e| format!("failed to load configuration: {e}"))
}
