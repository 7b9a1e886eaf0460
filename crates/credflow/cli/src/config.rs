//! Locating and loading the flow configuration

use crate::error::{CliError, CliResult};
use credflow_types::{FlowConfig, FlowError};
use std::path::PathBuf;

/// Where the configuration was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file exists at the path; built-in defaults apply.
    Defaults(PathBuf),
}

/// Load configuration from `path`, or from the per-user default location.
pub fn load(path: Option<&str>) -> CliResult<(FlowConfig, ConfigSource)> {
    let config_path = match path {
        Some(p) => PathBuf::from(p),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok((FlowConfig::default(), ConfigSource::Defaults(config_path)));
    }
    let contents = std::fs::read_to_string(&config_path)?;
    let config = FlowConfig::from_toml_str(&contents).map_err(|e| match e {
        FlowError::Config(msg) => CliError::Config(format!("{}: {}", config_path.display(), msg)),
        other => CliError::Flow(other),
    })?;
    Ok((config, ConfigSource::File(config_path)))
}

fn default_config_path() -> CliResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| CliError::Config("Cannot find config directory".into()))?;
    Ok(config_dir.join("credflow").join("config.toml"))
}
