//! Driver configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::group::CallGroupConfig;

/// Main configuration for the `cg` driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Call group construction parameters
    pub group: CallGroupConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./callgroup.yml`, then
    /// `~/.config/callgroup/callgroup.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        debug!(?config_path, "Config::load: called");
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::default_paths() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read just the log level, before logging is set up
    ///
    /// Errors are swallowed; the full load reports them later.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        match config_path {
            Some(path) => Self::load_from_file(path).ok()?.log_level,
            None => Self::default_paths()
                .into_iter()
                .filter(|p| p.exists())
                .find_map(|p| Self::load_from_file(&p).ok())
                .and_then(|c| c.log_level),
        }
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("callgroup.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("callgroup").join("callgroup.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Render the configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config")
    }
}
