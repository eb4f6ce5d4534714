//! Configuration loading for the `weft` binary.
//!
//! Reads `~/.weft/config.toml` (or the `--config` path). A missing or
//! malformed file never fails the command: it is logged and defaults apply.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use weft_wire::ChannelConfig;

/// Pipe implementation used between demo nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DemoTransport {
    /// One in-process Port per link.
    #[default]
    Port,
    /// Length-prefixed JSON over an in-memory duplex stream.
    Stream,
}

impl std::fmt::Display for DemoTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DemoTransport::Port => write!(f, "port"),
            DemoTransport::Stream => write!(f, "stream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub nodes: usize,
    pub transport: DemoTransport,
    pub calls: u32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            nodes: 3,
            transport: DemoTransport::Port,
            calls: 1,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    /// Template for every channel the CLI creates. The id is replaced per node.
    pub channel: ChannelConfig,
    pub demo: DemoConfig,
}

/// Parse configuration from TOML text.
pub fn parse_config(contents: &str) -> Result<WeftConfig, toml::de::Error> {
    toml::from_str(contents)
}

/// Load configuration from `path`, or the default location.
pub fn load_config(path: Option<&Path>) -> WeftConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return WeftConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match parse_config(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                WeftConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            WeftConfig::default()
        }
    }
}

pub fn default_config_path() -> PathBuf {
    weft_home().join("config.toml")
}

/// Get the default Weft home directory.
pub fn weft_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".weft")
}
