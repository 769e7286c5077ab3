//! TOML configuration file loading
//!
//! Supports `~/.config/don-capabilities/config.toml` as a persistent config
//! source. Every field is optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    /// Hex peer id of the local node
    #[serde(default)]
    pub peer_id: Option<String>,

    /// Per-peer stream limits
    #[serde(default)]
    pub stream: StreamFileConfig,

    /// Remote target shims
    #[serde(default)]
    pub target: TargetFileConfig,

    /// Fallbacks for remote trigger shims
    #[serde(default)]
    pub trigger: TriggerFileConfig,

    /// Local streams trigger service
    #[serde(default)]
    pub streams: StreamsFileConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamFileConfig {
    pub incoming_message_buffer_size: Option<usize>,
    pub outgoing_message_buffer_size: Option<usize>,
    pub max_message_len_bytes: Option<usize>,

    /// Messages per second
    pub message_rate: Option<f64>,
    pub message_capacity: Option<u32>,

    /// Bytes per second
    pub bytes_rate: Option<f64>,
    pub bytes_capacity: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetFileConfig {
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerFileConfig {
    pub registration_refresh_secs: Option<u64>,
    pub registration_expiry_secs: Option<u64>,
    pub message_expiry_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamsFileConfig {
    pub tick_resolution_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
}

/// Load the TOML config file from the standard path
///
/// Returns `ConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ConfigFile {
    let Some(path) = config_file_path() else {
        return ConfigFile::default();
    };

    if !path.exists() {
        return ConfigFile::default();
    }

    match load_config_file_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            ConfigFile::default()
        }
    }
}

/// Load a config file the user pointed at explicitly
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn load_config_file_from(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/don-capabilities/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("don-capabilities").join("config.toml"))
}
