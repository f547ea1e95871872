//! Configuration management for flaretun
//!
//! Two files live in the config directory: the tunnel registry
//! (`config.json`, see [`crate::store`]) and the tool settings
//! (`settings.toml`, handled here).

mod settings;
pub mod serde_utils;

pub use settings::{Settings, DEFAULT_CLOUDFLARED_BIN, DEFAULT_HEALTH_TIMEOUT};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Registry file name inside the config directory
pub const REGISTRY_FILE_NAME: &str = "config.json";

/// Settings file name inside the config directory
pub const SETTINGS_FILE_NAME: &str = "settings.toml";

/// Log file name inside the config directory
pub const LOG_FILE_NAME: &str = "flaretun.log";

/// Origin certificate the daemon writes on login, inside its own directory
pub const AUTH_MARKER_FILE_NAME: &str = "cert.pem";

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flaretun")
}

/// Get the default daemon directory (`~/.cloudflared`)
pub fn default_cloudflared_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cloudflared")
}

/// Resolved file locations for one invocation
#[derive(Debug, Clone)]
pub struct Paths {
    config_dir: PathBuf,
    cloudflared_dir: PathBuf,
    log_file: Option<PathBuf>,
}

impl Paths {
    /// Build paths from a config directory and the effective settings
    pub fn new(config_dir: impl Into<PathBuf>, settings: &Settings) -> Self {
        Self {
            config_dir: config_dir.into(),
            cloudflared_dir: settings.cloudflared_dir.clone(),
            log_file: settings.log_file.clone(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn registry_file(&self) -> PathBuf {
        self.config_dir.join(REGISTRY_FILE_NAME)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join(SETTINGS_FILE_NAME)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.config_dir.join(LOG_FILE_NAME))
    }

    /// Generated daemon config for a tunnel
    pub fn daemon_config_file(&self, tunnel_id: &str) -> PathBuf {
        self.config_dir
            .join("tunnels")
            .join(format!("{}.yml", tunnel_id))
    }

    /// Credentials file the daemon writes when creating a tunnel
    pub fn credentials_file(&self, tunnel_id: &str) -> PathBuf {
        self.cloudflared_dir.join(format!("{}.json", tunnel_id))
    }

    /// Origin certificate written by the daemon's login flow
    pub fn auth_marker(&self) -> PathBuf {
        self.cloudflared_dir.join(AUTH_MARKER_FILE_NAME)
    }
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(())
}
