//! Tool settings (`settings.toml`)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::error::ConfigError;

/// Default daemon binary name, resolved through PATH
pub const DEFAULT_CLOUDFLARED_BIN: &str = "cloudflared";

/// Default timeout for the local TCP health check
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(1);

/// User-editable settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Daemon binary name or path
    pub cloudflared_bin: String,

    /// Directory holding the daemon's origin certificate and tunnel credentials
    pub cloudflared_dir: PathBuf,

    /// Timeout for the local port health check
    #[serde(rename = "health_timeout_ms", with = "duration_millis")]
    pub health_timeout: Duration,

    /// Log file override (defaults to `flaretun.log` in the config dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cloudflared_bin: DEFAULT_CLOUDFLARED_BIN.to_string(),
            cloudflared_dir: super::default_cloudflared_dir(),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            log_file: None,
        }
    }
}

impl Settings {
    /// Load settings, returning defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match super::load_config(path) {
            Ok(settings) => Ok(settings),
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Apply command-line/environment overrides on top of file values
    pub fn with_overrides(
        mut self,
        cloudflared_bin: Option<String>,
        cloudflared_dir: Option<PathBuf>,
    ) -> Self {
        if let Some(bin) = cloudflared_bin {
            self.cloudflared_bin = bin;
        }
        if let Some(dir) = cloudflared_dir {
            self.cloudflared_dir = dir;
        }
        self
    }
}
