//! Generated daemon configuration
//!
//! `run` never hands the registry to the daemon directly. It renders one YAML
//! file per tunnel with an ingress rule per service, always terminated by a
//! catch-all rule.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, ValidationError};
use crate::registry::Tunnel;

/// Service returned for hostnames without a rule
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

/// One ingress rule; the catch-all has no hostname
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

/// Daemon configuration for a single tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub tunnel: String,

    #[serde(rename = "credentials-file")]
    pub credentials_file: PathBuf,

    pub ingress: Vec<IngressRule>,
}

impl DaemonConfig {
    /// Build the config for a tunnel, one rule per service in insertion order
    pub fn for_tunnel(tunnel: &Tunnel, credentials_file: PathBuf) -> Result<Self, ValidationError> {
        if tunnel.services.is_empty() {
            return Err(ValidationError::NoServices(tunnel.name.clone()));
        }

        let ingress = tunnel
            .services
            .iter()
            .map(|s| IngressRule {
                hostname: Some(s.hostname.clone()),
                service: s.target_url.clone(),
            })
            .chain(std::iter::once(IngressRule {
                hostname: None,
                service: CATCH_ALL_SERVICE.to_string(),
            }))
            .collect();

        Ok(Self {
            tunnel: tunnel.id.clone(),
            credentials_file,
            ingress,
        })
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Write the config, creating its directory
    pub fn write_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_yaml()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::debug!("Wrote daemon config {:?}", path);
        Ok(())
    }
}
