//! Tunnel registry domain types
//!
//! The [`Registry`] is the persisted root: every known tunnel keyed by its
//! daemon-assigned id, plus a weak reference to the active one. All mutations
//! validate first and leave the registry untouched when they fail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Current on-disk schema version
pub const CURRENT_VERSION: &str = "2.0";

/// Maximum length of a DNS name without the trailing dot
const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

/// Origin protocol of a local service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    /// Default port implied by the scheme
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            _ => Err(ValidationError::UnsupportedProtocol(s.to_string())),
        }
    }
}

/// A public hostname routed to a local endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Fully-qualified public hostname, stored lowercase
    pub hostname: String,

    /// Local origin, `scheme://localhost:port`
    #[serde(rename = "service")]
    pub target_url: String,

    pub protocol: Protocol,

    pub port: u16,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Service {
    /// Build a validated service pointing at `protocol://localhost:port`
    pub fn new(hostname: &str, protocol: Protocol, port: u32) -> Result<Self, ValidationError> {
        let hostname = validate_hostname(hostname)?;
        let port = validate_port(port)?;

        Ok(Self {
            hostname,
            target_url: local_target_url(protocol, port),
            protocol,
            port,
            created_at: Utc::now(),
            updated_at: None,
        })
    }
}

/// Origin URL for a local port
pub fn local_target_url(protocol: Protocol, port: u16) -> String {
    format!("{}://localhost:{}", protocol, port)
}

/// A daemon-side tunnel and the services routed through it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    /// Daemon-assigned identifier, never generated locally
    #[serde(rename = "tunnelId")]
    pub id: String,

    #[serde(rename = "tunnelName")]
    pub name: String,

    /// Services in insertion order
    #[serde(default)]
    pub services: Vec<Service>,

    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "lastUsed", default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Tunnel {
    /// Track a tunnel whose id came from the daemon
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            services: Vec::new(),
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    /// Check whether a hostname is already routed through this tunnel
    pub fn has_hostname(&self, hostname: &str) -> bool {
        self.services
            .iter()
            .any(|s| s.hostname.eq_ignore_ascii_case(hostname))
    }

    /// Services sorted by hostname, for listings that ask for it
    pub fn sorted_services(&self) -> Vec<&Service> {
        let mut services: Vec<&Service> = self.services.iter().collect();
        services.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        services
    }
}

/// Persisted root of all known tunnels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    pub version: String,

    /// Weak reference into `tunnels`
    #[serde(rename = "activeTunnel", default, skip_serializing_if = "Option::is_none")]
    pub active_tunnel: Option<String>,

    #[serde(default)]
    pub tunnels: BTreeMap<String, Tunnel>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Create an empty registry at the current schema version
    pub fn new() -> Self {
        Self {
            version: CURRENT_VERSION.to_string(),
            active_tunnel: None,
            tunnels: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Tunnel> {
        self.tunnels.get(id)
    }

    /// Active tunnel id, only if it resolves
    pub fn active_id(&self) -> Option<&str> {
        self.active().map(|t| t.id.as_str())
    }

    /// Active tunnel, treating a dangling reference as absent
    pub fn active(&self) -> Option<&Tunnel> {
        self.active_tunnel
            .as_deref()
            .and_then(|id| self.tunnels.get(id))
    }

    /// Find a tunnel by exact id, then by unique name
    pub fn resolve(&self, id_or_name: &str) -> Result<&Tunnel, ValidationError> {
        if let Some(tunnel) = self.tunnels.get(id_or_name) {
            return Ok(tunnel);
        }

        let mut matches = self.tunnels.values().filter(|t| t.name == id_or_name);
        match (matches.next(), matches.next()) {
            (Some(tunnel), None) => Ok(tunnel),
            (Some(_), Some(_)) => Err(ValidationError::AmbiguousTunnel(id_or_name.to_string())),
            (None, _) => Err(ValidationError::TunnelNotFound(id_or_name.to_string())),
        }
    }

    /// Start tracking a tunnel
    pub fn add_tunnel(&mut self, tunnel: Tunnel) -> Result<(), ValidationError> {
        if tunnel.id.trim().is_empty() {
            return Err(ValidationError::InvalidName("tunnel id must not be empty".to_string()));
        }
        if self.tunnels.contains_key(&tunnel.id) {
            return Err(ValidationError::DuplicateTunnel(tunnel.id));
        }
        self.tunnels.insert(tunnel.id.clone(), tunnel);
        Ok(())
    }

    /// Make a known tunnel the active one
    pub fn select_tunnel(&mut self, id: &str) -> Result<(), ValidationError> {
        if !self.tunnels.contains_key(id) {
            return Err(ValidationError::TunnelNotFound(id.to_string()));
        }
        self.active_tunnel = Some(id.to_string());
        Ok(())
    }

    /// Stop tracking a tunnel, clearing the active reference if it pointed here
    pub fn remove_tunnel(&mut self, id: &str) -> Option<Tunnel> {
        let removed = self.tunnels.remove(id);
        if removed.is_some() && self.active_tunnel.as_deref() == Some(id) {
            self.active_tunnel = None;
        }
        removed
    }

    /// Append a service to a tunnel, rejecting duplicate hostnames
    pub fn add_service(&mut self, tunnel_id: &str, service: Service) -> Result<(), ValidationError> {
        let tunnel = self
            .tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| ValidationError::TunnelNotFound(tunnel_id.to_string()))?;

        if tunnel.has_hostname(&service.hostname) {
            return Err(ValidationError::DuplicateHostname {
                hostname: service.hostname,
                tunnel: tunnel.name.clone(),
            });
        }

        tunnel.services.push(service);
        Ok(())
    }

    /// Remove a service from a tunnel by hostname
    pub fn remove_service(
        &mut self,
        tunnel_id: &str,
        hostname: &str,
    ) -> Result<Service, ValidationError> {
        let tunnel = self
            .tunnels
            .get_mut(tunnel_id)
            .ok_or_else(|| ValidationError::TunnelNotFound(tunnel_id.to_string()))?;

        let index = tunnel
            .services
            .iter()
            .position(|s| s.hostname.eq_ignore_ascii_case(hostname))
            .ok_or_else(|| ValidationError::ServiceNotFound(hostname.to_string()))?;

        Ok(tunnel.services.remove(index))
    }

    /// Record that a tunnel was just run
    pub fn touch_last_used(&mut self, tunnel_id: &str) {
        if let Some(tunnel) = self.tunnels.get_mut(tunnel_id) {
            tunnel.last_used_at = Some(Utc::now());
        }
    }

    /// Drop an active reference that no longer resolves
    pub(crate) fn normalize_active(&mut self) {
        if let Some(id) = &self.active_tunnel {
            if !self.tunnels.contains_key(id) {
                tracing::warn!("Active tunnel {} is not in the registry, clearing it", id);
                self.active_tunnel = None;
            }
        }
    }
}

/// Validate and normalize a fully-qualified hostname
pub fn validate_hostname(hostname: &str) -> Result<String, ValidationError> {
    let invalid = || ValidationError::InvalidHostname(hostname.to_string());

    let name = hostname.trim().trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return Err(invalid());
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return Err(invalid());
    }

    for label in &labels {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(invalid());
        }
    }

    // Top-level domains are never purely numeric; this also rejects IPv4 literals
    if labels
        .last()
        .map(|tld| tld.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(true)
    {
        return Err(invalid());
    }

    Ok(name)
}

/// Validate a TCP port number
pub fn validate_port(port: u32) -> Result<u16, ValidationError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(ValidationError::InvalidPort(port.to_string())),
    }
}
