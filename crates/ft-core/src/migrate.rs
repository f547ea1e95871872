//! Registry schema migration
//!
//! Lifts raw JSON documents into the current [`Registry`] shape. Two input
//! shapes are understood:
//!
//! - legacy single-tunnel documents: `{tunnelName, tunnelId, services}` at
//!   the root and no `tunnels` map
//! - multi-tunnel documents: `{version, activeTunnel?, tunnels: {...}}`
//!
//! Migration is idempotent. Feeding a migrated registry back through
//! [`migrate`] yields the same registry.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::MigrationError;
use crate::registry::{local_target_url, validate_hostname, Protocol, Registry, CURRENT_VERSION};

/// Lift a raw registry document into the current schema
pub fn migrate(raw: Value) -> Result<Registry, MigrationError> {
    let Value::Object(root) = raw else {
        return Err(MigrationError::NotAnObject);
    };

    let mut doc = if is_legacy(&root) {
        tracing::info!("Migrating legacy single-tunnel config to schema {}", CURRENT_VERSION);
        lift_legacy(root)
    } else {
        root
    };

    backfill_document(&mut doc);

    let mut registry: Registry = serde_json::from_value(Value::Object(doc))?;
    if registry.version != CURRENT_VERSION {
        tracing::info!(
            "Normalizing registry version {} to {}",
            registry.version,
            CURRENT_VERSION
        );
        registry.version = CURRENT_VERSION.to_string();
    }
    registry.normalize_active();

    Ok(registry)
}

/// Check for the pre-2.0 single-tunnel shape
pub fn is_legacy(root: &Map<String, Value>) -> bool {
    !root.contains_key("tunnels")
        && ["tunnelId", "tunnelName", "services"]
            .iter()
            .any(|key| root.contains_key(*key))
}

fn lift_legacy(mut root: Map<String, Value>) -> Map<String, Value> {
    let mut doc = Map::new();
    doc.insert("version".into(), Value::from(CURRENT_VERSION));

    let id = match root.get("tunnelId").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => {
            tracing::warn!("Legacy config has no tunnel id, starting with an empty registry");
            doc.insert("tunnels".into(), Value::Object(Map::new()));
            return doc;
        }
    };

    let mut tunnel = Map::new();
    tunnel.insert("tunnelId".into(), Value::from(id.clone()));
    tunnel.insert(
        "tunnelName".into(),
        root.remove("tunnelName").unwrap_or_else(|| Value::from(id.clone())),
    );
    tunnel.insert(
        "services".into(),
        root.remove("services").unwrap_or_else(|| Value::Array(Vec::new())),
    );
    for key in ["createdAt", "lastUsed"] {
        if let Some(value) = root.remove(key) {
            tunnel.insert(key.into(), value);
        }
    }

    let mut tunnels = Map::new();
    tunnels.insert(id.clone(), Value::Object(tunnel));

    doc.insert("activeTunnel".into(), Value::from(id));
    doc.insert("tunnels".into(), Value::Object(tunnels));
    doc
}

fn backfill_document(doc: &mut Map<String, Value>) {
    doc.entry("version")
        .or_insert_with(|| Value::from(CURRENT_VERSION));

    if doc.get("activeTunnel").map(Value::is_null).unwrap_or(false) {
        doc.remove("activeTunnel");
    }

    let Some(Value::Object(tunnels)) = doc.get_mut("tunnels") else {
        return;
    };

    for (key, tunnel) in tunnels.iter_mut() {
        if let Value::Object(tunnel) = tunnel {
            backfill_tunnel(key, tunnel);
        }
    }
}

fn backfill_tunnel(key: &str, tunnel: &mut Map<String, Value>) {
    match tunnel.get("tunnelId").and_then(Value::as_str) {
        Some(id) if id == key => {}
        Some(id) => {
            tracing::warn!("Tunnel entry {} carries id {}, keeping the map key", key, id);
            tunnel.insert("tunnelId".into(), Value::from(key));
        }
        None => {
            tunnel.insert("tunnelId".into(), Value::from(key));
        }
    }

    tunnel
        .entry("tunnelName")
        .or_insert_with(|| Value::from(key));
    tunnel
        .entry("createdAt")
        .or_insert_with(|| Value::from(Utc::now().to_rfc3339()));

    if tunnel.get("lastUsed").map(Value::is_null).unwrap_or(false) {
        tunnel.remove("lastUsed");
    }

    if let Some(Value::Array(services)) = tunnel.get_mut("services") {
        let mut seen = HashSet::new();
        services.retain_mut(|service| match service {
            Value::Object(service) => {
                if !backfill_service(key, service) {
                    return false;
                }
                let hostname = service
                    .get("hostname")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if !seen.insert(hostname.clone()) {
                    tracing::warn!("Dropping duplicate service '{}' in tunnel {}", hostname, key);
                    return false;
                }
                true
            }
            _ => {
                tracing::warn!("Dropping non-object service entry in tunnel {}", key);
                false
            }
        });
    }
}

/// Normalize the hostname and fill `protocol`, `port` and `createdAt` on a service record.
///
/// Returns false when the record has no valid hostname or cannot describe a
/// local origin, and should be dropped.
fn backfill_service(tunnel_key: &str, service: &mut Map<String, Value>) -> bool {
    let raw_hostname = service
        .get("hostname")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let hostname = match validate_hostname(&raw_hostname) {
        Ok(hostname) => hostname,
        Err(_) => {
            tracing::warn!(
                "Dropping service with invalid hostname '{}' in tunnel {}",
                raw_hostname,
                tunnel_key
            );
            return false;
        }
    };

    let target = service
        .get("service")
        .and_then(Value::as_str)
        .and_then(parse_origin_url);
    let protocol = service
        .get("protocol")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<Protocol>().ok());
    let port = service
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
        .filter(|p| *p != 0);

    let (protocol, port) = match (target, protocol, port) {
        (Some((url_protocol, url_port)), protocol, port) => {
            (protocol.unwrap_or(url_protocol), port.unwrap_or(url_port))
        }
        (None, Some(protocol), Some(port)) => {
            service.insert("service".into(), Value::from(local_target_url(protocol, port)));
            (protocol, port)
        }
        _ => {
            tracing::warn!(
                "Dropping service '{}' in tunnel {}: no usable origin URL",
                hostname,
                tunnel_key
            );
            return false;
        }
    };

    service.insert("hostname".into(), Value::from(hostname));
    service.insert("protocol".into(), Value::from(protocol.to_string()));
    service.insert("port".into(), Value::from(port));
    service
        .entry("createdAt")
        .or_insert_with(|| Value::from(Utc::now().to_rfc3339()));
    if service.get("updatedAt").map(Value::is_null).unwrap_or(false) {
        service.remove("updatedAt");
    }

    true
}

/// Extract scheme and port from an origin URL such as `http://localhost:3000`
pub fn parse_origin_url(url: &str) -> Option<(Protocol, u16)> {
    let (scheme, rest) = url.split_once("://")?;
    let protocol: Protocol = scheme.parse().ok()?;

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if authority.is_empty() {
        return None;
    }

    // Bracketed IPv6 hosts carry colons of their own
    let port_part = match authority.rfind(']') {
        Some(end) => authority[end + 1..].strip_prefix(':'),
        None => authority.rsplit_once(':').map(|(_, port)| port),
    };

    match port_part {
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .map(|p| (protocol, p)),
        None => Some((protocol, protocol.default_port())),
    }
}
