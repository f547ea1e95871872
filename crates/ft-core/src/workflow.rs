//! Multi-step operations behind the commands
//!
//! Each workflow mutates the in-memory registry and leaves saving to the
//! caller, except [`add_service`]: its DNS step must only run once the new
//! service is on disk, so it saves in the middle.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use crate::config::{Paths, AUTH_MARKER_FILE_NAME};
use crate::daemon_config::DaemonConfig;
use crate::error::{ConfigError, FtError, PartialSuccessWarning, ValidationError};
use crate::gateway::TunnelGateway;
use crate::health::health_check_with_timeout;
use crate::migrate::migrate;
use crate::process::{is_process_alive, terminate_process, ProcessLister};
use crate::reconcile::find_daemon_processes;
use crate::registry::{validate_hostname, Protocol, Registry, Service, Tunnel};
use crate::store::ConfigStore;

/// Longest tunnel name accepted locally
const MAX_TUNNEL_NAME_LEN: usize = 64;

/// `<hostname>-tunnel`, lowercased with anything unusual replaced by `-`
pub fn default_tunnel_name() -> String {
    let host = gethostname::gethostname().to_string_lossy().to_ascii_lowercase();
    let host: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    let host = host.trim_matches('-');
    if host.is_empty() {
        "flaretun-tunnel".to_string()
    } else {
        format!("{}-tunnel", host)
    }
}

/// Check a tunnel name before handing it to the daemon
pub fn validate_tunnel_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    let valid = !name.is_empty()
        && name.len() <= MAX_TUNNEL_NAME_LEN
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(name.to_string())
    } else {
        Err(ValidationError::InvalidName(name.to_string()))
    }
}

/// Create a tunnel through the daemon, track it and make it active
pub fn create_tunnel<G: TunnelGateway + ?Sized>(
    registry: &mut Registry,
    gateway: &G,
    name: &str,
) -> Result<Tunnel, FtError> {
    let name = validate_tunnel_name(name)?;
    let id = gateway.create_tunnel(&name)?;

    let tunnel = Tunnel::new(id.clone(), name);
    registry.add_tunnel(tunnel.clone())?;
    registry.select_tunnel(&id)?;
    Ok(tunnel)
}

/// Track a tunnel that already exists remotely and make it active
///
/// Returns the tunnel and whether it was newly added to the registry.
pub fn adopt_tunnel<G: TunnelGateway + ?Sized>(
    registry: &mut Registry,
    gateway: &G,
    id_or_name: &str,
) -> Result<(Tunnel, bool), FtError> {
    let remote = gateway.list_remote_tunnels()?;
    let found = remote
        .iter()
        .find(|t| t.id == id_or_name)
        .or_else(|| remote.iter().find(|t| t.name == id_or_name))
        .ok_or_else(|| ValidationError::TunnelNotFound(id_or_name.to_string()))?;

    if let Some(existing) = registry.get(&found.id).cloned() {
        registry.select_tunnel(&existing.id)?;
        return Ok((existing, false));
    }

    let tunnel = Tunnel::new(found.id.clone(), found.name.clone());
    registry.add_tunnel(tunnel.clone())?;
    registry.select_tunnel(&tunnel.id)?;
    tracing::info!("Adopted existing tunnel {} ({})", tunnel.name, tunnel.id);
    Ok((tunnel, true))
}

/// Input for [`add_service`]
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub hostname: String,
    pub port: u32,
    pub protocol: Protocol,
    /// Ask the daemon to route DNS after saving
    pub route_dns: bool,
}

/// Outcome of a successful [`add_service`]
#[derive(Debug)]
pub struct AddServiceReport {
    pub service: Service,
    /// Whether the local port accepted a connection before registration
    pub reachable: bool,
    pub dns_routed: bool,
    pub warnings: Vec<PartialSuccessWarning>,
}

/// Register a service on a tunnel: validate, check the port, add, save, route DNS
///
/// The port check is advisory. A DNS failure after the save becomes a warning
/// and the service stays registered.
pub async fn add_service<G: TunnelGateway + ?Sized>(
    registry: &mut Registry,
    store: &ConfigStore,
    gateway: &G,
    tunnel_id: &str,
    request: &ServiceRequest,
    health_timeout: Duration,
) -> Result<AddServiceReport, FtError> {
    let service = Service::new(&request.hostname, request.protocol, request.port)?;

    let tunnel = registry
        .get(tunnel_id)
        .ok_or_else(|| ValidationError::TunnelNotFound(tunnel_id.to_string()))?;
    if tunnel.has_hostname(&service.hostname) {
        return Err(ValidationError::DuplicateHostname {
            hostname: service.hostname,
            tunnel: tunnel.name.clone(),
        }
        .into());
    }

    let reachable = health_check_with_timeout(service.port, health_timeout).await;
    if !reachable {
        tracing::warn!("Nothing is listening on localhost:{} yet", service.port);
    }

    registry.add_service(tunnel_id, service.clone())?;
    store.save(registry)?;
    tracing::info!("Added {} -> {} to tunnel {}", service.hostname, service.target_url, tunnel_id);

    let mut warnings = Vec::new();
    let mut dns_routed = false;
    if request.route_dns {
        match gateway.create_dns_route(tunnel_id, &service.hostname) {
            Ok(()) => dns_routed = true,
            Err(e) => {
                tracing::warn!("DNS route for {} failed: {}", service.hostname, e);
                warnings.push(PartialSuccessWarning::from_tool_error(
                    "Service saved but DNS route not created",
                    &e,
                ));
            }
        }
    }

    Ok(AddServiceReport {
        service,
        reachable,
        dns_routed,
        warnings,
    })
}

/// Write the daemon config for a tunnel and mark it as used
pub fn prepare_run(registry: &mut Registry, paths: &Paths, tunnel_id: &str) -> Result<PathBuf, FtError> {
    let tunnel = registry
        .get(tunnel_id)
        .ok_or_else(|| ValidationError::TunnelNotFound(tunnel_id.to_string()))?;

    let credentials = paths.credentials_file(tunnel_id);
    if !credentials.is_file() {
        tracing::warn!(
            "Credentials file {:?} not found; the daemon may refuse to start",
            credentials
        );
    }

    let config = DaemonConfig::for_tunnel(tunnel, credentials)?;
    let path = paths.daemon_config_file(tunnel_id);
    config.write_to(&path)?;

    registry.touch_last_used(tunnel_id);
    Ok(path)
}

/// Move the origin certificate aside so a forced login can write a new one
///
/// Returns the backup path, or `None` when there was no certificate.
pub fn set_aside_auth_marker(paths: &Paths) -> io::Result<Option<PathBuf>> {
    let marker = paths.auth_marker();
    if !marker.is_file() {
        return Ok(None);
    }

    let backup = marker.with_file_name(format!(
        "{}.bak-{}",
        AUTH_MARKER_FILE_NAME,
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    ));
    std::fs::rename(&marker, &backup)?;
    tracing::info!("Moved {:?} to {:?}", marker, backup);
    Ok(Some(backup))
}

/// Put a set-aside certificate back unless a new one was written meanwhile
///
/// Returns whether the backup was restored.
pub fn restore_auth_marker(paths: &Paths, backup: &Path) -> io::Result<bool> {
    let marker = paths.auth_marker();
    if marker.exists() {
        return Ok(false);
    }
    std::fs::rename(backup, &marker)?;
    tracing::info!("Restored {:?} from {:?}", marker, backup);
    Ok(true)
}

/// Result of [`stop_daemons`]
#[derive(Debug, Default)]
pub struct StopReport {
    pub stopped: Vec<u32>,
    pub failed: Vec<(u32, io::Error)>,
}

/// Terminate daemon processes for one tunnel, or all of them
pub fn stop_daemons<P: ProcessLister + ?Sized>(
    lister: &P,
    binary: &str,
    tunnel_id: Option<&str>,
) -> io::Result<StopReport> {
    let mut report = StopReport::default();

    for pid in find_daemon_processes(lister, binary, tunnel_id)? {
        match terminate_process(pid) {
            Ok(()) => {
                tracing::info!("Sent termination to daemon process {}", pid);
                report.stopped.push(pid);
            }
            // Exited between the scan and the signal
            Err(_) if !is_process_alive(pid) => report.stopped.push(pid),
            Err(e) => {
                tracing::warn!("Failed to stop process {}: {}", pid, e);
                report.failed.push((pid, e));
            }
        }
    }

    Ok(report)
}

/// Registry fragment holding a single tunnel, active
pub fn export_fragment(registry: &Registry, tunnel_id: &str) -> Result<Registry, ValidationError> {
    let tunnel = registry
        .get(tunnel_id)
        .ok_or_else(|| ValidationError::TunnelNotFound(tunnel_id.to_string()))?
        .clone();

    let mut fragment = Registry::new();
    fragment.add_tunnel(tunnel)?;
    fragment.select_tunnel(tunnel_id)?;
    Ok(fragment)
}

/// What an import changed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub added_tunnels: Vec<String>,
    pub added_services: usize,
    /// `<tunnel id>/<hostname>` of services already present or invalid
    pub skipped_services: Vec<String>,
    pub activated: Option<String>,
}

impl ImportReport {
    pub fn changed(&self) -> bool {
        !self.added_tunnels.is_empty() || self.added_services > 0 || self.activated.is_some()
    }
}

/// Parse an exported fragment, full registry or legacy document and merge it
pub fn import_document(registry: &mut Registry, content: &str) -> Result<ImportReport, ConfigError> {
    let raw: serde_json::Value = serde_json::from_str(content)?;
    let incoming = migrate(raw)?;
    Ok(merge_registry(registry, incoming))
}

/// Merge another registry into this one without overwriting anything
///
/// Unknown tunnels are added whole; services of known tunnels are added by
/// hostname. The incoming active tunnel is adopted only when none is set.
pub fn merge_registry(registry: &mut Registry, incoming: Registry) -> ImportReport {
    let mut report = ImportReport::default();
    let incoming_active = incoming.active_tunnel.clone();

    for (id, mut tunnel) in incoming.tunnels {
        let services = std::mem::take(&mut tunnel.services);

        if registry.get(&id).is_none() {
            if registry.add_tunnel(tunnel).is_err() {
                continue;
            }
            report.added_tunnels.push(id.clone());
        }

        for mut service in services {
            let skipped = format!("{}/{}", id, service.hostname);
            match validate_hostname(&service.hostname) {
                Ok(hostname) => service.hostname = hostname,
                Err(_) => {
                    report.skipped_services.push(skipped);
                    continue;
                }
            }
            match registry.add_service(&id, service) {
                Ok(()) => report.added_services += 1,
                Err(_) => report.skipped_services.push(skipped),
            }
        }
    }

    if registry.active().is_none() {
        if let Some(active) = incoming_active.filter(|id| registry.get(id).is_some()) {
            registry.active_tunnel = Some(active.clone());
            report.activated = Some(active);
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::testing::{remote, FakeGateway, FakeLister};
    use tempfile::TempDir;

    const ID: &str = "6ff42ae2-765d-4adf-8112-31c55c1551ef";

    fn registry_with_active() -> Registry {
        let mut registry = Registry::new();
        registry.add_tunnel(Tunnel::new(ID, "dev")).unwrap();
        registry.select_tunnel(ID).unwrap();
        registry
    }

    fn request(hostname: &str, port: u32) -> ServiceRequest {
        ServiceRequest {
            hostname: hostname.to_string(),
            port,
            protocol: Protocol::Http,
            route_dns: true,
        }
    }

    #[test]
    fn test_validate_tunnel_name() {
        assert_eq!(validate_tunnel_name(" dev-box_1 ").unwrap(), "dev-box_1");
        assert!(validate_tunnel_name("").is_err());
        assert!(validate_tunnel_name("-dev").is_err());
        assert!(validate_tunnel_name("my tunnel").is_err());
        assert!(validate_tunnel_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_default_tunnel_name_is_valid() {
        let name = default_tunnel_name();
        assert!(name.ends_with("-tunnel"));
        assert!(validate_tunnel_name(&name).is_ok());
    }

    #[test]
    fn test_create_tunnel_becomes_active() {
        let mut registry = Registry::new();
        let gateway = FakeGateway {
            created_id: Some(ID.to_string()),
            ..FakeGateway::with_remote(vec![])
        };

        let tunnel = create_tunnel(&mut registry, &gateway, "dev").unwrap();
        assert_eq!(tunnel.id, ID);
        assert_eq!(registry.active_id(), Some(ID));
        assert_eq!(*gateway.created.borrow(), ["dev"]);
    }

    #[test]
    fn test_create_tunnel_without_id_leaves_registry_untouched() {
        let mut registry = Registry::new();
        let gateway = FakeGateway::with_remote(vec![]);

        let err = create_tunnel(&mut registry, &gateway, "dev").unwrap_err();
        assert!(matches!(err, FtError::CreationParse(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_name_never_reaches_daemon() {
        let mut registry = Registry::new();
        let gateway = FakeGateway::with_remote(vec![]);

        assert!(create_tunnel(&mut registry, &gateway, "bad name").is_err());
        assert!(gateway.created.borrow().is_empty());
    }

    #[test]
    fn test_adopt_tunnel_by_name() {
        let mut registry = Registry::new();
        let gateway = FakeGateway::with_remote(vec![remote(ID, "dev", 1)]);

        let (tunnel, added) = adopt_tunnel(&mut registry, &gateway, "dev").unwrap();
        assert!(added);
        assert_eq!(tunnel.id, ID);
        assert_eq!(registry.active_id(), Some(ID));

        let (_, added) = adopt_tunnel(&mut registry, &gateway, ID).unwrap();
        assert!(!added);
        assert_eq!(registry.tunnels.len(), 1);

        assert!(matches!(
            adopt_tunnel(&mut registry, &gateway, "missing"),
            Err(FtError::Validation(ValidationError::TunnelNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_add_service_saves_then_routes_dns() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let mut registry = registry_with_active();
        let gateway = FakeGateway::with_remote(vec![]);

        let report = add_service(
            &mut registry,
            &store,
            &gateway,
            ID,
            &request("App.Example.com", 3000),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert_eq!(report.service.hostname, "app.example.com");
        assert!(report.dns_routed);
        assert!(report.warnings.is_empty());
        assert_eq!(
            *gateway.routes.borrow(),
            [(ID.to_string(), "app.example.com".to_string())]
        );
        assert_eq!(store.load(), registry);
    }

    #[tokio::test]
    async fn test_dns_conflict_keeps_local_service() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let mut registry = registry_with_active();
        let gateway = FakeGateway {
            dns_conflict: true,
            ..FakeGateway::with_remote(vec![])
        };

        let report = add_service(
            &mut registry,
            &store,
            &gateway,
            ID,
            &request("app.example.com", 3000),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

        assert!(!report.dns_routed);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].hint.is_some());
        assert_eq!(store.load().get(ID).unwrap().services.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_service_is_not_saved() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let mut registry = registry_with_active();
        let gateway = FakeGateway::with_remote(vec![]);
        let timeout = Duration::from_millis(100);

        add_service(&mut registry, &store, &gateway, ID, &request("a.example.com", 3000), timeout)
            .await
            .unwrap();

        let err = add_service(&mut registry, &store, &gateway, ID, &request("A.example.com", 4000), timeout)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FtError::Validation(ValidationError::DuplicateHostname { .. })
        ));

        let err = add_service(&mut registry, &store, &gateway, ID, &request("b.example.com", 0), timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, FtError::Validation(ValidationError::InvalidPort(_))));

        assert_eq!(store.load().get(ID).unwrap().services.len(), 1);
        assert_eq!(gateway.routes.borrow().len(), 1);
    }

    #[test]
    fn test_prepare_run_writes_config_and_touches() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            cloudflared_dir: dir.path().join(".cloudflared"),
            ..Settings::default()
        };
        let paths = Paths::new(dir.path().join("flaretun"), &settings);
        let mut registry = registry_with_active();

        assert!(matches!(
            prepare_run(&mut registry, &paths, ID),
            Err(FtError::Validation(ValidationError::NoServices(_)))
        ));

        registry
            .add_service(ID, Service::new("a.example.com", Protocol::Http, 3000).unwrap())
            .unwrap();
        let path = prepare_run(&mut registry, &paths, ID).unwrap();

        assert_eq!(path, paths.daemon_config_file(ID));
        let written: DaemonConfig =
            serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.tunnel, ID);
        assert_eq!(written.credentials_file, paths.credentials_file(ID));
        assert!(registry.get(ID).unwrap().last_used_at.is_some());
    }

    #[test]
    fn test_stop_daemons_ignores_vanished_processes() {
        let lister = FakeLister::running(&[
            "cloudflared tunnel --config /cfg/tunnels/abc.yml run",
            "cloudflared tunnel --config /cfg/tunnels/def.yml run",
        ]);

        let report = stop_daemons(&lister, "cloudflared", Some("abc")).unwrap();
        assert_eq!(report.stopped.len(), 1);
        assert!(report.failed.is_empty());

        let report = stop_daemons(&lister, "cloudflared", None).unwrap();
        assert_eq!(report.stopped.len(), 2);

        assert!(stop_daemons(&FakeLister(None), "cloudflared", None).is_err());
    }

    #[test]
    fn test_stop_daemons_leaves_unrelated_processes() {
        let lister = FakeLister::running(&[
            "vim /home/u/.cloudflared/abc.json",
            "cloudflared tunnel route dns abc a.example.com",
        ]);

        let report = stop_daemons(&lister, "cloudflared", Some("abc")).unwrap();
        assert!(report.stopped.is_empty());
        assert!(report.failed.is_empty());
    }

    #[test]
    fn test_auth_marker_set_aside_and_restored() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            cloudflared_dir: dir.path().join(".cloudflared"),
            ..Settings::default()
        };
        let paths = Paths::new(dir.path().join("flaretun"), &settings);
        let marker = paths.auth_marker();

        assert!(set_aside_auth_marker(&paths).unwrap().is_none());

        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(&marker, "old").unwrap();
        let backup = set_aside_auth_marker(&paths).unwrap().unwrap();
        assert!(!marker.exists());
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("cert.pem.bak-"));

        // Failed login: nothing new, the old certificate comes back
        assert!(restore_auth_marker(&paths, &backup).unwrap());
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "old");

        // Successful login: the new certificate wins, the backup stays
        let backup = set_aside_auth_marker(&paths).unwrap().unwrap();
        std::fs::write(&marker, "new").unwrap();
        assert!(!restore_auth_marker(&paths, &backup).unwrap());
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "new");
        assert!(backup.exists());
    }

    #[test]
    fn test_export_then_import_into_empty_registry() {
        let mut source = registry_with_active();
        source
            .add_service(ID, Service::new("a.example.com", Protocol::Http, 3000).unwrap())
            .unwrap();
        source.add_tunnel(Tunnel::new("other", "ops")).unwrap();

        let fragment = export_fragment(&source, ID).unwrap();
        assert_eq!(fragment.tunnels.len(), 1);
        assert_eq!(fragment.active_id(), Some(ID));

        let mut target = Registry::new();
        let report =
            import_document(&mut target, &serde_json::to_string(&fragment).unwrap()).unwrap();

        assert_eq!(report.added_tunnels, [ID]);
        assert_eq!(report.added_services, 1);
        assert_eq!(report.activated.as_deref(), Some(ID));
        assert_eq!(target, fragment);
    }

    #[test]
    fn test_import_merges_services_by_hostname() {
        let mut registry = Registry::new();
        registry.add_tunnel(Tunnel::new("abc", "dev")).unwrap();
        registry.add_tunnel(Tunnel::new("zzz", "mine")).unwrap();
        registry.select_tunnel("zzz").unwrap();
        registry
            .add_service("abc", Service::new("a.example.com", Protocol::Http, 3000).unwrap())
            .unwrap();

        let legacy = r#"{
            "tunnelName": "dev",
            "tunnelId": "abc",
            "services": [
                {"hostname": "a.example.com", "service": "http://localhost:9999"},
                {"hostname": "b.example.com", "service": "https://localhost:8443"}
            ]
        }"#;

        let report = import_document(&mut registry, legacy).unwrap();
        assert!(report.added_tunnels.is_empty());
        assert_eq!(report.added_services, 1);
        assert_eq!(report.skipped_services, ["abc/a.example.com"]);
        assert!(report.activated.is_none());
        assert_eq!(registry.active_id(), Some("zzz"));

        let services = &registry.get("abc").unwrap().services;
        assert_eq!(services[0].port, 3000);
        assert_eq!(services[1].hostname, "b.example.com");
    }

    #[test]
    fn test_import_rejects_garbage() {
        let mut registry = Registry::new();
        assert!(matches!(
            import_document(&mut registry, "not json"),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            import_document(&mut registry, "[1]"),
            Err(ConfigError::Registry(_))
        ));
        assert!(!ImportReport::default().changed());
    }
}
