//! Command preconditions
//!
//! Checks run in a fixed order (daemon installed, then authenticated, then a
//! tunnel selected) and stop at the first failure, before anything is mutated.

use crate::config::Paths;
use crate::error::{FtError, PreconditionError, ValidationError};
use crate::gateway::TunnelGateway;
use crate::registry::{Registry, Tunnel};

/// How much of the environment a command needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Requirement {
    None,
    Installed,
    Authenticated,
}

/// Snapshot of precondition state, for `status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentState {
    pub binary: String,
    pub version: Option<String>,
    pub authenticated: bool,
}

impl EnvironmentState {
    pub fn installed(&self) -> bool {
        self.version.is_some()
    }
}

/// Verify installation and authentication up to `requirement`
pub fn check<G: TunnelGateway + ?Sized>(
    gateway: &G,
    paths: &Paths,
    requirement: Requirement,
) -> Result<(), PreconditionError> {
    if requirement >= Requirement::Installed && !gateway.is_installed() {
        return Err(PreconditionError::NotInstalled {
            binary: gateway.binary().to_string(),
        });
    }

    if requirement >= Requirement::Authenticated {
        let marker = paths.auth_marker();
        if !marker.is_file() {
            return Err(PreconditionError::NotAuthenticated { marker });
        }
    }

    Ok(())
}

/// Report precondition state without failing
pub fn inspect<G: TunnelGateway + ?Sized>(gateway: &G, paths: &Paths) -> EnvironmentState {
    EnvironmentState {
        binary: gateway.binary().to_string(),
        version: gateway.version(),
        authenticated: paths.auth_marker().is_file(),
    }
}

/// The tunnel a service-scoped command operates on
///
/// An explicit `--tunnel` (id or name) wins over the active tunnel.
pub fn target_tunnel<'r>(registry: &'r Registry, explicit: Option<&str>) -> Result<&'r Tunnel, FtError> {
    match explicit {
        Some(id_or_name) => registry.resolve(id_or_name).map_err(|e| match e {
            ValidationError::TunnelNotFound(t) => PreconditionError::UnknownTunnel(t).into(),
            other => other.into(),
        }),
        None => registry
            .active()
            .ok_or_else(|| PreconditionError::NoTunnelSelected.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::testing::FakeGateway;
    use tempfile::TempDir;

    fn paths_in(dir: &TempDir) -> Paths {
        let settings = Settings {
            cloudflared_dir: dir.path().join(".cloudflared"),
            ..Settings::default()
        };
        Paths::new(dir.path().join("flaretun"), &settings)
    }

    fn authenticate(paths: &Paths) {
        let marker = paths.auth_marker();
        std::fs::create_dir_all(marker.parent().unwrap()).unwrap();
        std::fs::write(marker, "-----BEGIN ARGO TUNNEL TOKEN-----").unwrap();
    }

    #[test]
    fn test_not_installed_checked_first() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        let gateway = FakeGateway::default();

        assert!(matches!(
            check(&gateway, &paths, Requirement::Authenticated),
            Err(PreconditionError::NotInstalled { .. })
        ));
        assert!(check(&gateway, &paths, Requirement::None).is_ok());
    }

    #[test]
    fn test_missing_marker_is_not_authenticated() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);
        let gateway = FakeGateway::with_remote(vec![]);

        assert!(check(&gateway, &paths, Requirement::Installed).is_ok());
        match check(&gateway, &paths, Requirement::Authenticated) {
            Err(PreconditionError::NotAuthenticated { marker }) => {
                assert_eq!(marker, paths.auth_marker())
            }
            other => panic!("unexpected result: {:?}", other),
        }

        authenticate(&paths);
        assert!(check(&gateway, &paths, Requirement::Authenticated).is_ok());
    }

    #[test]
    fn test_inspect_reports_state() {
        let dir = TempDir::new().unwrap();
        let paths = paths_in(&dir);

        let state = inspect(&FakeGateway::default(), &paths);
        assert!(!state.installed());
        assert!(!state.authenticated);

        authenticate(&paths);
        let state = inspect(&FakeGateway::with_remote(vec![]), &paths);
        assert!(state.installed());
        assert!(state.authenticated);
    }

    #[test]
    fn test_target_tunnel() {
        let mut registry = Registry::new();
        assert!(matches!(
            target_tunnel(&registry, None),
            Err(FtError::Precondition(PreconditionError::NoTunnelSelected))
        ));

        registry.add_tunnel(Tunnel::new("abc", "dev")).unwrap();
        registry.add_tunnel(Tunnel::new("def", "ops")).unwrap();
        registry.select_tunnel("abc").unwrap();

        assert_eq!(target_tunnel(&registry, None).unwrap().id, "abc");
        assert_eq!(target_tunnel(&registry, Some("ops")).unwrap().id, "def");
        assert!(matches!(
            target_tunnel(&registry, Some("nope")),
            Err(FtError::Precondition(PreconditionError::UnknownTunnel(_)))
        ));
    }
}
