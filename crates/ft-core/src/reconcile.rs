//! Reconciliation between the registry and the daemon's view
//!
//! The registry is the source of truth for what the operator configured; the
//! daemon's tunnel listing and the local process table are consulted to tell
//! whether a tunnel is running and which local entries no longer exist
//! remotely. Nothing here removes state on its own.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::Path;

use crate::error::ExternalToolError;
use crate::gateway::{RemoteTunnel, TunnelGateway};
use crate::process::{command_tokens, executable_stem, ProcessLister};
use crate::registry::{Registry, Tunnel};

/// Observed state of a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Running,
    Stopped,
    Unknown,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Running => write!(f, "running"),
            TunnelStatus::Stopped => write!(f, "stopped"),
            TunnelStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Executable name that identifies the daemon in a command line
///
/// `/usr/local/bin/cloudflared` and `cloudflared.exe` both reduce to
/// `cloudflared`.
pub fn daemon_process_name(binary: &str) -> String {
    Path::new(binary)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| binary.to_string())
}

/// Interpreters a wrapper script for the daemon shows up under
const SCRIPT_HOSTS: &[&str] = &["sh", "bash", "dash", "zsh"];

/// Check for a running daemon (`<daemon> tunnel ... run`), optionally for one tunnel
///
/// The executable itself must be the daemon, so editors or `cat` on a
/// credentials file and one-shot subcommands such as `tunnel route dns` are
/// not mistaken for it.
pub fn is_daemon_run(command_line: &str, daemon_name: &str, tunnel_id: Option<&str>) -> bool {
    let tokens = command_tokens(command_line);
    let is_daemon = |token: &&str| executable_stem(token).eq_ignore_ascii_case(daemon_name);

    let exe_index = match tokens.as_slice() {
        [exe, ..] if is_daemon(exe) => 0,
        [host, script, ..] if SCRIPT_HOSTS.contains(&executable_stem(host)) && is_daemon(script) => 1,
        _ => return false,
    };
    let args = &tokens[exe_index + 1..];

    args.first() == Some(&"tunnel")
        && args.contains(&"run")
        && tunnel_id.map_or(true, |id| args.iter().any(|arg| arg.contains(id)))
}

/// PIDs of daemon processes, optionally narrowed to one tunnel id
pub fn find_daemon_processes<P: ProcessLister + ?Sized>(
    lister: &P,
    binary: &str,
    tunnel_id: Option<&str>,
) -> io::Result<Vec<u32>> {
    let name = daemon_process_name(binary);
    lister.list_processes_where(&|p| is_daemon_run(&p.command_line, &name, tunnel_id))
}

/// Compares registry state with the daemon listing and process table
pub struct Reconciler<'a, G: ?Sized, P: ?Sized> {
    gateway: &'a G,
    lister: &'a P,
}

impl<'a, G, P> Reconciler<'a, G, P>
where
    G: TunnelGateway + ?Sized,
    P: ProcessLister + ?Sized,
{
    pub fn new(gateway: &'a G, lister: &'a P) -> Self {
        Self { gateway, lister }
    }

    /// Status of one tunnel; never fails
    pub fn tunnel_status(&self, tunnel_id: &str) -> TunnelStatus {
        self.tunnel_statuses([tunnel_id])
            .remove(tunnel_id)
            .unwrap_or(TunnelStatus::Unknown)
    }

    /// Status of several tunnels using a single remote listing
    pub fn tunnel_statuses<'i, I>(&self, tunnel_ids: I) -> BTreeMap<String, TunnelStatus>
    where
        I: IntoIterator<Item = &'i str>,
    {
        let remote = self.gateway.list_remote_tunnels();
        if let Err(e) = &remote {
            tracing::warn!("Could not list remote tunnels: {}", e);
        }

        tunnel_ids
            .into_iter()
            .map(|id| (id.to_string(), self.status_from(id, remote.as_deref())))
            .collect()
    }

    fn status_from(
        &self,
        tunnel_id: &str,
        remote: Result<&[RemoteTunnel], &ExternalToolError>,
    ) -> TunnelStatus {
        let connected = match remote {
            Ok(tunnels) => tunnels
                .iter()
                .any(|t| t.id == tunnel_id && t.connection_count > 0),
            Err(_) => {
                // Without the listing only a positive process match is trusted
                return match self.process_running(tunnel_id) {
                    Ok(true) => TunnelStatus::Running,
                    _ => TunnelStatus::Unknown,
                };
            }
        };

        if connected {
            return TunnelStatus::Running;
        }

        match self.process_running(tunnel_id) {
            Ok(true) => TunnelStatus::Running,
            Ok(false) => TunnelStatus::Stopped,
            Err(e) => {
                tracing::debug!("Process scan failed: {}", e);
                TunnelStatus::Unknown
            }
        }
    }

    fn process_running(&self, tunnel_id: &str) -> io::Result<bool> {
        find_daemon_processes(self.lister, self.gateway.binary(), Some(tunnel_id))
            .map(|pids| !pids.is_empty())
    }

    /// Local tunnel ids the daemon no longer knows about
    ///
    /// A failed listing yields an error, never an empty remote set.
    pub fn clean_candidates(&self, registry: &Registry) -> Result<BTreeSet<String>, ExternalToolError> {
        let remote: BTreeSet<String> = self
            .gateway
            .list_remote_tunnels()?
            .into_iter()
            .map(|t| t.id)
            .collect();

        Ok(registry
            .tunnels
            .keys()
            .filter(|id| !remote.contains(*id))
            .cloned()
            .collect())
    }
}

/// Remove confirmed stale tunnels, returning what was removed
pub fn apply_clean(registry: &mut Registry, ids: &BTreeSet<String>) -> Vec<Tunnel> {
    ids.iter()
        .filter_map(|id| {
            let removed = registry.remove_tunnel(id);
            if removed.is_some() {
                tracing::info!("Removed stale tunnel {} from registry", id);
            }
            removed
        })
        .collect()
}
