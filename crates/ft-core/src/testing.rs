//! In-memory gateway and process table for unit tests

use std::cell::RefCell;
use std::io;

use crate::error::{CreationParseError, ExternalToolError, FtError};
use crate::gateway::{RemoteTunnel, TunnelGateway};
use crate::process::{ProcessEntry, ProcessLister};

/// Scripted daemon: listing, creation and DNS results are fixed up front
#[derive(Debug, Default)]
pub struct FakeGateway {
    pub installed: bool,
    /// `None` makes the listing fail
    pub remote: Option<Vec<RemoteTunnel>>,
    /// Id returned by `create_tunnel`; `None` simulates unparsable output
    pub created_id: Option<String>,
    pub dns_conflict: bool,
    pub created: RefCell<Vec<String>>,
    pub routes: RefCell<Vec<(String, String)>>,
}

impl FakeGateway {
    pub fn with_remote(remote: Vec<RemoteTunnel>) -> Self {
        Self {
            installed: true,
            remote: Some(remote),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            installed: true,
            ..Self::default()
        }
    }
}

pub fn remote(id: &str, name: &str, connection_count: usize) -> RemoteTunnel {
    RemoteTunnel {
        id: id.to_string(),
        name: name.to_string(),
        connection_count,
    }
}

impl TunnelGateway for FakeGateway {
    fn binary(&self) -> &str {
        "/usr/local/bin/cloudflared"
    }

    fn is_installed(&self) -> bool {
        self.installed
    }

    fn version(&self) -> Option<String> {
        self.installed
            .then(|| "cloudflared version 2024.2.1".to_string())
    }

    fn list_remote_tunnels(&self) -> Result<Vec<RemoteTunnel>, ExternalToolError> {
        self.remote.clone().ok_or_else(|| ExternalToolError::Failed {
            subcommand: "tunnel list".to_string(),
            code: Some(1),
            stderr: "failed to reach the API".to_string(),
        })
    }

    fn create_tunnel(&self, name: &str) -> Result<String, FtError> {
        self.created.borrow_mut().push(name.to_string());
        match &self.created_id {
            Some(id) => Ok(id.clone()),
            None => Err(CreationParseError {
                output: format!("Created tunnel {}", name),
            }
            .into()),
        }
    }

    fn create_dns_route(&self, tunnel_id: &str, hostname: &str) -> Result<(), ExternalToolError> {
        if self.dns_conflict {
            return Err(ExternalToolError::DnsRecordExists {
                hostname: hostname.to_string(),
            });
        }
        self.routes
            .borrow_mut()
            .push((tunnel_id.to_string(), hostname.to_string()));
        Ok(())
    }
}

/// Fixed process table; `None` makes enumeration fail
#[derive(Debug, Default)]
pub struct FakeLister(pub Option<Vec<ProcessEntry>>);

impl FakeLister {
    pub fn running(command_lines: &[&str]) -> Self {
        Self(Some(
            command_lines
                .iter()
                .enumerate()
                .map(|(i, cmd)| ProcessEntry {
                    // above any real pid_max so the current process never collides
                    pid: 4_194_400 + i as u32,
                    command_line: cmd.to_string(),
                })
                .collect(),
        ))
    }
}

impl ProcessLister for FakeLister {
    fn list_processes(&self) -> io::Result<Vec<ProcessEntry>> {
        self.0
            .clone()
            .ok_or_else(|| io::Error::other("process table unavailable"))
    }
}
