//! cloudflared integration for flaretun
//!
//! [`TunnelGateway`] is the only seam through which the daemon binary is
//! invoked. [`Cloudflared`] implements it with `std::process::Command`; the
//! output parsers are plain functions so they can be exercised against
//! captured fixtures.

use serde::Deserialize;
use std::io;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

use crate::error::{CreationParseError, ExternalToolError, FtError};
use crate::process::terminate_process;

/// Time an interrupted daemon gets to exit before it is killed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A tunnel as reported by the daemon's listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTunnel {
    pub id: String,
    pub name: String,
    /// Number of active edge connections
    pub connection_count: usize,
}

/// How a foreground daemon run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The daemon exited on its own
    Exited(Option<i32>),
    /// The operator interrupted the run; not a failure
    Interrupted,
}

/// A daemon started in the background and no longer supervised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Operations flaretun needs from the tunneling daemon
pub trait TunnelGateway {
    /// Binary name or path, for diagnostics
    fn binary(&self) -> &str;

    /// Whether the binary can be run at all; never fails
    fn is_installed(&self) -> bool;

    /// Version line reported by the binary
    fn version(&self) -> Option<String>;

    /// All tunnels known to the account
    fn list_remote_tunnels(&self) -> Result<Vec<RemoteTunnel>, ExternalToolError>;

    /// Create a tunnel and return its daemon-assigned id
    fn create_tunnel(&self, name: &str) -> Result<String, FtError>;

    /// Point a hostname at a tunnel
    fn create_dns_route(&self, tunnel_id: &str, hostname: &str) -> Result<(), ExternalToolError>;
}

/// Status response entry from `cloudflared tunnel list --output json`
#[derive(Debug, Deserialize)]
struct TunnelListEntry {
    id: String,
    name: String,
    #[serde(default, deserialize_with = "deserialize_null_as_empty_vec")]
    connections: Vec<serde_json::Value>,
}

/// Deserialize null as an empty Vec
fn deserialize_null_as_empty_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(|opt| opt.unwrap_or_default())
}

/// Parse the JSON tunnel listing
///
/// An empty array (or `null`) means zero tunnels; anything else that is not a
/// list of tunnel objects is an error.
pub fn parse_tunnel_list(stdout: &[u8]) -> Result<Vec<RemoteTunnel>, ExternalToolError> {
    let unparsable = |detail: String| ExternalToolError::UnparsableOutput {
        subcommand: "tunnel list".to_string(),
        detail,
    };

    let text = std::str::from_utf8(stdout).map_err(|e| unparsable(e.to_string()))?;
    if text.trim().is_empty() {
        return Err(unparsable("empty output".to_string()));
    }

    let entries: Option<Vec<TunnelListEntry>> =
        serde_json::from_str(text).map_err(|e| unparsable(e.to_string()))?;

    Ok(entries
        .unwrap_or_default()
        .into_iter()
        .map(|entry| RemoteTunnel {
            id: entry.id,
            name: entry.name,
            connection_count: entry.connections.len(),
        })
        .collect())
}

/// Extract the new tunnel id from `cloudflared tunnel create` output
///
/// The success message reads `Created tunnel <name> with id <uuid>`. When
/// that line is missing, a single UUID-shaped token anywhere in the output is
/// accepted; zero or several candidates are a [`CreationParseError`].
pub fn parse_created_tunnel_id(output: &str) -> Result<String, CreationParseError> {
    for line in output.lines() {
        if let Some((_, after)) = line.split_once("with id ") {
            if let Some(id) = after.split_whitespace().next().and_then(as_uuid_token) {
                return Ok(id);
            }
        }
    }

    let mut candidates: Vec<String> = output.split_whitespace().filter_map(as_uuid_token).collect();
    candidates.sort();
    candidates.dedup();

    match candidates.as_slice() {
        [id] => Ok(id.clone()),
        _ => Err(CreationParseError {
            output: output.to_string(),
        }),
    }
}

/// Return the token without surrounding punctuation if it is a UUID
fn as_uuid_token(token: &str) -> Option<String> {
    let trimmed = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '-');
    // Credential paths end in `<uuid>.json`
    let trimmed = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix(".json").unwrap_or(trimmed);

    uuid::Uuid::parse_str(trimmed)
        .ok()
        .filter(|_| trimmed.len() == 36)
        .map(|_| trimmed.to_string())
}

/// Map a failed invocation to a structured error using exit code and stderr
pub fn classify_failure(subcommand: &str, code: Option<i32>, stderr: &str) -> ExternalToolError {
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("cert.pem")
        || lower.contains("origin certificate")
        || lower.contains("origincert")
    {
        return ExternalToolError::NotAuthenticated {
            subcommand: subcommand.to_string(),
            stderr: stderr.trim().to_string(),
        };
    }

    ExternalToolError::Failed {
        subcommand: subcommand.to_string(),
        code,
        stderr: stderr.trim().to_string(),
    }
}

/// Check for the DNS conflict reported by `tunnel route dns`
fn is_dns_conflict(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("already exists") || lower.contains("code: 1003")
}

/// Production gateway backed by the `cloudflared` binary
#[derive(Debug, Clone)]
pub struct Cloudflared {
    binary: String,
}

impl Cloudflared {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn spawn_error(&self, source: io::Error) -> ExternalToolError {
        if source.kind() == io::ErrorKind::NotFound {
            ExternalToolError::NotFound {
                binary: self.binary.clone(),
            }
        } else {
            ExternalToolError::Spawn {
                binary: self.binary.clone(),
                source,
            }
        }
    }

    /// Run a subcommand to completion, capturing output
    fn run(&self, args: &[&str]) -> Result<Output, ExternalToolError> {
        tracing::debug!("Running {} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))
    }

    /// Run a subcommand and fail on a non-zero exit
    fn run_checked(&self, subcommand: &str, args: &[&str]) -> Result<Output, ExternalToolError> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(subcommand, output.status.code(), &stderr));
        }
        Ok(output)
    }

    /// Command line that runs a tunnel from a generated config file
    pub fn run_command(&self, config_path: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("tunnel")
            .arg("--config")
            .arg(config_path)
            .arg("run");
        cmd
    }

    /// Delegate to the daemon's interactive login flow
    pub fn login(&self) -> Result<(), ExternalToolError> {
        let status = Command::new(&self.binary)
            .args(["tunnel", "login"])
            .status()
            .map_err(|e| self.spawn_error(e))?;

        if !status.success() {
            return Err(ExternalToolError::Failed {
                subcommand: "tunnel login".to_string(),
                code: status.code(),
                stderr: String::new(),
            });
        }
        Ok(())
    }

    /// Run the daemon in the foreground until it exits or the operator interrupts
    pub async fn run_foreground(&self, config_path: &Path) -> Result<ExitOutcome, ExternalToolError> {
        let mut child = tokio::process::Command::from(self.run_command(config_path))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let forward_term = tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| self.spawn_error(e))?;
                tracing::info!("{} exited with {}", self.binary, status);
                return Ok(ExitOutcome::Exited(status.code()));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, stopping {}", self.binary);
                false
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, stopping {}", self.binary);
                true
            }
        };

        self.shut_down(&mut child, forward_term, SHUTDOWN_GRACE).await;
        Ok(ExitOutcome::Interrupted)
    }

    /// Let an interrupted daemon unregister its connections, then kill it
    ///
    /// Ctrl+C reaches the daemon through the process group; SIGTERM sent to
    /// flaretun alone has to be forwarded.
    async fn shut_down(&self, child: &mut tokio::process::Child, forward_term: bool, grace: Duration) {
        if forward_term {
            if let Some(pid) = child.id() {
                if let Err(e) = terminate_process(pid) {
                    tracing::debug!("Failed to forward SIGTERM to {}: {}", pid, e);
                }
            }
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => tracing::info!("{} stopped with {}", self.binary, status),
            Ok(Err(e)) => tracing::warn!("Failed to wait for {}: {}", self.binary, e),
            Err(_) => {
                tracing::warn!(
                    "{} did not stop within {:?}, killing it",
                    self.binary,
                    grace
                );
                let _ = child.kill().await;
            }
        }
    }

    /// Start the daemon in the background and release it
    pub fn run_detached(&self, config_path: &Path) -> Result<ProcessHandle, ExternalToolError> {
        let child = self
            .run_command(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let handle = ProcessHandle { pid: child.id() };
        tracing::info!("Started detached {} (PID: {})", self.binary, handle.pid);
        // Dropping the Child neither waits for nor kills the process
        drop(child);
        Ok(handle)
    }
}

impl TunnelGateway for Cloudflared {
    fn binary(&self) -> &str {
        &self.binary
    }

    fn is_installed(&self) -> bool {
        self.run(&["--version"])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn version(&self) -> Option<String> {
        let output = self.run(&["--version"]).ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
    }

    fn list_remote_tunnels(&self) -> Result<Vec<RemoteTunnel>, ExternalToolError> {
        let output = self.run_checked("tunnel list", &["tunnel", "list", "--output", "json"])?;
        parse_tunnel_list(&output.stdout)
    }

    fn create_tunnel(&self, name: &str) -> Result<String, FtError> {
        let output = self.run_checked("tunnel create", &["tunnel", "create", name])?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let id = parse_created_tunnel_id(&combined)?;
        tracing::info!("Created tunnel {} with id {}", name, id);
        Ok(id)
    }

    fn create_dns_route(&self, tunnel_id: &str, hostname: &str) -> Result<(), ExternalToolError> {
        let output = self.run(&["tunnel", "route", "dns", tunnel_id, hostname])?;
        if output.status.success() {
            tracing::info!("Routed {} to tunnel {}", hostname, tunnel_id);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_dns_conflict(&stderr) {
            return Err(ExternalToolError::DnsRecordExists {
                hostname: hostname.to_string(),
            });
        }
        Err(classify_failure("tunnel route dns", output.status.code(), &stderr))
    }
}
