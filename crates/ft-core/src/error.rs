//! Core error types for flaretun

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the flaretun ecosystem
#[derive(Error, Debug)]
pub enum FtError {
    /// A command precondition was not met
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    /// The external daemon failed or produced unusable output
    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),

    /// Tunnel creation succeeded but its id could not be extracted
    #[error(transparent)]
    CreationParse(#[from] CreationParseError),

    /// Input rejected before any mutation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FtError {
    /// Remediation hint for the operator, when one exists
    pub fn hint(&self) -> Option<String> {
        match self {
            FtError::Precondition(e) => Some(e.hint()),
            FtError::ExternalTool(e) => e.hint(),
            FtError::CreationParse(e) => Some(e.hint()),
            FtError::Validation(e) => e.hint(),
            _ => None,
        }
    }
}

/// Command precondition failures
#[derive(Error, Debug)]
pub enum PreconditionError {
    /// Daemon binary not found or not runnable
    #[error("{binary} is not installed or not on PATH")]
    NotInstalled { binary: String },

    /// Authentication marker file is missing
    #[error("Not authenticated: {} not found", .marker.display())]
    NotAuthenticated { marker: PathBuf },

    /// No active tunnel in the registry
    #[error("No tunnel selected")]
    NoTunnelSelected,

    /// An explicitly requested tunnel is not in the registry
    #[error("Unknown tunnel: {0}")]
    UnknownTunnel(String),
}

impl PreconditionError {
    /// Remediation hint for the operator
    pub fn hint(&self) -> String {
        match self {
            PreconditionError::NotInstalled { binary } => format!(
                "Install cloudflared from https://developers.cloudflare.com/cloudflare-one/connections/connect-networks/downloads/ \
                 or point flaretun at it with --cloudflared (currently '{}')",
                binary
            ),
            PreconditionError::NotAuthenticated { .. } => {
                "Run 'flaretun login' to authenticate with Cloudflare".to_string()
            }
            PreconditionError::NoTunnelSelected => {
                "Run 'flaretun init' to create a tunnel or 'flaretun switch <tunnel>' to select one"
                    .to_string()
            }
            PreconditionError::UnknownTunnel(_) => {
                "Run 'flaretun list --all' to see known tunnels".to_string()
            }
        }
    }
}

/// Failures invoking the external daemon
#[derive(Error, Debug)]
pub enum ExternalToolError {
    /// Binary could not be found
    #[error("{binary} not found")]
    NotFound { binary: String },

    /// Binary exists but could not be started
    #[error("Failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// Subcommand exited unsuccessfully
    #[error("'{subcommand}' failed (exit code {}): {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    Failed {
        subcommand: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Daemon refused because no origin certificate is available
    #[error("'{subcommand}' requires authentication: {stderr}")]
    NotAuthenticated { subcommand: String, stderr: String },

    /// DNS route target already has a record
    #[error("DNS record for {hostname} already exists")]
    DnsRecordExists { hostname: String },

    /// Subcommand succeeded but its output could not be parsed
    #[error("Unparsable output from '{subcommand}': {detail}")]
    UnparsableOutput { subcommand: String, detail: String },
}

impl ExternalToolError {
    /// Remediation hint for the operator, when one exists
    pub fn hint(&self) -> Option<String> {
        match self {
            ExternalToolError::NotFound { .. } => {
                Some("Install cloudflared or set --cloudflared to its path".to_string())
            }
            ExternalToolError::NotAuthenticated { .. } => {
                Some("Run 'flaretun login --force' to refresh credentials".to_string())
            }
            ExternalToolError::DnsRecordExists { hostname } => Some(format!(
                "Remove the existing DNS record for {} in the Cloudflare dashboard, or route it manually with \
                 'cloudflared tunnel route dns --overwrite-dns <tunnel> {}'",
                hostname, hostname
            )),
            _ => None,
        }
    }
}

/// Tunnel creation reported success but no id could be found in its output
#[derive(Error, Debug)]
#[error("Tunnel creation succeeded but no tunnel id was found in the output")]
pub struct CreationParseError {
    /// Raw combined output of the creation subcommand
    pub output: String,
}

impl CreationParseError {
    /// Remediation hint for the operator
    pub fn hint(&self) -> String {
        "The tunnel may exist remotely. Run 'flaretun init --use-existing --name <name>' to track it."
            .to_string()
    }
}

/// Input validation failures, raised before any mutation
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    /// Hostname is not a fully-qualified DNS name
    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),

    /// Port outside 1-65535
    #[error("Invalid port: {0} (expected 1-65535)")]
    InvalidPort(String),

    /// Protocol other than http/https
    #[error("Unsupported protocol: {0} (expected http or https)")]
    UnsupportedProtocol(String),

    /// Hostname already registered in the tunnel
    #[error("Hostname {hostname} is already registered in tunnel {tunnel}")]
    DuplicateHostname { hostname: String, tunnel: String },

    /// No service with this hostname
    #[error("No service with hostname {0}")]
    ServiceNotFound(String),

    /// No tunnel matching this id or name
    #[error("No tunnel matching '{0}'")]
    TunnelNotFound(String),

    /// More than one tunnel shares this name
    #[error("Tunnel name '{0}' is ambiguous, use the tunnel id")]
    AmbiguousTunnel(String),

    /// Tunnel id already present in the registry
    #[error("Tunnel {0} is already registered")]
    DuplicateTunnel(String),

    /// Tunnel cannot be run without services
    #[error("Tunnel {0} has no services")]
    NoServices(String),

    /// Tunnel name is empty or malformed
    #[error("Invalid tunnel name: {0}")]
    InvalidName(String),
}

impl ValidationError {
    /// Remediation hint for the operator, when one exists
    pub fn hint(&self) -> Option<String> {
        match self {
            ValidationError::DuplicateHostname { .. } => {
                Some("Remove the existing service first with 'flaretun remove <hostname>'".to_string())
            }
            ValidationError::NoServices(_) => {
                Some("Add one with 'flaretun add --hostname <name> --port <port>'".to_string())
            }
            ValidationError::TunnelNotFound(_) | ValidationError::AmbiguousTunnel(_) => {
                Some("Run 'flaretun list --all' to see known tunnels".to_string())
            }
            _ => None,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Reading or writing a config file failed
    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Registry document cannot be migrated
    #[error("Invalid registry document: {0}")]
    Registry(#[from] MigrationError),
}

/// Registry documents that cannot be lifted into the current schema
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Document root is not a JSON object
    #[error("Registry document must be a JSON object")]
    NotAnObject,

    /// Document has an object root but fields of the wrong shape
    #[error("Malformed registry document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A step that failed after local state was already committed
///
/// Carried in workflow reports rather than returned as an error: the local
/// mutation stays in place.
#[derive(Debug)]
pub struct PartialSuccessWarning {
    /// What went wrong
    pub message: String,
    /// What the operator can do about it
    pub hint: Option<String>,
}

impl PartialSuccessWarning {
    /// Build a warning from the external failure that caused it
    pub fn from_tool_error(context: &str, err: &ExternalToolError) -> Self {
        Self {
            message: format!("{}: {}", context, err),
            hint: err.hint(),
        }
    }
}

/// Result alias for flaretun core operations
pub type Result<T> = std::result::Result<T, FtError>;
