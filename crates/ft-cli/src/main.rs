//! flaretun CLI
//!
//! Front-end for `cloudflared`:
//! - Tunnel management (init, switch, clean, export/import)
//! - Service registration (add, list, remove)
//! - Running the daemon with a generated ingress config (run, stop, status)

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use flaretun::commands;
use flaretun::context::AppContext;
use flaretun::output::{hint_for, print_error, print_hint};
use ft_core::config::{self, Settings};
use ft_core::logging::{self, LogOptions};

#[derive(Parser)]
#[command(name = "flaretun")]
#[command(author, version, about = "Manage cloudflared tunnels and the local services they expose")]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding the registry, settings and log file
    #[arg(long, global = true, env = "FLARETUN_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// cloudflared binary name or path
    #[arg(long, global = true, env = "FLARETUN_CLOUDFLARED")]
    cloudflared: Option<String>,

    /// Directory with cloudflared's cert.pem and tunnel credentials
    #[arg(long, global = true, env = "FLARETUN_CLOUDFLARED_DIR")]
    cloudflared_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate cloudflared with your Cloudflare account
    Login {
        /// Log in again even if already authenticated
        #[arg(short, long)]
        force: bool,
    },

    /// Create a tunnel (or adopt an existing one) and make it active
    Init {
        /// Tunnel name (defaults to <hostname>-tunnel); with --use-existing, name or id
        #[arg(short, long)]
        name: Option<String>,
        /// Track a tunnel that already exists in your account
        #[arg(long)]
        use_existing: bool,
    },

    /// Route a public hostname to a local port
    /// Alias: add-service
    #[command(alias = "add-service")]
    Add {
        /// Public hostname, e.g. app.example.com
        #[arg(long)]
        hostname: String,
        /// Local port
        #[arg(short, long)]
        port: u32,
        /// Local protocol (http or https)
        #[arg(long, default_value = "http")]
        protocol: String,
        /// Do not ask cloudflared to create the DNS record
        #[arg(long)]
        no_dns: bool,
    },

    /// List services of the active tunnel
    /// Alias: list-services
    #[command(alias = "list-services")]
    List {
        /// Output JSON
        #[arg(long)]
        json: bool,
        /// Include every tunnel
        #[arg(short, long)]
        all: bool,
        /// Sort services by hostname
        #[arg(long)]
        sort: bool,
    },

    /// Remove a service from the active tunnel
    /// Alias: remove-service
    #[command(alias = "remove-service")]
    Remove {
        /// Hostname of the service
        hostname: String,
    },

    /// Select the active tunnel
    Switch {
        /// Tunnel id or name
        tunnel: String,
    },

    /// Run the active tunnel
    Run {
        /// Start in the background and return
        #[arg(short, long)]
        detach: bool,
        /// Tunnel id or name (defaults to the active tunnel)
        #[arg(short, long)]
        tunnel: Option<String>,
    },

    /// Stop running tunnel processes
    Stop {
        /// Stop every cloudflared process
        #[arg(short, long)]
        all: bool,
        /// Tunnel id or name (defaults to the active tunnel)
        #[arg(short, long, conflicts_with = "all")]
        tunnel: Option<String>,
    },

    /// Show cloudflared, tunnel and service status
    Status,

    /// Export a tunnel definition as JSON
    Export {
        /// Tunnel id or name (defaults to the active tunnel)
        #[arg(short, long)]
        tunnel: Option<String>,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import tunnels and services from an exported or legacy config
    Import {
        /// JSON file to import
        file: PathBuf,
    },

    /// Remove tracked tunnels that no longer exist in your account
    Clean {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show flaretun and cloudflared versions
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show effective settings
    Show,
    /// Show config directory path
    Path,
    /// Get a setting
    Get { key: String },
    /// Set a setting
    Set { key: String, value: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            print_error(&format!("{:#}", e));
            if let Some(hint) = hint_for(&e) {
                print_hint(&hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_dir = cli.config_dir.unwrap_or_else(config::default_config_dir);
    let settings = Settings::load_or_default(&config_dir.join(config::SETTINGS_FILE_NAME));

    let log_file = settings
        .as_ref()
        .ok()
        .and_then(|s| s.log_file.clone())
        .unwrap_or_else(|| config_dir.join(config::LOG_FILE_NAME));
    logging::init(&LogOptions {
        verbose: cli.verbose,
        quiet: cli.quiet,
        log_file: Some(log_file),
    });

    // Settings commands must work even when settings.toml is broken
    let command = match cli.command.unwrap_or(Commands::Status) {
        Commands::Config { action } => return config_command(&config_dir, action),
        command => command,
    };

    let settings = settings
        .with_context(|| format!("Failed to load settings from {:?}", config_dir))?
        .with_overrides(cli.cloudflared, cli.cloudflared_dir);
    let ctx = AppContext::new(config_dir, settings);

    match command {
        Commands::Login { force } => commands::login_command(&ctx, force),
        Commands::Init { name, use_existing } => commands::init_command(&ctx, name, use_existing),
        Commands::Add {
            hostname,
            port,
            protocol,
            no_dns,
        } => commands::add_command(&ctx, &hostname, port, &protocol, no_dns).await,
        Commands::List { json, all, sort } => commands::list_command(&ctx, json, all, sort),
        Commands::Remove { hostname } => commands::remove_command(&ctx, &hostname),
        Commands::Switch { tunnel } => commands::switch_command(&ctx, &tunnel),
        Commands::Run { detach, tunnel } => {
            commands::run_command(&ctx, detach, tunnel.as_deref()).await
        }
        Commands::Stop { all, tunnel } => commands::stop_command(&ctx, all, tunnel.as_deref()),
        Commands::Status => commands::status_command(&ctx).await,
        Commands::Export { tunnel, output } => {
            commands::export_command(&ctx, tunnel.as_deref(), output.as_deref())
        }
        Commands::Import { file } => commands::import_command(&ctx, &file),
        Commands::Clean { yes } => commands::clean_command(&ctx, yes),
        Commands::Version => commands::version_command(&ctx),
        Commands::Config { .. } => Ok(()), // dispatched before settings are resolved
    }
}

fn config_command(config_dir: &Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => commands::config_show(config_dir),
        ConfigAction::Path => commands::config_path(config_dir),
        ConfigAction::Get { key } => commands::config_get(config_dir, &key),
        ConfigAction::Set { key, value } => commands::config_set(config_dir, &key, &value),
    }
}
