//! Output formatting utilities for the CLI
//!
//! Tables for services and tunnels, colored status lines, the y/N prompt and
//! the hint lookup used when a command fails.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};

use chrono::{DateTime, Local, Utc};
use tabled::{settings::Style, Table, Tabled};

use ft_core::error::{
    CreationParseError, ExternalToolError, FtError, PreconditionError, ValidationError,
};
use ft_core::{Registry, Service, Tunnel, TunnelStatus};

/// Format a tunnel's services as a table
///
/// `health` maps hostnames to health check results; without it the column is omitted.
pub fn format_services(services: &[&Service], health: Option<&BTreeMap<String, bool>>) -> String {
    if services.is_empty() {
        return "No services configured".to_string();
    }

    #[derive(Tabled)]
    struct ServiceRow {
        #[tabled(rename = "HOSTNAME")]
        hostname: String,
        #[tabled(rename = "TARGET")]
        target: String,
        #[tabled(rename = "ADDED")]
        added: String,
    }

    #[derive(Tabled)]
    struct ServiceHealthRow {
        #[tabled(rename = "HOSTNAME")]
        hostname: String,
        #[tabled(rename = "TARGET")]
        target: String,
        #[tabled(rename = "LOCAL PORT")]
        health: String,
    }

    match health {
        Some(health) => {
            let rows: Vec<ServiceHealthRow> = services
                .iter()
                .map(|s| ServiceHealthRow {
                    hostname: s.hostname.clone(),
                    target: s.target_url.clone(),
                    health: match health.get(&s.hostname) {
                        Some(true) => "listening".to_string(),
                        Some(false) => "not listening".to_string(),
                        None => "-".to_string(),
                    },
                })
                .collect();
            Table::new(rows).with(Style::rounded()).to_string()
        }
        None => {
            let rows: Vec<ServiceRow> = services
                .iter()
                .map(|s| ServiceRow {
                    hostname: s.hostname.clone(),
                    target: s.target_url.clone(),
                    added: format_time(&s.created_at),
                })
                .collect();
            Table::new(rows).with(Style::rounded()).to_string()
        }
    }
}

/// Format all tunnels with their observed status
pub fn format_tunnels(registry: &Registry, statuses: &BTreeMap<String, TunnelStatus>) -> String {
    if registry.is_empty() {
        return "No tunnels configured".to_string();
    }

    #[derive(Tabled)]
    struct TunnelRow {
        #[tabled(rename = " ")]
        active: &'static str,
        #[tabled(rename = "NAME")]
        name: String,
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "SERVICES")]
        services: usize,
        #[tabled(rename = "LAST USED")]
        last_used: String,
    }

    let active = registry.active_id();
    let rows: Vec<TunnelRow> = registry
        .tunnels
        .values()
        .map(|t| TunnelRow {
            active: if Some(t.id.as_str()) == active { "*" } else { "" },
            name: t.name.clone(),
            id: truncate(&t.id, 13),
            status: statuses
                .get(&t.id)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            services: t.services.len(),
            last_used: t
                .last_used_at
                .as_ref()
                .map(format_time)
                .unwrap_or_else(|| "never".to_string()),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// One-line tunnel label: `name (id)`
pub fn tunnel_label(tunnel: &Tunnel) -> String {
    format!("{} ({})", tunnel.name, tunnel.id)
}

/// Render a UTC timestamp in local time
fn format_time(time: &DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Remediation hint for any core error in the chain
pub fn hint_for(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| {
        if let Some(e) = cause.downcast_ref::<FtError>() {
            e.hint()
        } else if let Some(e) = cause.downcast_ref::<PreconditionError>() {
            Some(e.hint())
        } else if let Some(e) = cause.downcast_ref::<ExternalToolError>() {
            e.hint()
        } else if let Some(e) = cause.downcast_ref::<ValidationError>() {
            e.hint()
        } else if let Some(e) = cause.downcast_ref::<CreationParseError>() {
            Some(e.hint())
        } else {
            None
        }
    })
}

/// Ask a y/N question on stdin; anything but yes is no
pub fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().lock().read_line(&mut input)?;

    let answer = input.trim();
    Ok(answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr with red coloring for error feedback to the user.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow with a warning symbol prefix
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an informational message in cyan with an info symbol prefix
pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a remediation hint below an error or warning, on stderr
pub fn print_hint(msg: &str) {
    use crossterm::style::{Attribute, Print, SetAttribute};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetAttribute(Attribute::Dim),
        Print("  hint: "),
        SetAttribute(Attribute::Reset),
        Print(msg),
        Print("\n")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use ft_core::Protocol;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abc", 5), "abc");
        assert_eq!(truncate("6ff42ae2-765d-4adf", 13), "6ff42ae2-7...");
    }

    #[test]
    fn test_format_services() {
        let a = Service::new("a.example.com", Protocol::Http, 3000).unwrap();
        let b = Service::new("b.example.com", Protocol::Https, 8443).unwrap();

        let table = format_services(&[&a, &b], None);
        assert!(table.contains("HOSTNAME"));
        assert!(table.contains("https://localhost:8443"));

        let health = BTreeMap::from([("a.example.com".to_string(), true)]);
        let table = format_services(&[&a, &b], Some(&health));
        assert!(table.contains("listening"));
        assert!(!table.contains("not listening"));

        assert_eq!(format_services(&[], None), "No services configured");
    }

    #[test]
    fn test_format_tunnels_marks_active() {
        let mut registry = Registry::new();
        registry.add_tunnel(Tunnel::new("abc", "dev")).unwrap();
        registry.add_tunnel(Tunnel::new("def", "ops")).unwrap();
        registry.select_tunnel("def").unwrap();

        let statuses = BTreeMap::from([("abc".to_string(), TunnelStatus::Stopped)]);
        let table = format_tunnels(&registry, &statuses);

        let ops_line = table.lines().find(|l| l.contains("ops")).unwrap();
        assert!(ops_line.contains('*'));
        let dev_line = table.lines().find(|l| l.contains("dev")).unwrap();
        assert!(dev_line.contains("stopped"));
        assert!(dev_line.contains("never"));
    }

    #[test]
    fn test_hint_for_wrapped_errors() {
        let err = anyhow::Error::from(PreconditionError::NoTunnelSelected).context("add failed");
        assert!(hint_for(&err).unwrap().contains("flaretun init"));

        let err = anyhow::Error::from(FtError::from(ValidationError::NoServices("dev".into())));
        assert!(hint_for(&err).unwrap().contains("flaretun add"));

        assert!(hint_for(&anyhow::anyhow!("plain")).is_none());
    }
}
