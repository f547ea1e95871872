//! Run and stop commands

use anyhow::{Context, Result};

use ft_core::gateway::ExitOutcome;
use ft_core::guard::{self, Requirement};
use ft_core::health::health_check_with_timeout;
use ft_core::reconcile::find_daemon_processes;
use ft_core::workflow;
use ft_core::TunnelGateway;

use crate::context::AppContext;
use crate::output::{print_error, print_info, print_success, print_warning, tunnel_label};

/// Generate the daemon config and run the tunnel
pub async fn run_command(ctx: &AppContext, detach: bool, tunnel: Option<&str>) -> Result<()> {
    ctx.require(Requirement::Authenticated)?;
    let mut registry = ctx.load_registry();
    let target = guard::target_tunnel(&registry, tunnel)?;
    let (tunnel_id, label) = (target.id.clone(), tunnel_label(target));
    let origins: Vec<(String, u16)> = target
        .services
        .iter()
        .map(|s| (s.hostname.clone(), s.port))
        .collect();

    match find_daemon_processes(&ctx.lister, ctx.gateway.binary(), Some(&tunnel_id)) {
        Ok(running) => {
            if let Some(pid) = running.first() {
                print_warning(&format!("{} is already running (PID: {})", label, pid));
                print_info("Stop it first with 'flaretun stop'");
                return Ok(());
            }
        }
        Err(e) => tracing::warn!("Could not check for a running daemon: {}", e),
    }

    // Advisory only: the daemon starts even if an origin is down
    for (hostname, port) in &origins {
        if !health_check_with_timeout(*port, ctx.settings.health_timeout).await {
            print_warning(&format!(
                "Nothing is listening on localhost:{} ({}); requests will fail until it is",
                port, hostname
            ));
        }
    }

    let config_path = workflow::prepare_run(&mut registry, &ctx.paths, &tunnel_id)?;
    ctx.save_registry(&registry)?;
    tracing::info!("Running tunnel {} with {:?}", tunnel_id, config_path);

    if detach {
        let handle = ctx.gateway.run_detached(&config_path)?;
        print_success(&format!("Tunnel {} started (PID: {})", label, handle.pid));
        print_info("Stop it with 'flaretun stop'");
        return Ok(());
    }

    print_info(&format!("Running {}. Press Ctrl+C to stop.", label));
    match ctx.gateway.run_foreground(&config_path).await? {
        ExitOutcome::Interrupted => print_success("Tunnel stopped"),
        ExitOutcome::Exited(Some(0)) => print_info("cloudflared exited"),
        ExitOutcome::Exited(code) => {
            let code = code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            anyhow::bail!("cloudflared exited with code {}", code);
        }
    }
    Ok(())
}

/// Terminate daemon processes for the selected tunnel, or all of them
pub fn stop_command(ctx: &AppContext, all: bool, tunnel: Option<&str>) -> Result<()> {
    ctx.require(Requirement::Installed)?;

    let tunnel_id = if all {
        None
    } else {
        let registry = ctx.load_registry();
        Some(guard::target_tunnel(&registry, tunnel)?.id.clone())
    };

    let report = workflow::stop_daemons(&ctx.lister, ctx.gateway.binary(), tunnel_id.as_deref())
        .context("Failed to enumerate running processes")?;

    if report.stopped.is_empty() && report.failed.is_empty() {
        print_info("No running tunnel processes found");
        return Ok(());
    }

    for pid in &report.stopped {
        print_success(&format!("Stopped cloudflared (PID: {})", pid));
    }
    for (pid, e) in &report.failed {
        print_error(&format!("Failed to stop PID {}: {}", pid, e));
    }

    if !report.failed.is_empty() {
        anyhow::bail!("Failed to stop {} process(es)", report.failed.len());
    }
    Ok(())
}
