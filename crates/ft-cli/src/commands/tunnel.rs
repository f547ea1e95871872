//! Tunnel lifecycle commands: init, switch, clean

use anyhow::{Context, Result};

use ft_core::guard::Requirement;
use ft_core::reconcile::apply_clean;
use ft_core::workflow;
use ft_core::{Reconciler, TunnelGateway};

use crate::context::AppContext;
use crate::output::{confirm, print_info, print_success, print_warning, tunnel_label};

/// Create a new tunnel, or adopt one that already exists remotely
pub fn init_command(ctx: &AppContext, name: Option<String>, use_existing: bool) -> Result<()> {
    ctx.require(Requirement::Authenticated)?;
    let mut registry = ctx.load_registry();

    let tunnel = if use_existing {
        let Some(target) = name else {
            let remote = ctx.gateway.list_remote_tunnels()?;
            if remote.is_empty() {
                print_warning("No tunnels exist in your Cloudflare account");
            } else {
                println!("Existing tunnels:");
                for t in &remote {
                    println!("  {} ({})", t.name, t.id);
                }
            }
            anyhow::bail!("Specify which tunnel to use with --name <name-or-id>");
        };

        let (tunnel, added) = workflow::adopt_tunnel(&mut registry, &ctx.gateway, &target)?;
        if !added {
            print_info(&format!("{} is already tracked", tunnel_label(&tunnel)));
        }
        tunnel
    } else {
        let name = name.unwrap_or_else(workflow::default_tunnel_name);
        print_info(&format!("Creating tunnel '{}'...", name));
        workflow::create_tunnel(&mut registry, &ctx.gateway, &name)?
    };

    ctx.save_registry(&registry)?;
    print_success(&format!("Active tunnel: {}", tunnel_label(&tunnel)));
    print_info("Next: flaretun add --hostname <name> --port <port>");
    Ok(())
}

/// Make another tracked tunnel the active one
pub fn switch_command(ctx: &AppContext, id_or_name: &str) -> Result<()> {
    ctx.require(Requirement::Authenticated)?;
    let mut registry = ctx.load_registry();

    let id = registry.resolve(id_or_name)?.id.clone();
    registry.select_tunnel(&id)?;
    ctx.save_registry(&registry)?;

    if let Some(tunnel) = registry.active() {
        print_success(&format!("Switched to {}", tunnel_label(tunnel)));
    }
    Ok(())
}

/// Drop tracked tunnels that no longer exist remotely
pub fn clean_command(ctx: &AppContext, yes: bool) -> Result<()> {
    ctx.require(Requirement::Authenticated)?;
    let mut registry = ctx.load_registry();

    let candidates = Reconciler::new(&ctx.gateway, &ctx.lister)
        .clean_candidates(&registry)
        .context("Cannot tell which tunnels are stale without the remote tunnel list")?;

    if candidates.is_empty() {
        print_success("Every tracked tunnel still exists; nothing to clean");
        return Ok(());
    }

    println!("Tracked tunnels not found in your Cloudflare account:");
    for id in &candidates {
        if let Some(tunnel) = registry.get(id) {
            println!("  {} - {} service(s)", tunnel_label(tunnel), tunnel.services.len());
        }
    }

    if !yes && !confirm(&format!("Remove {} tunnel(s) from the registry?", candidates.len()))? {
        print_info("Nothing removed");
        return Ok(());
    }

    let removed = apply_clean(&mut registry, &candidates);
    ctx.save_registry(&registry)?;

    for tunnel in &removed {
        let config = ctx.paths.daemon_config_file(&tunnel.id);
        if config.exists() {
            if let Err(e) = std::fs::remove_file(&config) {
                tracing::debug!("Could not remove {:?}: {}", config, e);
            }
        }
    }

    print_success(&format!("Removed {} tunnel(s)", removed.len()));
    if registry.active().is_none() && !registry.is_empty() {
        print_info("No tunnel is active now; select one with 'flaretun switch <tunnel>'");
    }
    Ok(())
}
