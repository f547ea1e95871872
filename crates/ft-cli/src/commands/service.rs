//! Service commands: add, list, remove

use anyhow::Result;
use serde::Serialize;

use ft_core::guard::{self, Requirement};
use ft_core::workflow::{self, ServiceRequest};
use ft_core::{Protocol, Service, Tunnel};

use crate::context::AppContext;
use crate::output::{
    format_services, print_hint, print_info, print_success, print_warning, tunnel_label,
};

/// Register a local service on the active tunnel
pub async fn add_command(
    ctx: &AppContext,
    hostname: &str,
    port: u32,
    protocol: &str,
    no_dns: bool,
) -> Result<()> {
    ctx.require(Requirement::Authenticated)?;
    let mut registry = ctx.load_registry();
    let tunnel_id = guard::target_tunnel(&registry, None)?.id.clone();

    let request = ServiceRequest {
        hostname: hostname.to_string(),
        port,
        protocol: protocol.parse::<Protocol>()?,
        route_dns: !no_dns,
    };

    let report = workflow::add_service(
        &mut registry,
        &ctx.store,
        &ctx.gateway,
        &tunnel_id,
        &request,
        ctx.settings.health_timeout,
    )
    .await?;

    print_success(&format!(
        "Added {} -> {}",
        report.service.hostname, report.service.target_url
    ));

    if !report.reachable {
        print_warning(&format!(
            "Nothing is listening on localhost:{} yet; requests will fail until it is",
            report.service.port
        ));
    }

    if report.dns_routed {
        print_success(&format!("DNS route created for {}", report.service.hostname));
    } else if no_dns {
        print_info(&format!(
            "DNS not routed; run 'cloudflared tunnel route dns {} {}' when ready",
            tunnel_id, report.service.hostname
        ));
    }

    for warning in &report.warnings {
        print_warning(&warning.message);
        if let Some(hint) = &warning.hint {
            print_hint(hint);
        }
    }

    print_info("Restart the tunnel with 'flaretun run' to apply the change");
    Ok(())
}

#[derive(Serialize)]
struct TunnelListing<'a> {
    id: &'a str,
    name: &'a str,
    active: bool,
    services: Vec<&'a Service>,
}

fn listing<'a>(tunnel: &'a Tunnel, active: bool, sort: bool) -> TunnelListing<'a> {
    TunnelListing {
        id: &tunnel.id,
        name: &tunnel.name,
        active,
        services: ordered_services(tunnel, sort),
    }
}

fn ordered_services(tunnel: &Tunnel, sort: bool) -> Vec<&Service> {
    if sort {
        tunnel.sorted_services()
    } else {
        tunnel.services.iter().collect()
    }
}

/// Show services of the active tunnel, or of every tunnel
pub fn list_command(ctx: &AppContext, json: bool, all: bool, sort: bool) -> Result<()> {
    let registry = ctx.load_registry();
    let active_id = registry.active_id();

    if all {
        if json {
            let tunnels: Vec<TunnelListing> = registry
                .tunnels
                .values()
                .map(|t| listing(t, Some(t.id.as_str()) == active_id, sort))
                .collect();
            println!("{}", serde_json::to_string_pretty(&tunnels)?);
            return Ok(());
        }

        if registry.is_empty() {
            print_info("No tunnels configured. Create one with 'flaretun init'");
            return Ok(());
        }
        for tunnel in registry.tunnels.values() {
            let marker = if Some(tunnel.id.as_str()) == active_id { " (active)" } else { "" };
            println!("{}{}", tunnel_label(tunnel), marker);
            println!("{}", format_services(&ordered_services(tunnel, sort), None));
            println!();
        }
        return Ok(());
    }

    let Some(tunnel) = registry.active() else {
        if json {
            println!("[]");
        } else {
            print_info("No tunnel selected. Run 'flaretun init' or 'flaretun switch <tunnel>'");
        }
        return Ok(());
    };

    let services = ordered_services(tunnel, sort);
    if json {
        println!("{}", serde_json::to_string_pretty(&services)?);
    } else {
        println!("Tunnel: {}", tunnel_label(tunnel));
        println!("{}", format_services(&services, None));
    }
    Ok(())
}

/// Remove a service from the active tunnel
pub fn remove_command(ctx: &AppContext, hostname: &str) -> Result<()> {
    ctx.require(Requirement::Authenticated)?;
    let mut registry = ctx.load_registry();
    let tunnel_id = guard::target_tunnel(&registry, None)?.id.clone();

    let removed = registry.remove_service(&tunnel_id, hostname)?;
    ctx.save_registry(&registry)?;

    print_success(&format!("Removed {}", removed.hostname));
    print_info("The DNS record is left in place; delete it in the Cloudflare dashboard if unused");
    Ok(())
}
