//! Status and version commands

use std::collections::BTreeMap;

use anyhow::Result;

use ft_core::guard;
use ft_core::health::health_check_with_timeout;
use ft_core::Reconciler;

use crate::context::AppContext;
use crate::output::{format_services, format_tunnels, print_info, print_success, print_warning};

/// Report daemon, authentication, tunnel and service state
pub async fn status_command(ctx: &AppContext) -> Result<()> {
    let env = guard::inspect(&ctx.gateway, &ctx.paths);

    match &env.version {
        Some(version) => print_success(&format!("cloudflared: {}", version)),
        None => print_warning(&format!("cloudflared: not installed ({})", env.binary)),
    }
    if env.authenticated {
        print_success("Authenticated with Cloudflare");
    } else {
        print_warning("Not authenticated; run 'flaretun login'");
    }
    println!("Registry: {}", ctx.store.path().display());
    println!();

    let registry = ctx.load_registry();
    if registry.is_empty() {
        print_info("No tunnels configured. Create one with 'flaretun init'");
        return Ok(());
    }

    let statuses = Reconciler::new(&ctx.gateway, &ctx.lister)
        .tunnel_statuses(registry.tunnels.keys().map(String::as_str));
    println!("{}", format_tunnels(&registry, &statuses));

    let Some(active) = registry.active() else {
        print_info("No tunnel selected. Select one with 'flaretun switch <tunnel>'");
        return Ok(());
    };

    let mut health = BTreeMap::new();
    for service in &active.services {
        let up = health_check_with_timeout(service.port, ctx.settings.health_timeout).await;
        health.insert(service.hostname.clone(), up);
    }

    println!();
    println!("Services of {}:", active.name);
    let services: Vec<_> = active.services.iter().collect();
    println!("{}", format_services(&services, Some(&health)));
    Ok(())
}

/// Print flaretun and cloudflared versions
pub fn version_command(ctx: &AppContext) -> Result<()> {
    use ft_core::TunnelGateway;

    println!("flaretun {}", env!("CARGO_PKG_VERSION"));
    match ctx.gateway.version() {
        Some(version) => println!("{}", version),
        None => println!("cloudflared: not installed ({})", ctx.gateway.binary()),
    }
    Ok(())
}
