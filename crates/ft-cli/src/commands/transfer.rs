//! Export and import of tunnel definitions

use std::path::Path;

use anyhow::{Context, Result};

use ft_core::guard::{self, Requirement};
use ft_core::workflow;

use crate::context::AppContext;
use crate::output::{print_info, print_success, print_warning, tunnel_label};

/// Write one tunnel as a registry fragment, to a file or stdout
pub fn export_command(ctx: &AppContext, tunnel: Option<&str>, output: Option<&Path>) -> Result<()> {
    let registry = ctx.load_registry();
    let target = guard::target_tunnel(&registry, tunnel)?;

    let fragment = workflow::export_fragment(&registry, &target.id)?;
    let json = serde_json::to_string_pretty(&fragment)?;

    match output {
        Some(path) => {
            std::fs::write(path, format!("{}\n", json))
                .with_context(|| format!("Failed to write {:?}", path))?;
            print_success(&format!("Exported {} to {}", tunnel_label(target), path.display()));
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Merge an exported fragment, registry or legacy config into the registry
pub fn import_command(ctx: &AppContext, file: &Path) -> Result<()> {
    ctx.require(Requirement::Authenticated)?;

    let content =
        std::fs::read_to_string(file).with_context(|| format!("Failed to read {:?}", file))?;
    let mut registry = ctx.load_registry();
    let report = workflow::import_document(&mut registry, &content)
        .with_context(|| format!("{} is not a flaretun config", file.display()))?;

    if !report.changed() {
        print_info("Nothing new to import");
    } else {
        ctx.save_registry(&registry)?;
        print_success(&format!(
            "Imported {} tunnel(s) and {} service(s)",
            report.added_tunnels.len(),
            report.added_services
        ));
    }

    for skipped in &report.skipped_services {
        print_warning(&format!("Skipped {} (already present or invalid)", skipped));
    }
    if let Some(active) = report.activated.as_deref().and_then(|id| registry.get(id)) {
        print_info(&format!("Active tunnel: {}", tunnel_label(active)));
    }
    Ok(())
}
