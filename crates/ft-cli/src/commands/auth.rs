//! Login command implementation

use anyhow::{Context, Result};

use ft_core::guard::Requirement;
use ft_core::workflow;

use crate::context::AppContext;
use crate::output::{print_info, print_success, print_warning};

/// Delegate to the daemon's browser login unless already authenticated
///
/// With `--force` an existing certificate is moved aside first, since the
/// daemon refuses to overwrite it, and put back if no new one arrives.
pub fn login_command(ctx: &AppContext, force: bool) -> Result<()> {
    ctx.require(Requirement::Installed)?;

    let marker = ctx.paths.auth_marker();
    if marker.is_file() && !force {
        print_success(&format!("Already authenticated ({})", marker.display()));
        print_info("Use --force to log in again");
        return Ok(());
    }

    let backup = workflow::set_aside_auth_marker(&ctx.paths)
        .with_context(|| format!("Failed to move {} aside", marker.display()))?;
    if let Some(backup) = &backup {
        print_info(&format!("Existing certificate moved to {}", backup.display()));
    }

    print_info("Opening the Cloudflare login page in your browser...");
    let result = ctx.gateway.login();

    if let Some(backup) = &backup {
        match workflow::restore_auth_marker(&ctx.paths, backup) {
            Ok(true) => print_info("Previous certificate restored"),
            Ok(false) => {}
            Err(e) => print_warning(&format!(
                "Could not restore {} from {}: {}",
                marker.display(),
                backup.display(),
                e
            )),
        }
    }
    result?;

    if marker.is_file() {
        print_success("Authenticated with Cloudflare");
    } else {
        print_warning(&format!(
            "Login finished but {} was not found; flaretun will treat you as logged out",
            marker.display()
        ));
    }
    Ok(())
}
