//! Preflight checks for provisioning.
//!
//! Validates that the host has the external tools an operation needs before
//! any directory or config is touched. This prevents half-provisioned build
//! directories from cryptic mid-install failures.

use anyhow::Result;

use crate::error::DebforgeError;

/// Check if a command exists on the host PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools `init` needs, as (command, Debian package) pairs.
pub const INSTALL_TOOLS: &[(&str, &str)] = &[
    ("debootstrap", "debootstrap"),
    ("schroot", "schroot"),
];

/// Check that specific tools are available.
///
/// Missing tools come back as one [`DebforgeError::MissingTools`] listing
/// the packages to install.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(_, package)| *package)
        .collect();

    if !missing.is_empty() {
        return Err(DebforgeError::MissingTools {
            packages: missing.join(" "),
        }
        .into());
    }
    Ok(())
}
