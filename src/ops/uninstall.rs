//! The `uninstall` operation: remove the installed configuration.
//!
//! Only the schroot config and its link are removed; the build directory
//! and rootfs stay on disk for the user to delete. Refuses to run while
//! sessions for this chroot are still open — schroot would otherwise be
//! left holding mounts into a directory we just unregistered.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::Path;
use tracing::info;

use crate::env::BuildEnv;
use crate::error::DebforgeError;
use crate::exec::{run_host, RunOptions};

/// Remove the installed configuration for `dir`.
pub fn uninstall(dir: &Path) -> Result<()> {
    let env = BuildEnv::resolve(dir)?;

    let open = open_sessions(&env.name)?;
    if !open.is_empty() {
        let mut listing = String::new();
        for session in &open {
            listing.push_str(&format!("   {session}\n"));
        }
        listing.push_str("Please end them using something like:\n");
        for session in &open {
            listing.push_str(&format!("   schroot --chroot {session} --end-session\n"));
        }
        return Err(DebforgeError::OpenSessions {
            listing: listing.trim_end().to_string(),
        }
        .into());
    }

    match std::fs::remove_file(&env.config_path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("no configuration installed, nothing to uninstall");
        }
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            return Err(DebforgeError::Permission {
                action: "cannot remove configuration".to_string(),
                exit_code: 2,
            }
            .into());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("removing '{}'", env.config_path.display()));
        }
    }

    match std::fs::remove_file(&env.config_link) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            return Err(DebforgeError::Permission {
                action: "cannot remove link configuration".to_string(),
                exit_code: 2,
            }
            .into());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("removing '{}'", env.config_link.display()));
        }
    }

    // The group is left in place: other build directories may use it and
    // the data directories are not deleted here anyway.
    info!("uninstalled this build directory, you may now delete it");
    Ok(())
}

/// Open schroot sessions belonging to this chroot name.
fn open_sessions(name: &str) -> Result<Vec<String>> {
    let output = run_host(
        &["schroot", "--list", "--all-sessions", "--quiet"],
        &RunOptions::new().capture(),
    )
    .context("listing schroot sessions")?;
    let prefix = format!("session:{name}-");
    Ok(output
        .lines()
        .filter(|line| line.starts_with(&prefix))
        .map(str::to_string)
        .collect())
}
