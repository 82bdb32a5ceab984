//! The `software` operation: register a software product and mirror its
//! repositories into the build environment.
//!
//! Runs as a regular member of the access group once schroot is configured.
//! Clones happen inside the chroot under an ephemeral ssh-agent carrying
//! the build identity.

use anyhow::{Context, Result};
use std::fs;
use std::io::{BufRead, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::info;

use crate::env::{BuildEnv, NAMESPACE};
use crate::error::DebforgeError;
use crate::exec::{run_host, RunOptions};
use crate::session::agent::SshAgent;
use crate::session::Session;

/// Register `name` and clone its repositories.
///
/// `identity` is an optional SSH private key copied into the build
/// directory; without one a fresh key is generated and the user is asked to
/// register its public half before cloning proceeds.
pub fn add_software(
    dir: &Path,
    name: &str,
    repositories: &[String],
    identity: Option<&Path>,
) -> Result<()> {
    let env = BuildEnv::resolve(dir)?;
    check_group_membership(NAMESPACE)?;

    let identity_dir = format!("/var/lib/{NAMESPACE}/{name}/ssh");
    let repository_base = format!("/var/lib/{NAMESPACE}/{name}/repository");
    let identity_file = if identity.is_some() {
        format!("{identity_dir}/id_rsa_custom")
    } else {
        format!("{identity_dir}/id_rsa")
    };

    let session = Session::begin(&env)?;
    let root = RunOptions::new().root();
    session.run(&["mkdir", "-p", &repository_base, &identity_dir], &root)?;
    session.run(
        &[
            "chown",
            &format!(":{NAMESPACE}"),
            &repository_base,
            &identity_dir,
        ],
        &root,
    )?;
    session.run(
        &["chmod", "g+rwX", &repository_base, &identity_dir],
        &root,
    )?;

    match identity {
        None => {
            if !env.rootfs_path(&identity_file).exists() {
                generate_identity(&session, name, &identity_file)?;
            }
        }
        Some(source) => {
            let target = env.rootfs_path(&identity_file);
            fs::copy(source, &target).with_context(|| {
                format!(
                    "copying identity '{}' to '{}'",
                    source.display(),
                    target.display()
                )
            })?;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o2770))
                .with_context(|| format!("setting mode on '{}'", target.display()))?;
        }
    }

    for repository in repositories {
        let basename = repo_basename(repository);
        let repository_dir = format!("{repository_base}/{basename}");
        if env.rootfs_path(&repository_dir).exists() {
            info!(%repository, "already cloned, skipping");
            continue;
        }
        info!(%repository, "cloning in build environment");
        let agent = SshAgent::start(&session, &env, &identity_file)?;
        // Streamed on purpose; the user should see git's progress.
        agent.run(
            &["git", "clone", "--mirror", repository, &repository_dir],
            &RunOptions::new(),
        )?;
    }

    Ok(())
}

/// Generate a build key and wait until the user has registered it.
fn generate_identity(session: &Session, name: &str, identity_file: &str) -> Result<()> {
    let comment = format!("{NAMESPACE} {name}");
    session.run(
        &[
            "ssh-keygen", "-t", "rsa", "-C", &comment, "-N", "", "-q", "-f", identity_file,
        ],
        &RunOptions::new(),
    )?;

    println!("Created SSH key:\n");
    session.run(
        &["cat", &format!("{identity_file}.pub")],
        &RunOptions::new(),
    )?;
    println!();
    print!("Add this key to the repository and press Enter to continue...");
    std::io::stdout().flush().context("flushing stdout")?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("waiting for confirmation")?;
    Ok(())
}

/// Verify the invoking user can use the shared chroot.
fn check_group_membership(group: &str) -> Result<()> {
    let output = run_host(&["id", "-Gn"], &RunOptions::new().capture())
        .context("listing group memberships")?;
    if output.stdout.split_whitespace().any(|g| g == group) {
        return Ok(());
    }
    Err(DebforgeError::NotInGroup {
        group: group.to_string(),
    }
    .into())
}

/// Directory name a mirror clone of `repository` gets.
///
/// Handles both URL-style (`ssh://git@host/team/app.git`) and scp-style
/// (`git@host:team/app.git`) addresses; the mirror directory is always
/// `<name>.git`.
fn repo_basename(repository: &str) -> String {
    let tail = repository
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(repository);
    let stem = tail.strip_suffix(".git").unwrap_or(tail);
    format!("{stem}.git")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_basename_handles_common_address_forms() {
        assert_eq!(repo_basename("ssh://git@host/team/app.git"), "app.git");
        assert_eq!(repo_basename("git@host:team/app.git"), "app.git");
        assert_eq!(repo_basename("https://host/team/app"), "app.git");
        assert_eq!(repo_basename("app"), "app.git");
    }

    #[test]
    fn current_user_is_in_some_group() {
        // `id -Gn` always reports at least one group; an absurd name fails.
        let err = check_group_membership("debforge-test-no-such-group").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DebforgeError>(),
            Some(DebforgeError::NotInGroup { .. })
        ));
    }
}
