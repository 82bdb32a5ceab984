//! The `init` operation: provision a new build environment.
//!
//! Requires root for debootstrap and for installing the schroot config.
//! The sequence is deliberately restartable: an interrupted run leaves the
//! bootstrap marker absent, so the state tracker reports "no debootstrap"
//! and the next run re-bootstraps from scratch.

use anyhow::{Context, Result};
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::info;

use crate::env::{BuildEnv, NAMESPACE, SCHROOT_PROFILE_DIR};
use crate::error::DebforgeError;
use crate::exec::{run_argv, run_host, RunOptions};
use crate::preflight::{check_required_tools, INSTALL_TOOLS};
use crate::registry::conn::ConnectionInfo;
use crate::registry::VariantRegistry;
use crate::session::Session;

/// Packages installed inside the chroot for building.
const BUILD_DEPENDENCIES: &[&str] = &[
    "locales",
    "build-essential",
    "debhelper",
    "git-buildpackage",
    "git",
];

/// schroot profile files installed under [`SCHROOT_PROFILE_DIR`].
const PROFILE_FILES: &[(&str, &str)] = &[
    (
        "fstab",
        "# <filesystem> <mount point> <type> <options> <dump> <pass>\n\
         /proc\t/proc\tnone\trw,bind\t0\t0\n\
         /sys\t/sys\tnone\trw,bind\t0\t0\n\
         /dev\t/dev\tnone\trw,bind\t0\t0\n\
         /dev/pts\t/dev/pts\tnone\trw,bind\t0\t0\n\
         /tmp\t/tmp\tnone\trw,bind\t0\t0\n",
    ),
    ("copyfiles", "/etc/resolv.conf\n"),
    ("nssdatabases", "passwd\nshadow\ngroup\ngshadow\n"),
];

/// What to bootstrap.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Debian suite (e.g. "bookworm").
    pub suite: String,
    /// Debian architecture (e.g. "amd64").
    pub arch: String,
    /// Preferred (local) Debian mirror.
    pub mirror: Option<String>,
    /// Pre-downloaded debootstrap package tarball.
    pub tarball: Option<String>,
}

/// Provision a build environment at `dir`.
pub fn install(dir: &Path, opts: &InstallOptions, db: Option<&ConnectionInfo>) -> Result<()> {
    check_required_tools(INSTALL_TOOLS)?;

    let env = BuildEnv::resolve(dir)?;

    // Catch obvious permission problems before touching anything.
    let config_dir = env
        .config_path
        .parent()
        .context("schroot config path has no parent")?;
    if !writable(config_dir) {
        return Err(DebforgeError::Permission {
            action: "cannot install schroot configuration".to_string(),
            exit_code: 3,
        }
        .into());
    }

    let gid = ensure_group(NAMESPACE)?;

    // Group-writable build directory so non-root group members can use it;
    // ownership follows whoever owns the parent.
    let parent_uid = dir
        .parent()
        .map(|p| p.metadata().map(|m| m.uid()))
        .transpose()
        .context("inspecting build directory parent")?
        .unwrap_or(0);
    create_group_dir(&env.dir, parent_uid, gid, Some(0o2770))?;
    create_group_dir(&env.log_dir, parent_uid, gid, None)?;
    create_group_dir(&env.root_dir, parent_uid, gid, None)?;

    install_profile_dir()?;

    // Install the chroot definition system-wide so group members can enter
    // without root, and link it into the build directory so later calls can
    // find the name again.
    fs::write(&env.config_path, env.schroot_config().render())
        .with_context(|| format!("writing schroot config '{}'", env.config_path.display()))?;
    if !env.has_config_link {
        std::os::unix::fs::symlink(&env.config_path, &env.config_link)
            .with_context(|| format!("linking '{}'", env.config_link.display()))?;
    }
    info!(name = %env.name, config = %env.config_path.display(), "schroot configured");

    run_debootstrap(&env, opts)?;

    if let Some(mirror) = &opts.mirror {
        let sources_list = env.rootfs_path("/etc/apt/sources.list");
        fs::write(&sources_list, format!("deb {} {} main\n", mirror, opts.suite))
            .with_context(|| format!("writing '{}'", sources_list.display()))?;
    }

    // Root is no longer strictly needed from here; everything below goes
    // through the session.
    provision_chroot(&env)?;

    fs::write(env.bootstrap_marker(), "")
        .with_context(|| format!("writing marker '{}'", env.bootstrap_marker().display()))?;
    info!(dir = %env.dir.display(), "base system bootstrap complete");

    if let Some(info) = db {
        let registry = VariantRegistry::connect(info)?;
        registry.ensure_schema()?;
        info!(registry = %info, "variant registry initialized");
    }

    Ok(())
}

fn run_debootstrap(env: &BuildEnv, opts: &InstallOptions) -> Result<()> {
    let argv = debootstrap_argv(&env.root_dir, opts);
    let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
    // Streamed: debootstrap output is the progress report.
    run_argv(&argv_refs, &RunOptions::new())?;
    Ok(())
}

fn debootstrap_argv(root_dir: &Path, opts: &InstallOptions) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        "debootstrap".into(),
        "--variant=minbase".into(),
        "--arch".into(),
        opts.arch.clone(),
    ];
    if let Some(tarball) = &opts.tarball {
        argv.push("--unpack-tarball".into());
        argv.push(tarball.clone());
    }
    argv.push(opts.suite.clone());
    argv.push(root_dir.display().to_string());
    if let Some(mirror) = &opts.mirror {
        argv.push(mirror.clone());
    }
    argv
}

/// Install build dependencies and the build user inside the fresh chroot.
fn provision_chroot(env: &BuildEnv) -> Result<()> {
    let session = Session::begin(env)?;
    let root_shell = RunOptions::new().root().shell();

    // Service starts are meaningless inside the build chroot.
    session.run(&[r#"echo "exit 0" > /sbin/start-stop-daemon"#], &root_shell)?;
    session.run(
        &[r#"printf "en_US ISO-8859-1\nen_US.UTF-8 UTF-8\n" > /etc/locale.gen"#],
        &root_shell,
    )?;

    session.run(&["apt-get", "update"], &RunOptions::new().root())?;
    let mut install_cmd = vec!["apt-get", "install", "--assume-yes"];
    install_cmd.extend_from_slice(BUILD_DEPENDENCIES);
    session.run(&install_cmd, &RunOptions::new().root())?;

    session.run(&[&format!("addgroup {NAMESPACE}")], &root_shell)?;
    session.run(
        &[&format!(
            "adduser --system --quiet --ingroup \"{NAMESPACE}\" \
             --gecos \"debforge build user\" \"{NAMESPACE}\""
        )],
        &root_shell,
    )?;
    session.run(&[&format!("adduser {NAMESPACE} {NAMESPACE}")], &root_shell)?;
    Ok(())
}

/// Make sure the access group exists, returning its gid.
fn ensure_group(group: &str) -> Result<u32> {
    if let Some(gid) = lookup_gid(group)? {
        return Ok(gid);
    }
    run_host(&["addgroup", "--system", group], &RunOptions::new().capture())?;
    info!(group, "created system group for build environment access");
    lookup_gid(group)?
        .with_context(|| format!("group '{group}' missing after addgroup"))
}

fn lookup_gid(group: &str) -> Result<Option<u32>> {
    // getent exits nonzero for unknown groups; that is the "absent" case.
    let output = match run_host(&["getent", "group", group], &RunOptions::new().capture()) {
        Ok(output) => output,
        Err(err) => match err.downcast_ref::<DebforgeError>() {
            Some(DebforgeError::ToolFailed { .. }) => return Ok(None),
            _ => return Err(err),
        },
    };
    let line = output.stdout.trim();
    let gid = line
        .split(':')
        .nth(2)
        .and_then(|f| f.parse::<u32>().ok())
        .with_context(|| format!("unexpected getent output '{line}'"))?;
    Ok(Some(gid))
}

fn create_group_dir(path: &Path, uid: u32, gid: u32, mode: Option<u32>) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        return Ok(());
    }
    fs::create_dir_all(path).with_context(|| format!("creating '{}'", path.display()))?;
    chown(path, uid, gid)?;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("setting mode on '{}'", path.display()))?;
    }
    Ok(())
}

fn chown(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .context("path contains a NUL byte")?;
    // SAFETY: c_path is a valid NUL-terminated string for the call.
    let rc = unsafe { libc::chown(c_path.as_ptr(), uid, gid) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("chown '{}'", path.display()));
    }
    Ok(())
}

fn writable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the call.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

fn install_profile_dir() -> Result<()> {
    let profile_dir = Path::new(SCHROOT_PROFILE_DIR);
    if profile_dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(profile_dir)
        .with_context(|| format!("creating profile dir '{}'", profile_dir.display()))?;
    for (filename, content) in PROFILE_FILES {
        let path = profile_dir.join(filename);
        fs::write(&path, content)
            .with_context(|| format!("writing profile file '{}'", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_reflects_directory_permissions() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(writable(dir.path()));
        assert!(!writable(Path::new("/nonexistent-path-for-debforge-tests")));
    }

    #[test]
    fn debootstrap_argv_includes_tarball_and_mirror() {
        let opts = InstallOptions {
            suite: "bookworm".into(),
            arch: "amd64".into(),
            mirror: Some("http://mirror/debian".into()),
            tarball: Some("/tmp/base.tgz".into()),
        };
        assert_eq!(
            debootstrap_argv(Path::new("/b/debootstrap-root"), &opts),
            [
                "debootstrap",
                "--variant=minbase",
                "--arch",
                "amd64",
                "--unpack-tarball",
                "/tmp/base.tgz",
                "bookworm",
                "/b/debootstrap-root",
                "http://mirror/debian",
            ]
        );
    }

    #[test]
    fn debootstrap_argv_minimal() {
        let opts = InstallOptions {
            suite: "bookworm".into(),
            arch: "arm64".into(),
            mirror: None,
            tarball: None,
        };
        assert_eq!(
            debootstrap_argv(Path::new("/b/debootstrap-root"), &opts),
            [
                "debootstrap",
                "--variant=minbase",
                "--arch",
                "arm64",
                "bookworm",
                "/b/debootstrap-root",
            ]
        );
    }
}
