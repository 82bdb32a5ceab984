//! Build-environment descriptor.
//!
//! A [`BuildEnv`] is computed from the build directory on every invocation.
//! It carries the derived paths (rootfs, logs, config link) plus the stable
//! schroot name for the directory, resolved from the installed config when
//! one is linked and freshly generated otherwise.

pub mod config;

use anyhow::{Context, Result};
use rand::Rng;
use std::path::{Path, PathBuf};

use crate::error::DebforgeError;
use config::SchrootConfig;

/// Users, groups, directories and chroot names all share this prefix.
pub const NAMESPACE: &str = "debforge";

/// System-wide schroot chroot-definition directory.
pub const SCHROOT_CONFIG_DIR: &str = "/etc/schroot/chroot.d";

/// schroot profile directory installed by `init`.
pub const SCHROOT_PROFILE_DIR: &str = "/etc/schroot/debforge";

/// Random suffix length for generated chroot names.
const NAME_SUFFIX_LEN: usize = 5;

/// Descriptor for one build directory.
#[derive(Debug, Clone)]
pub struct BuildEnv {
    /// The managed build directory.
    pub dir: PathBuf,
    /// Root filesystem created by debootstrap.
    pub root_dir: PathBuf,
    /// Build log directory.
    pub log_dir: PathBuf,
    /// Symlink inside `dir` pointing at the installed schroot config.
    pub config_link: PathBuf,
    /// The schroot config file under the system config directory.
    pub config_path: PathBuf,
    /// Stable schroot name for this directory.
    pub name: String,
    /// The config link exists (possibly dangling).
    pub has_config_link: bool,
    /// The config link exists and resolves to a readable config.
    pub has_config: bool,
}

impl BuildEnv {
    /// Resolve the descriptor for a build directory against the system
    /// schroot config directory.
    pub fn resolve(dir: &Path) -> Result<BuildEnv> {
        BuildEnv::resolve_in(dir, Path::new(SCHROOT_CONFIG_DIR))
    }

    /// Resolve against an explicit config directory.
    ///
    /// If the directory has a config symlink, the stable name is read from
    /// the linked config's `[name]` header. Otherwise a fresh unused
    /// name/config-path pair is generated. Generation is advisory only:
    /// concurrent invocations can race on the same candidate, which is
    /// accepted for the expected level of concurrency.
    pub fn resolve_in(dir: &Path, config_dir: &Path) -> Result<BuildEnv> {
        let config_link = dir.join("schroot.conf");
        let root_dir = dir.join("debootstrap-root");
        let log_dir = dir.join("logs");

        // symlink_metadata sees dangling links; the link target may have
        // been uninstalled behind our back.
        let has_config_link = config_link.symlink_metadata().is_ok();
        let has_config = config_link.exists();

        let mut config_path = None;
        let mut name = None;
        if has_config_link {
            let resolved = config_link.canonicalize().or_else(|_| {
                // Dangling link: keep the recorded target so uninstall can
                // still name it.
                std::fs::read_link(&config_link)
                    .with_context(|| format!("reading link '{}'", config_link.display()))
            })?;
            if has_config {
                name = SchrootConfig::load(&resolved).ok().map(|c| c.name);
            }
            config_path = Some(resolved);
        }

        // Missing link or unparseable name: generate a fresh pair. The
        // install step persists it; everything else treats it as a
        // candidate.
        let (config_path, name) = match (config_path, name) {
            (Some(path), Some(name)) => (path, name),
            _ => generate_unused_name(config_dir)?,
        };

        Ok(BuildEnv {
            dir: dir.to_path_buf(),
            root_dir,
            log_dir,
            config_link,
            config_path,
            name,
            has_config_link,
            has_config,
        })
    }

    /// Map a path inside the chroot to its location on the host.
    pub fn rootfs_path(&self, inner: &str) -> PathBuf {
        self.root_dir.join(inner.trim_start_matches('/'))
    }

    /// Marker file written after the base system bootstrap completes.
    /// Presence-only; the contents are never inspected.
    pub fn bootstrap_marker(&self) -> PathBuf {
        self.dir.join(".debootstrap-complete")
    }

    /// Verify that the installed config still describes this directory.
    ///
    /// Must pass before any schroot session is attempted. Fails with
    /// [`DebforgeError::NoDirectoryConfigured`] when the config has no
    /// `directory=` entry and [`DebforgeError::DirectoryMismatch`] when the
    /// recorded root filesystem differs from ours (directory moved without
    /// re-linking).
    pub fn check_configuration_linked(&self) -> Result<()> {
        let config = SchrootConfig::load(&self.config_path)?;
        let Some(configured) = config.directory() else {
            return Err(DebforgeError::NoDirectoryConfigured {
                config: self.config_path.display().to_string(),
            }
            .into());
        };
        if Path::new(configured.trim()) != self.root_dir {
            return Err(DebforgeError::DirectoryMismatch {
                config: self.config_path.display().to_string(),
                configured: configured.trim().to_string(),
                expected: self.root_dir.display().to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Render the chroot definition installed by `init`.
    pub fn schroot_config(&self) -> SchrootConfig {
        SchrootConfig {
            name: self.name.clone(),
            entries: vec![
                ("description".into(), "debforge build environment".into()),
                ("type".into(), "directory".into()),
                ("directory".into(), self.root_dir.display().to_string()),
                ("groups".into(), NAMESPACE.into()),
                ("root-groups".into(), NAMESPACE.into()),
                ("profile".into(), NAMESPACE.into()),
            ],
        }
    }
}

/// Find an unused `<namespace>_<xxxxx>.conf` name under `config_dir`.
///
/// Not safe under concurrent invocation; see [`BuildEnv::resolve_in`].
fn generate_unused_name(config_dir: &Path) -> Result<(PathBuf, String)> {
    let mut rng = rand::thread_rng();
    loop {
        let suffix: String = (0..NAME_SUFFIX_LEN)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        let name = format!("{NAMESPACE}_{suffix}");
        let candidate = config_dir.join(format!("{name}.conf"));
        if !candidate.exists() {
            return Ok((candidate, name));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn linked_env(dir: &TempDir, config_dir: &TempDir, root_override: Option<&str>) -> PathBuf {
        let root = root_override
            .map(PathBuf::from)
            .unwrap_or_else(|| dir.path().join("debootstrap-root"));
        let config_path = config_dir.path().join("debforge_fghij.conf");
        fs::write(
            &config_path,
            format!(
                "[debforge_fghij]\ntype=directory\ndirectory={}\n",
                root.display()
            ),
        )
        .unwrap();
        symlink(&config_path, dir.path().join("schroot.conf")).unwrap();
        config_path
    }

    #[test]
    fn resolve_unconfigured_directory_generates_fresh_name() {
        let dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        let env = BuildEnv::resolve_in(dir.path(), config_dir.path()).unwrap();

        assert!(!env.has_config_link);
        assert!(!env.has_config);
        let suffix = env.name.strip_prefix("debforge_").expect("namespace prefix");
        assert_eq!(suffix.len(), 5);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase()));
        assert_eq!(
            env.config_path,
            config_dir.path().join(format!("{}.conf", env.name))
        );
        assert_eq!(env.root_dir, dir.path().join("debootstrap-root"));
    }

    #[test]
    fn resolve_reads_name_from_linked_config() {
        let dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        let config_path = linked_env(&dir, &config_dir, None);

        let env = BuildEnv::resolve_in(dir.path(), config_dir.path()).unwrap();
        assert!(env.has_config_link);
        assert!(env.has_config);
        assert_eq!(env.name, "debforge_fghij");
        assert_eq!(env.config_path, config_path.canonicalize().unwrap());
    }

    #[test]
    fn check_configuration_linked_accepts_matching_root() {
        let dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        linked_env(&dir, &config_dir, None);

        let env = BuildEnv::resolve_in(dir.path(), config_dir.path()).unwrap();
        env.check_configuration_linked().unwrap();
    }

    #[test]
    fn moved_directory_is_a_configuration_integrity_error() {
        let dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        // Config still records the rootfs of the original location.
        linked_env(&dir, &config_dir, Some("/somewhere/else/debootstrap-root"));

        let env = BuildEnv::resolve_in(dir.path(), config_dir.path()).unwrap();
        let err = env.check_configuration_linked().unwrap_err();
        match err.downcast_ref::<DebforgeError>() {
            Some(DebforgeError::DirectoryMismatch { configured, .. }) => {
                assert_eq!(configured, "/somewhere/else/debootstrap-root");
            }
            other => panic!("expected DirectoryMismatch, got {other:?}"),
        }
    }

    #[test]
    fn config_without_directory_is_distinct_integrity_error() {
        let dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        let config_path = config_dir.path().join("debforge_fghij.conf");
        fs::write(&config_path, "[debforge_fghij]\ntype=directory\n").unwrap();
        symlink(&config_path, dir.path().join("schroot.conf")).unwrap();

        let env = BuildEnv::resolve_in(dir.path(), config_dir.path()).unwrap();
        let err = env.check_configuration_linked().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DebforgeError>(),
            Some(DebforgeError::NoDirectoryConfigured { .. })
        ));
    }

    #[test]
    fn rootfs_path_maps_absolute_chroot_paths() {
        let dir = TempDir::new().unwrap();
        let config_dir = TempDir::new().unwrap();
        let env = BuildEnv::resolve_in(dir.path(), config_dir.path()).unwrap();
        assert_eq!(
            env.rootfs_path("/var/lib/debforge/site/ssh/id_rsa"),
            env.root_dir.join("var/lib/debforge/site/ssh/id_rsa")
        );
    }

    #[test]
    fn generated_names_skip_existing_config_files() {
        let config_dir = TempDir::new().unwrap();
        // Flood the namespace is impractical; instead verify the candidate
        // returned does not exist.
        let (path, name) = generate_unused_name(config_dir.path()).unwrap();
        assert!(!path.exists());
        assert!(name.starts_with("debforge_"));
    }
}
