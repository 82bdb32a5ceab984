//! Lifecycle state tracking.
//!
//! The provisioning state of a build directory is never stored anywhere; it
//! is recomputed on every query from observable facts: is a schroot config
//! linked, has debootstrap finished (marker file), is the variant registry
//! reachable and does its table exist. [`compute_state`] returns the set of
//! achieved stages and [`summary`] collapses it into the human-readable
//! line, worst gap first.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use walkdir::WalkDir;

use crate::env::{BuildEnv, NAMESPACE};
use crate::registry::VariantRegistry;

/// Observable provisioning stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// schroot config linked into the build directory.
    Config,
    /// debootstrap completed (marker file present).
    Bootstrap,
    /// Variant registry connection established.
    RegistryReachable,
    /// Variant table exists in the registry.
    RegistryInitialized,
}

/// Compute the achieved stages for a build directory.
///
/// `registry` is the result of the caller's connection attempt: `None`
/// means the registry was unreachable (or no connection string was given),
/// which is deliberately distinct from a reachable but uninitialized one.
pub fn compute_state(
    env: &BuildEnv,
    registry: Option<&VariantRegistry>,
) -> Result<BTreeSet<Stage>> {
    let mut stages = BTreeSet::new();
    if env.has_config {
        stages.insert(Stage::Config);
    }
    if env.bootstrap_marker().exists() {
        stages.insert(Stage::Bootstrap);
    }
    if let Some(registry) = registry {
        stages.insert(Stage::RegistryReachable);
        if registry.exists()? {
            stages.insert(Stage::RegistryInitialized);
        }
    }
    Ok(stages)
}

/// Human-readable summary for a stage set, in priority order.
pub fn summary(stages: &BTreeSet<Stage>) -> &'static str {
    if !stages.contains(&Stage::Config) {
        "not initialized"
    } else if !stages.contains(&Stage::Bootstrap) {
        "partially initialized: chroot configured, no debootstrap"
    } else if !stages.contains(&Stage::RegistryReachable) {
        "partially initialized: unable to connect to variant database"
    } else if !stages.contains(&Stage::RegistryInitialized) {
        "partially initialized: variant database not configured"
    } else {
        "initialized"
    }
}

/// Everything `debforge status` reports.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub root_dir: String,
    /// Redacted connection string, when one was given.
    pub database: Option<String>,
    pub stages: BTreeSet<Stage>,
    pub summary: &'static str,
    /// software -> cloned repository names.
    pub software: BTreeMap<String, Vec<String>>,
    /// software -> variant keys. `None` when the registry was not readable.
    pub variants: Option<BTreeMap<String, Vec<String>>>,
}

/// Gather the full status report.
pub fn gather_status(
    env: &BuildEnv,
    registry: Option<&VariantRegistry>,
    database: Option<String>,
) -> Result<StatusReport> {
    let stages = compute_state(env, registry)?;

    let software = if stages.contains(&Stage::Bootstrap) {
        scan_software(&env.root_dir)?
    } else {
        BTreeMap::new()
    };

    let variants = match registry {
        Some(registry) if stages.contains(&Stage::RegistryInitialized) => {
            let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for record in registry.list_all()? {
                grouped.entry(record.software).or_default().push(record.key);
            }
            Some(grouped)
        }
        _ => None,
    };

    Ok(StatusReport {
        root_dir: env.root_dir.display().to_string(),
        database,
        summary: summary(&stages),
        stages,
        software,
        variants,
    })
}

/// List cloned repositories per software by scanning the rootfs.
///
/// Layout inside the chroot: `/var/lib/debforge/<software>/repository/*.git`.
/// Scanned from the host side; no session is needed to answer `status`.
fn scan_software(root_dir: &Path) -> Result<BTreeMap<String, Vec<String>>> {
    let base = root_dir.join("var/lib").join(NAMESPACE);
    let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if !base.is_dir() {
        return Ok(result);
    }
    // Depth 2 is a software's `repository` dir, depth 3 its mirror clones.
    for entry in WalkDir::new(&base).min_depth(2).max_depth(3) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        match entry.depth() {
            2 => {
                if path.file_name().and_then(|n| n.to_str()) == Some("repository") {
                    if let Some(software) = dir_name(path.parent()) {
                        result.entry(software).or_default();
                    }
                }
            }
            3 => {
                let parent = path.parent();
                if dir_name(parent).as_deref() != Some("repository")
                    || path.extension().and_then(|e| e.to_str()) != Some("git")
                {
                    continue;
                }
                let software = dir_name(parent.and_then(Path::parent));
                let stem = path.file_stem().and_then(|s| s.to_str());
                if let (Some(software), Some(stem)) = (software, stem) {
                    result.entry(software).or_default().push(stem.to_string());
                }
            }
            _ => {}
        }
    }
    for repos in result.values_mut() {
        repos.sort();
    }
    Ok(result)
}

fn dir_name(path: Option<&Path>) -> Option<String> {
    path.and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .map(str::to_string)
}
