//! Orchestration of the provisioning operations.
//!
//! Each operation sequences the descriptor resolver, session manager,
//! registry and external tools. The CLI calls these and nothing else.

mod install;
mod software;
mod uninstall;
mod variant;

pub use install::{install, InstallOptions};
pub use software::add_software;
pub use uninstall::uninstall;
pub use variant::add_variant;

use anyhow::Result;
use std::path::Path;
use tracing::debug;

use crate::env::BuildEnv;
use crate::error::DebforgeError;
use crate::registry::conn::ConnectionInfo;
use crate::registry::VariantRegistry;
use crate::status::{gather_status, StatusReport};

/// Current state of a build directory plus its software and variants.
///
/// A registry that cannot be reached is reported as the corresponding
/// lifecycle state, not as a hard failure; `status` must work against a
/// half-provisioned directory.
pub fn get_status(dir: &Path, db: Option<&ConnectionInfo>) -> Result<StatusReport> {
    let env = BuildEnv::resolve(dir)?;
    let registry = match db {
        Some(info) => match VariantRegistry::connect(info) {
            Ok(registry) => Some(registry),
            Err(err)
                if matches!(
                    err.downcast_ref::<DebforgeError>(),
                    Some(DebforgeError::RegistryUnreachable { .. })
                ) =>
            {
                debug!(%err, "variant registry unreachable");
                None
            }
            Err(err) => return Err(err),
        },
        None => None,
    };
    gather_status(&env, registry.as_ref(), db.map(|info| info.to_string()))
}
