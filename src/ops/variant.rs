//! The `variant` operation: register a software variant.
//!
//! The id is computed optimistically (`max + 1`) and never reserved; if a
//! concurrent invocation wins the race, the insert fails on the storage
//! constraints and this command is simply rerun. Records are never updated
//! in place.

use anyhow::Result;
use tracing::info;

use crate::registry::{VariantRecord, VariantRegistry};

/// Register the variant `key` for `software`, deriving its resource
/// identifiers from the next free id.
///
/// Re-running for an already-registered pair is a no-op returning the
/// existing record.
pub fn add_variant(
    registry: &VariantRegistry,
    software: &str,
    key: &str,
) -> Result<VariantRecord> {
    if let Some(existing) = registry.get(software, key)? {
        info!(software, key, id = existing.id, "variant already registered");
        return Ok(existing);
    }

    let id = registry.next_id()?;
    let record = VariantRecord::derive(id, software, key);
    registry.put(&record)?;
    info!(software, key, id, port = record.port, "added variant");
    Ok(record)
}
