//! Variant registry.
//!
//! Persistent store mapping `(software, key)` to the resource identifiers
//! derived for that variant. Uniqueness is enforced by the storage layer,
//! not just checked in application code: the table carries a UNIQUE
//! constraint per derived identifier, so a skipped duplicate check still
//! cannot corrupt the registry. Ids, ports and partition numbers must never
//! collide across software products.
//!
//! All SQL is runtime-checked (`sqlx::query`, never the compile-time
//! macros). The registry owns a current-thread tokio runtime so callers get
//! a plain blocking API; the tool is single-threaded by design.

pub mod conn;

use anyhow::{Context, Result};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

use crate::error::DebforgeError;
use conn::ConnectionInfo;

/// Base port; a variant's service port is `PORT_BASE + id`.
const PORT_BASE: i32 = 4000;

/// One registered variant with its derived resource identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantRecord {
    /// Globally unique numeric id, assigned `max + 1`.
    pub id: i32,
    pub software: String,
    /// Variant key, unique per software.
    pub key: String,
    /// Human-readable display name.
    pub name: String,
    /// Subdomain the variant is served under.
    pub subdomain: String,
    /// Database schema name for the variant's own data.
    pub schema_name: String,
    /// Search-index name.
    pub index_name: String,
    /// Cache partition number.
    pub cache_partition: i32,
    /// Service port.
    pub port: i32,
}

impl VariantRecord {
    /// Derive a record from an id and the `(software, key)` pair.
    ///
    /// The derivation is fixed for now; per-software hooks can replace it
    /// later without touching the storage layer.
    pub fn derive(id: i32, software: &str, key: &str) -> VariantRecord {
        VariantRecord {
            id,
            software: software.to_string(),
            key: key.to_string(),
            name: key.to_string(),
            subdomain: key.to_string(),
            schema_name: format!("{software}_{key}"),
            index_name: key.to_string(),
            cache_partition: id,
            port: PORT_BASE + id,
        }
    }
}

/// Blocking handle to the variant table.
pub struct VariantRegistry {
    pool: PgPool,
    runtime: Runtime,
}

impl VariantRegistry {
    /// Connect to the registry server.
    ///
    /// An unreachable server is [`DebforgeError::RegistryUnreachable`] —
    /// deliberately distinct from a reachable server whose variant table
    /// does not exist yet.
    pub fn connect(info: &ConnectionInfo) -> Result<VariantRegistry> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("building registry runtime")?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(1)
                    .connect(info.dsn()),
            )
            .map_err(|source| DebforgeError::RegistryUnreachable { source })?;
        debug!(registry = %info, "connected to variant registry");
        Ok(VariantRegistry { pool, runtime })
    }

    /// Create the variant table with all uniqueness constraints if absent.
    pub fn ensure_schema(&self) -> Result<()> {
        self.runtime
            .block_on(
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS variant (
                        id              INTEGER NOT NULL UNIQUE,
                        software        TEXT    NOT NULL,
                        key             TEXT    NOT NULL,
                        name            TEXT    NOT NULL,
                        subdomain       TEXT    NOT NULL UNIQUE,
                        schema_name     TEXT    NOT NULL UNIQUE,
                        index_name      TEXT    NOT NULL UNIQUE,
                        cache_partition INTEGER NOT NULL UNIQUE,
                        port            INTEGER NOT NULL UNIQUE,
                        PRIMARY KEY (software, key)
                    )
                    "#,
                )
                .execute(&self.pool),
            )
            .context("creating variant table")?;
        Ok(())
    }

    /// Whether the variant table exists.
    pub fn exists(&self) -> Result<bool> {
        let row = self
            .runtime
            .block_on(
                sqlx::query("SELECT to_regclass('variant') IS NOT NULL AS present")
                    .fetch_one(&self.pool),
            )
            .context("checking for variant table")?;
        Ok(row.get::<bool, _>("present"))
    }

    /// Next free id: `max(id) + 1`, or 1 on an empty registry.
    ///
    /// This is a hint, not a reservation. Concurrent callers can compute
    /// the same value; the loser's `put` fails on the id constraint and the
    /// caller reruns with a fresh hint. Deliberately not retried here.
    pub fn next_id(&self) -> Result<i32> {
        let row = self
            .runtime
            .block_on(
                sqlx::query("SELECT COALESCE(MAX(id), 0) + 1 AS next FROM variant")
                    .fetch_one(&self.pool),
            )
            .map_err(map_missing_table)
            .context("computing next variant id")?;
        Ok(row.get::<i32, _>("next"))
    }

    /// Look up a variant by `(software, key)`.
    pub fn get(&self, software: &str, key: &str) -> Result<Option<VariantRecord>> {
        let row = self
            .runtime
            .block_on(
                sqlx::query(
                    "SELECT id, software, key, name, subdomain, schema_name, \
                            index_name, cache_partition, port \
                     FROM variant WHERE software = $1 AND key = $2",
                )
                .bind(software)
                .bind(key)
                .fetch_optional(&self.pool),
            )
            .map_err(map_missing_table)
            .with_context(|| format!("loading variant '{software}/{key}'"))?;
        Ok(row.map(|r| record_from_row(&r)))
    }

    /// Insert a new variant record.
    ///
    /// Any violated uniqueness constraint — the `(software, key)` pair, the
    /// id, or one of the derived identifiers — surfaces as
    /// [`DebforgeError::DuplicateVariant`]. Never updates in place.
    pub fn put(&self, record: &VariantRecord) -> Result<()> {
        let result = self.runtime.block_on(
            sqlx::query(
                "INSERT INTO variant \
                     (id, software, key, name, subdomain, schema_name, \
                      index_name, cache_partition, port) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(record.id)
            .bind(&record.software)
            .bind(&record.key)
            .bind(&record.name)
            .bind(&record.subdomain)
            .bind(&record.schema_name)
            .bind(&record.index_name)
            .bind(record.cache_partition)
            .bind(record.port)
            .execute(&self.pool),
        );
        match result {
            Ok(_) => {
                debug!(
                    software = %record.software,
                    key = %record.key,
                    id = record.id,
                    "variant registered"
                );
                Ok(())
            }
            Err(err) if is_unique_violation(&err) => Err(DebforgeError::DuplicateVariant {
                software: record.software.clone(),
                key: record.key.clone(),
                detail: err
                    .as_database_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| err.to_string()),
            }
            .into()),
            Err(err) => Err(map_missing_table(err)).with_context(|| {
                format!("inserting variant '{}/{}'", record.software, record.key)
            }),
        }
    }

    /// All registered variants, ordered by key.
    pub fn list_all(&self) -> Result<Vec<VariantRecord>> {
        let rows = self
            .runtime
            .block_on(
                sqlx::query(
                    "SELECT id, software, key, name, subdomain, schema_name, \
                            index_name, cache_partition, port \
                     FROM variant ORDER BY key",
                )
                .fetch_all(&self.pool),
            )
            .map_err(map_missing_table)
            .context("listing variants")?;
        Ok(rows.iter().map(record_from_row).collect())
    }
}

fn record_from_row(row: &PgRow) -> VariantRecord {
    VariantRecord {
        id: row.get("id"),
        software: row.get("software"),
        key: row.get("key"),
        name: row.get("name"),
        subdomain: row.get("subdomain"),
        schema_name: row.get("schema_name"),
        index_name: row.get("index_name"),
        cache_partition: row.get("cache_partition"),
        port: row.get("port"),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

/// Map "relation does not exist" onto the uninitialized-registry error so
/// callers can tell an empty server from an unreachable one.
fn map_missing_table(err: sqlx::Error) -> anyhow::Error {
    if let Some(db) = err.as_database_error() {
        // 42P01 = undefined_table
        if db.code().as_deref() == Some("42P01") {
            return DebforgeError::RegistryUninitialized.into();
        }
    }
    err.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_uses_the_fixed_algorithm() {
        let record = VariantRecord::derive(7, "shopd", "berlin");
        assert_eq!(record.id, 7);
        assert_eq!(record.schema_name, "shopd_berlin");
        assert_eq!(record.index_name, "berlin");
        assert_eq!(record.subdomain, "berlin");
        assert_eq!(record.cache_partition, 7);
        assert_eq!(record.port, 4007);
        assert_eq!(record.name, "berlin");
    }

    /// Live-database tests. Skipped unless pointed at a scratch Postgres:
    ///
    /// ```sh
    /// DEBFORGE_TEST_DATABASE=postgres://localhost/debforge_test \
    ///     cargo test -- --ignored
    /// ```
    mod live {
        use super::*;

        fn test_registry() -> VariantRegistry {
            let uri = std::env::var("DEBFORGE_TEST_DATABASE")
                .expect("DEBFORGE_TEST_DATABASE must point at a scratch database");
            let info = ConnectionInfo::parse(&uri).unwrap();
            let registry = VariantRegistry::connect(&info).unwrap();
            registry
                .runtime
                .block_on(sqlx::query("DROP TABLE IF EXISTS variant").execute(&registry.pool))
                .unwrap();
            registry.ensure_schema().unwrap();
            registry
        }

        #[test]
        #[ignore = "requires DEBFORGE_TEST_DATABASE"]
        fn next_id_starts_at_one_and_follows_max() {
            let registry = test_registry();
            assert_eq!(registry.next_id().unwrap(), 1);
            registry
                .put(&VariantRecord::derive(1, "shopd", "berlin"))
                .unwrap();
            assert_eq!(registry.next_id().unwrap(), 2);
        }

        #[test]
        #[ignore = "requires DEBFORGE_TEST_DATABASE"]
        fn put_then_get_round_trips() {
            let registry = test_registry();
            let record = VariantRecord::derive(3, "shopd", "hamburg");
            registry.put(&record).unwrap();
            let loaded = registry.get("shopd", "hamburg").unwrap().unwrap();
            assert_eq!(loaded, record);
            assert!(registry.get("shopd", "munich").unwrap().is_none());
        }

        #[test]
        #[ignore = "requires DEBFORGE_TEST_DATABASE"]
        fn duplicate_software_key_pair_is_rejected() {
            let registry = test_registry();
            registry
                .put(&VariantRecord::derive(1, "shopd", "berlin"))
                .unwrap();
            let err = registry
                .put(&VariantRecord::derive(2, "shopd", "berlin"))
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DebforgeError>(),
                Some(DebforgeError::DuplicateVariant { .. })
            ));
        }

        #[test]
        #[ignore = "requires DEBFORGE_TEST_DATABASE"]
        fn colliding_derived_port_is_rejected() {
            let registry = test_registry();
            registry
                .put(&VariantRecord::derive(1, "shopd", "berlin"))
                .unwrap();
            // Different software and key, same id-derived port/partition.
            let mut clashing = VariantRecord::derive(2, "blogd", "paris");
            clashing.port = 4001;
            let err = registry.put(&clashing).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<DebforgeError>(),
                Some(DebforgeError::DuplicateVariant { .. })
            ));
        }

        #[test]
        #[ignore = "requires DEBFORGE_TEST_DATABASE"]
        fn list_all_orders_by_key() {
            let registry = test_registry();
            registry
                .put(&VariantRecord::derive(1, "shopd", "munich"))
                .unwrap();
            registry
                .put(&VariantRecord::derive(2, "shopd", "berlin"))
                .unwrap();
            let keys: Vec<String> = registry
                .list_all()
                .unwrap()
                .into_iter()
                .map(|r| r.key)
                .collect();
            assert_eq!(keys, ["berlin", "munich"]);
        }
    }
}
