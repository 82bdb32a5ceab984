//! Recognized error kinds.
//!
//! Most of the crate reports failures through `anyhow` with context, the way
//! the surrounding I/O code reads. The kinds below are the ones the CLI is
//! expected to recognize: they render as a single short message and a
//! dedicated exit status instead of an error chain.

use thiserror::Error;

/// Errors with user-facing semantics.
///
/// Everything else (unexpected I/O, malformed external state) stays an
/// `anyhow::Error` and exits with the generic failure status.
#[derive(Debug, Error)]
pub enum DebforgeError {
    /// The linked schroot config has no `directory=` entry.
    #[error("no directory configured in '{config}', schroot will probably not work")]
    NoDirectoryConfigured { config: String },

    /// The linked schroot config points at a different root filesystem.
    /// Typically the build directory was moved after `init`.
    #[error(
        "configuration '{config}' does not match build directory: \
         configured '{configured}', expected '{expected}'. \
         Has the directory been moved? Rerun the init command as root"
    )]
    DirectoryMismatch {
        config: String,
        configured: String,
        expected: String,
    },

    /// A registry connection string was rejected. Always quotes the literal.
    #[error("invalid database connection string '{uri}': {reason}")]
    ConnectionString { uri: String, reason: String },

    /// The registry server could not be reached at all. Distinct from a
    /// reachable server whose variant table has not been created yet.
    #[error("unable to connect to variant database: {source}")]
    RegistryUnreachable {
        #[source]
        source: sqlx::Error,
    },

    /// The registry is reachable but `ensure_schema` has never run.
    #[error("variant database not configured")]
    RegistryUninitialized,

    /// The storage layer rejected an insert on a uniqueness constraint.
    /// Never retried automatically; recompute the id and rerun.
    #[error("variant '{software}/{key}' collides with an existing record: {detail}")]
    DuplicateVariant {
        software: String,
        key: String,
        detail: String,
    },

    /// An external tool exited nonzero. Propagated without inspection.
    #[error("{program} failed with {status}")]
    ToolFailed { program: String, status: String },

    /// `ssh-agent` printed something other than its two assignment lines.
    #[error("unexpected ssh-agent output, cannot extract {variable}")]
    AgentOutput { variable: &'static str },

    /// Required host packages are missing.
    #[error("please install the following required packages:\napt-get install {packages}")]
    MissingTools { packages: String },

    /// The invoking user is not in the access group.
    #[error("your user is not a member of the '{group}' group")]
    NotInGroup { group: String },

    /// A config/link operation needed more privileges.
    #[error("{action}: insufficient permission. Maybe try as root?")]
    Permission { action: String, exit_code: i32 },

    /// Open schroot sessions block uninstall.
    #[error("there are open schroot sessions for this build directory:\n{listing}")]
    OpenSessions { listing: String },
}

impl DebforgeError {
    /// Exit status the CLI uses for this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            DebforgeError::OpenSessions { .. } => 1,
            DebforgeError::Permission { exit_code, .. } => *exit_code,
            DebforgeError::MissingTools { .. } => 4,
            DebforgeError::NotInGroup { .. } => 6,
            _ => 1,
        }
    }
}
