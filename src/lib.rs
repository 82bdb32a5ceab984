//! Isolated Debian build environments for packaging software variants.
//!
//! debforge provisions a debootstrap rootfs, registers it with schroot so
//! unprivileged group members can enter it, mirrors software repositories
//! into it, and tracks per-variant resource identifiers (schema names,
//! search indexes, cache partitions, service ports) in a shared Postgres
//! registry with storage-enforced uniqueness.
//!
//! # Architecture
//!
//! ```text
//! ops (install / uninstall / software / variant / status)
//!     │
//!     ├── env        build-directory descriptor + schroot config
//!     ├── session    schroot session guard (+ ssh-agent scope)
//!     ├── registry   variant table over Postgres
//!     ├── status     lifecycle state, recomputed per query
//!     ├── exec       external process execution
//!     └── preflight  host tool validation
//! ```
//!
//! Everything the tool does to a system goes through external collaborators
//! (debootstrap, schroot, git, ssh-agent); the logic worth testing lives in
//! the descriptor resolution, the config format, the registry constraints
//! and the state tracking.

pub mod env;
pub mod error;
pub mod exec;
pub mod ops;
pub mod preflight;
pub mod registry;
pub mod session;
pub mod status;

pub use env::BuildEnv;
pub use error::DebforgeError;
pub use registry::conn::ConnectionInfo;
pub use registry::{VariantRecord, VariantRegistry};
