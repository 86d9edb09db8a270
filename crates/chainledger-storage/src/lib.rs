//! chainledger-storage — pluggable storage backends for ChainLedger.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - [`file`] — JSON snapshots with atomic rename (default durable backend)
//! - `sqlite` — SQLite via `sqlx` (feature `sqlite`)
//!
//! Every backend implements `CheckpointStore`, `RegistryStore`, `ReplayGuard`,
//! `LedgerStore` and `OutboundStore`, so one instance can back a whole node.

#[cfg(feature = "file")]
pub mod file;
#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "file")]
pub use file::{FileStorage, FileStoreError};
#[cfg(feature = "memory")]
pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
