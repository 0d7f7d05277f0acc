//! ledgerindex-storage — pluggable storage backends for LedgerIndex.
//!
//! Backends:
//! - [`memory`]: in-memory store and cache (dev/testing, no persistence)
//! - `sqlite`: SQLite via `sqlx` (embedded, single-file persistence)
//! - `postgres`: PostgreSQL via `sqlx` (shared, multi-process deployments)
//!
//! Every backend implements `ledgerindex_core::IndexStore`.

pub mod memory {
    //! In-memory backend, re-exported from `ledgerindex-core` so tests and
    //! ephemeral runs can pick it through the same crate as the SQL backends.
    pub use ledgerindex_core::memory::{CacheStats, MemoryCache, MemoryStore};
}

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{MemoryCache, MemoryStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStorage};
