//! ibcindex-storage: read-model storage backends for ibcindex.
//!
//! Backends:
//! - [`memory`]: in-memory (dev/testing, no persistence)
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)
//!
//! Both implement [`ReadModelStore`](ibcindex_core::store::ReadModelStore)
//! and [`CheckpointStore`](ibcindex_core::checkpoint::CheckpointStore).

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStorage;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
