//! rollcall-store — SQLite persistence for the enrolled roster and the
//! append-only attendance session log.

pub mod sqlite;

pub use sqlite::{SqliteStore, SqliteStoreError};
