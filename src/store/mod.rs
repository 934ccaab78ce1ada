//! SQLite persistence for queue items, server health and manifests

pub mod error;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use sqlite::SqliteStore;
