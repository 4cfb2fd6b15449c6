//! Persistence for the CLI.
//!
//! The engine only needs a [`KvStore`](cidgate_core::KvStore) and a
//! [`FileStore`](cidgate_core::FileStore); [`sqlite::SqliteStore`] provides
//! both over one SQLite database.

pub mod sqlite;

fn backend(err: sqlx::Error) -> cidgate_core::StoreError {
    cidgate_core::StoreError::Backend(err.to_string())
}
