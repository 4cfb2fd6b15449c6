//! SQLite implementation of [`KvStore`] and [`FileStore`].
//!
//! Migrations are embedded at compile time from `./migrations` and run by
//! [`SqliteStore::connect`]. Queries use the runtime-checked `sqlx::query`
//! form so no `DATABASE_URL` is needed to build.

use std::str::FromStr;

use async_trait::async_trait;
use cidgate_core::types::{FilePatch, FileRecord, VerifyStatus};
use cidgate_core::{FileStore, KvStore, StoreError};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::backend;

type FileRow = (
    String,
    String,
    String,
    Option<String>,
    bool,
    String,
    Option<String>,
    Option<i64>,
);

const FILE_COLUMNS: &str =
    "id, name, cid, hash, verified, verify_status, verify_message, verify_updated_at";

fn file_from_row(row: FileRow) -> FileRecord {
    let (id, name, cid, hash, verified, status, verify_message, verify_updated_at) = row;
    FileRecord {
        id,
        name,
        cid,
        hash,
        verified,
        verify_status: status.parse::<VerifyStatus>().unwrap_or_default(),
        verify_message,
        verify_updated_at,
    }
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and run pending migrations.
    ///
    /// `url` is a sqlx SQLite URL such as `"sqlite://cidgate.db"` or
    /// `"sqlite::memory:"`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every in-memory connection is its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let updated_at = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
        )
        .bind(key)
        .bind(value)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }
}

// ── FileStore ─────────────────────────────────────────────────────────────────

#[async_trait]
impl FileStore for SqliteStore {
    async fn get(&self, id: &str) -> Result<Option<FileRecord>, StoreError> {
        let row: Option<FileRow> =
            sqlx::query_as(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        Ok(row.map(file_from_row))
    }

    async fn list(&self) -> Result<Vec<FileRecord>, StoreError> {
        let rows: Vec<FileRow> =
            sqlx::query_as(&format!("SELECT {FILE_COLUMNS} FROM files ORDER BY id"))
                .fetch_all(&self.pool)
                .await
                .map_err(backend)?;
        Ok(rows.into_iter().map(file_from_row).collect())
    }

    async fn upsert(&self, record: FileRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO files \
             (id, name, cid, hash, verified, verify_status, verify_message, verify_updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO UPDATE \
             SET name = ?2, cid = ?3, hash = ?4, verified = ?5, verify_status = ?6, \
                 verify_message = ?7, verify_updated_at = ?8",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.cid)
        .bind(&record.hash)
        .bind(record.verified)
        .bind(record.verify_status.to_string())
        .bind(&record.verify_message)
        .bind(record.verify_updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn apply_patch(
        &self,
        id: &str,
        patch: &FilePatch,
    ) -> Result<Option<FileRecord>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let row: Option<FileRow> =
            sqlx::query_as(&format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(backend)?;
        let Some(mut record) = row.map(file_from_row) else {
            return Ok(None);
        };
        record.apply(patch, chrono::Utc::now().timestamp_millis());

        sqlx::query(
            "UPDATE files SET verified = ?1, verify_status = ?2, verify_message = ?3, \
             verify_updated_at = ?4 WHERE id = ?5",
        )
        .bind(record.verified)
        .bind(record.verify_status.to_string())
        .bind(&record.verify_message)
        .bind(record.verify_updated_at)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;
        tx.commit().await.map_err(backend)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn kv_upserts_and_deletes() {
        let db = store().await;
        assert_eq!(KvStore::get(&db, "k").await.unwrap(), None);

        db.put("k", "one".into()).await.unwrap();
        db.put("k", "two".into()).await.unwrap();
        assert_eq!(KvStore::get(&db, "k").await.unwrap().as_deref(), Some("two"));

        db.delete("k").await.unwrap();
        assert_eq!(KvStore::get(&db, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_patches_round_through_the_table() {
        let db = store().await;
        db.upsert(FileRecord::new("f1", "QmFile").with_hash("ABCD"))
            .await
            .unwrap();
        assert!(
            db.apply_patch("missing", &FilePatch::status(VerifyStatus::Ok, "x"))
                .await
                .unwrap()
                .is_none()
        );

        let patched = db
            .apply_patch("f1", &FilePatch::status(VerifyStatus::Ok, "Available"))
            .await
            .unwrap()
            .unwrap();
        assert!(patched.verified);
        assert!(patched.verify_updated_at.is_some());

        let stored = FileStore::get(&db, "f1").await.unwrap().unwrap();
        assert_eq!(stored, patched);
        assert_eq!(stored.hash.as_deref(), Some("ABCD"));
        assert_eq!(db.list().await.unwrap().len(), 1);
    }
}
