//! Persistence seams.
//!
//! [`KvStore`] is the local key-value backend every persisted blob goes
//! through; [`FileStore`] is the file-record collaborator the verification
//! scheduler patches. Both ship with in-memory implementations. The
//! `cidgate` binary provides SQLite-backed ones.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cidgate_types::{FilePatch, FileRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{GatewayError, StoreError};

/// Persisted keys.
pub mod keys {
    pub const CATALOGUE: &str = "cidgate.catalogue";
    pub const HEALTH: &str = "cidgate.health";
    pub const PROBE_RUN: &str = "cidgate.probe_run";
    pub const REGION: &str = "cidgate.region";
    pub const REMOVED_BUILTINS: &str = "cidgate.removed_builtins";
    pub const VERIFY_RETRY: &str = "cidgate.verify_retry";
}

/// String key-value persistence.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Read and decode a JSON blob.
///
/// Missing, unreadable and unparsable blobs all come back as `None`.
pub async fn load_json<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Option<T> {
    let raw = match store.get(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(key, error = %e, "failed to read persisted state; treating as absent");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, error = %e, "persisted state is not valid JSON; treating as absent");
            None
        }
    }
}

pub async fn save_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), GatewayError> {
    let raw = serde_json::to_string(value)?;
    store.put(key, raw).await?;
    Ok(())
}

/// In-process [`KvStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
    /// Maximum value length accepted by `put`, to exercise quota handling.
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            inner: Arc::default(),
            quota: Some(quota),
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        if let Some(quota) = self.quota
            && value.len() > quota
        {
            return Err(StoreError::QuotaExceeded { key: key.to_owned() });
        }
        self.inner.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

/// The file-record collaborator.
#[async_trait]
pub trait FileStore: Send + Sync + 'static {
    async fn get(&self, id: &str) -> Result<Option<FileRecord>, StoreError>;
    async fn list(&self) -> Result<Vec<FileRecord>, StoreError>;
    async fn upsert(&self, record: FileRecord) -> Result<(), StoreError>;
    /// Apply `patch` and return the updated record, or `None` if the file is gone.
    async fn apply_patch(
        &self,
        id: &str,
        patch: &FilePatch,
    ) -> Result<Option<FileRecord>, StoreError>;
}

/// In-process [`FileStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFileStore {
    inner: Arc<RwLock<HashMap<String, FileRecord>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remove(&self, id: &str) -> Option<FileRecord> {
        self.inner.write().await.remove(id)
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn get(&self, id: &str) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.inner.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<FileRecord>, StoreError> {
        let mut files: Vec<FileRecord> = self.inner.read().await.values().cloned().collect();
        files.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(files)
    }

    async fn upsert(&self, record: FileRecord) -> Result<(), StoreError> {
        self.inner.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn apply_patch(
        &self,
        id: &str,
        patch: &FilePatch,
    ) -> Result<Option<FileRecord>, StoreError> {
        let mut guard = self.inner.write().await;
        let Some(record) = guard.get_mut(id) else {
            return Ok(None);
        };
        record.apply(patch, crate::now_ms());
        Ok(Some(record.clone()))
    }
}
