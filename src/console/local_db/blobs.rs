//! # Blob Operations
//!
//! Keyed blob storage on top of the `blobs` table, plus JSON helpers used by
//! the cache and the queue.

use crate::console::local_db::LocalDatabase;
use crate::shared::{CollectionName, SyncResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::Row;

/// Key prefix of persisted collections
pub const COLLECTION_PREFIX: &str = "collection:";

/// Key prefix of queued resource bytes
pub const RESOURCE_PREFIX: &str = "resource:";

/// Key prefix of queued resource metadata
pub const RESOURCE_META_PREFIX: &str = "resource_meta:";

/// Key of the persisted sync queue
pub const QUEUE_KEY: &str = "sync_queue";

/// Blob key for a collection snapshot
pub fn collection_key(collection: &CollectionName) -> String {
    format!("{}{}", COLLECTION_PREFIX, collection)
}

/// Blob key for the bytes of a pending resource
pub fn resource_key(resource_id: &str) -> String {
    format!("{}{}", RESOURCE_PREFIX, resource_id)
}

/// Blob key for the metadata of a pending resource
pub fn resource_meta_key(resource_id: &str) -> String {
    format!("{}{}", RESOURCE_META_PREFIX, resource_id)
}

impl LocalDatabase {
    /// Insert or replace a blob
    pub async fn put_blob(&self, key: &str, value: &[u8]) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO blobs (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Fetch a blob
    pub async fn get_blob(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM blobs WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    /// Delete a blob; returns whether it existed
    pub async fn delete_blob(&self, key: &str) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM blobs WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Keys starting with `prefix`, sorted
    ///
    /// Matched literally; `_` and `%` in the prefix are not wildcards.
    pub async fn list_keys(&self, prefix: &str) -> SyncResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT key FROM blobs WHERE substr(key, 1, length(?)) = ? ORDER BY key ASC",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(self.pool())
        .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(row.try_get("key")?);
        }
        Ok(keys)
    }

    /// Serialize `value` as JSON and store it under `key`
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> SyncResult<()> {
        let data = serde_json::to_vec(value)?;
        self.put_blob(key, &data).await
    }

    /// Load and deserialize the JSON blob under `key`
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<T>> {
        match self.get_blob(key).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }
}
