//! # Local Database Module
//!
//! Local SQLite storage for the offline-first data layer. Everything the layer
//! persists is a serialized blob keyed by a store-wide name:
//!
//! - `collection:<name>` - one versioned snapshot per entity collection
//! - `sync_queue` - the ordered mutation queue
//! - `resource:<id>` - bytes of a pending resource referenced by a queued mutation
//! - `resource_meta:<id>` - content type and replaced remote id of that resource
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stockpile::console::local_db::LocalDatabase;
//!
//! # async fn example() -> stockpile::shared::SyncResult<()> {
//! let db = LocalDatabase::open(std::path::Path::new("/tmp/stockpile/local.db")).await?;
//! db.put_blob("sync_queue", b"{}").await?;
//! let stats = db.get_stats().await?;
//! println!("{} blobs stored", stats.blob_count);
//! # Ok(())
//! # }
//! ```

pub mod blobs;
pub mod schema;

use crate::shared::SyncResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

pub use blobs::{
    collection_key, resource_key, resource_meta_key, COLLECTION_PREFIX, QUEUE_KEY,
    RESOURCE_META_PREFIX, RESOURCE_PREFIX,
};

/// Local database connection manager
///
/// Cheap to clone; clones share the same pool.
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open or create the database file at `path`
    ///
    /// Creates the parent directory if needed and runs pending migrations.
    /// Uses WAL mode so readers never block the single writer.
    pub async fn open(path: &Path) -> SyncResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::shared::SyncError::local_store(e.to_string()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        tracing::debug!("[LOCAL_DB] Opened {}", path.display());
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Open an isolated in-memory database
    ///
    /// The pool is pinned to one connection that never expires, since every
    /// SQLite connection to `:memory:` sees its own empty database.
    pub async fn in_memory() -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run database migrations
    ///
    /// Checks the current schema version and applies any pending migrations.
    async fn run_migrations(&self) -> SyncResult<()> {
        sqlx::query(schema::MIGRATIONS_TABLE)
            .execute(&self.pool)
            .await?;

        let current_version: (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&self.pool)
                .await?;

        if !schema::needs_migration(current_version.0) {
            return Ok(());
        }

        for version in schema::get_pending_migrations(current_version.0) {
            let Some(sql) = schema::migration_sql(version) else {
                continue;
            };
            let mut tx = self.pool.begin().await?;
            sqlx::query(sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!("[LOCAL_DB] Applied migration {}", version);
        }

        Ok(())
    }

    /// Get connection pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool; later operations fail with a local store error
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Get database statistics
    pub async fn get_stats(&self) -> SyncResult<DatabaseStats> {
        let (blob_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blobs")
            .fetch_one(&self.pool)
            .await?;

        let (collection_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM blobs WHERE key LIKE ?")
                .bind(format!("{}%", COLLECTION_PREFIX))
                .fetch_one(&self.pool)
                .await?;

        let (resource_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM blobs WHERE key LIKE ?")
                .bind(format!("{}%", RESOURCE_PREFIX))
                .fetch_one(&self.pool)
                .await?;

        Ok(DatabaseStats {
            blob_count: blob_count as u64,
            collection_count: collection_count as u64,
            resource_count: resource_count as u64,
        })
    }
}

/// Database statistics
#[derive(Debug, Clone)]
pub struct DatabaseStats {
    /// Total blobs stored
    pub blob_count: u64,
    /// Persisted entity collections
    pub collection_count: u64,
    /// Queued resource payloads
    pub resource_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_creation() {
        let db = LocalDatabase::in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    async fn test_database_stats() {
        let db = LocalDatabase::in_memory().await.unwrap();
        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.blob_count, 0);
        assert_eq!(stats.collection_count, 0);
        assert_eq!(stats.resource_count, 0);
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("local.db");

        let db = LocalDatabase::open(&path).await.unwrap();
        db.put_blob("sync_queue", b"[]").await.unwrap();
        db.close().await;

        let reopened = LocalDatabase::open(&path).await.unwrap();
        assert_eq!(reopened.get_blob("sync_queue").await.unwrap(), Some(b"[]".to_vec()));
    }

    #[tokio::test]
    async fn test_closed_database_reports_error() {
        let db = LocalDatabase::in_memory().await.unwrap();
        db.close().await;
        let result = db.put_blob("k", b"v").await;
        assert!(matches!(result, Err(crate::shared::SyncError::LocalStore { .. })));
    }
}
