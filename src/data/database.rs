//! SQLite database operations
//!
//! All durable-store access goes through this module. The store owns the
//! three collections (`posts`, `queue`, `settings`); no other component
//! holds a cached copy of their records across calls.

use sqlx::{Pool, Sqlite, SqlitePool};
use std::path::Path;

use super::models::*;
use crate::error::EngineError;

/// Outcome of recording a failed replay attempt against a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Attempts incremented; the record stays queued for a later pass
    Retained,
    /// The ceiling was reached; the record was deleted, never to return
    Exhausted,
    /// The record no longer exists (deleted by a concurrent drain)
    Missing,
}

/// Database connection pool wrapper.
///
/// All operations are transactional at the single read-modify-write
/// granularity. There are no cross-collection transactions.
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database
    ///
    /// Creates the database file if it doesn't exist and provisions the
    /// three collections with their secondary indexes. Safe to call
    /// against an already-provisioned file.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(path: &Path) -> Result<Self, EngineError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Transaction(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("Migration failed: {}", e);
            EngineError::Internal(anyhow::anyhow!("Migration failed: {}", e))
        })?;

        tracing::info!("Store opened and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Draft posts
    // =========================================================================

    /// Insert a draft post authored offline.
    ///
    /// # Returns
    /// The store-assigned identity.
    pub async fn insert_post(&self, content: &serde_json::Value) -> Result<i64, EngineError> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            INSERT INTO posts (content, status, created, modified)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(serde_json::to_string(content)?)
        .bind(DRAFT_STATUS_OFFLINE)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get a draft post by identity.
    pub async fn get_post(&self, id: i64) -> Result<Option<DraftPost>, EngineError> {
        let row = sqlx::query_as::<_, DraftPostRow>("SELECT * FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.decode().map_err(EngineError::from)).transpose()
    }

    /// Get all draft posts in store iteration order.
    pub async fn get_all_posts(&self) -> Result<Vec<DraftPost>, EngineError> {
        let rows = sqlx::query_as::<_, DraftPostRow>("SELECT * FROM posts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| r.decode().map_err(EngineError::from))
            .collect()
    }

    /// Replace a draft's content fields, bumping `modified`.
    ///
    /// # Returns
    /// `true` if a row was updated.
    pub async fn update_post(
        &self,
        id: i64,
        content: &serde_json::Value,
    ) -> Result<bool, EngineError> {
        let result = sqlx::query("UPDATE posts SET content = ?, modified = ? WHERE id = ?")
            .bind(serde_json::to_string(content)?)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Delete a draft post.
    pub async fn delete_post(&self, id: i64) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM posts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Scan drafts whose `created` index value is at or below the bound.
    pub async fn posts_created_before(&self, bound: i64) -> Result<Vec<DraftPost>, EngineError> {
        let rows =
            sqlx::query_as::<_, DraftPostRow>("SELECT * FROM posts WHERE created <= ? ORDER BY id")
                .bind(bound)
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|r| r.decode().map_err(EngineError::from))
            .collect()
    }

    /// Delete drafts older than the bound (retention sweep).
    ///
    /// # Returns
    /// Number of rows deleted.
    pub async fn delete_posts_created_before(&self, bound: i64) -> Result<u64, EngineError> {
        let result = sqlx::query("DELETE FROM posts WHERE created <= ?")
            .bind(bound)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Queued operations
    // =========================================================================

    /// Insert a queued operation with zero attempts.
    ///
    /// No dedup is performed; duplicate submissions produce duplicate
    /// replays.
    ///
    /// # Returns
    /// The store-assigned identity.
    pub async fn insert_operation(
        &self,
        operation: &Operation,
        priority: i64,
        max_attempts: i64,
    ) -> Result<i64, EngineError> {
        let result = sqlx::query(
            r#"
            INSERT INTO queue (kind, payload, priority, created, attempts, max_attempts)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(operation.kind())
        .bind(operation.payload_json()?)
        .bind(priority)
        .bind(now_ms())
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Get a queued operation by identity.
    pub async fn get_operation(&self, id: i64) -> Result<Option<QueuedOperation>, EngineError> {
        let row = sqlx::query_as::<_, QueuedOperationRow>("SELECT * FROM queue WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.decode().map_err(EngineError::from)).transpose()
    }

    /// Get all queued operations in store iteration order.
    ///
    /// Deliberately not ordered by priority: priority only affects the
    /// shutdown beacon filter, never drain order.
    pub async fn get_all_operations(&self) -> Result<Vec<QueuedOperation>, EngineError> {
        let rows = sqlx::query_as::<_, QueuedOperationRow>("SELECT * FROM queue ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|r| r.decode().map_err(EngineError::from))
            .collect()
    }

    /// Delete a queued operation (replay succeeded or permanent drop).
    pub async fn delete_operation(&self, id: i64) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a failed replay attempt as one atomic read-modify-write.
    ///
    /// Increments `attempts` and sets `last_attempt`; when the incremented
    /// count reaches `max_attempts` the record is deleted instead of
    /// persisted, upholding the `attempts < max_attempts` invariant for
    /// every stored row.
    pub async fn record_attempt(&self, id: i64, at: i64) -> Result<AttemptOutcome, EngineError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, (i64, i64)>(
            "SELECT attempts, max_attempts FROM queue WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, max_attempts)) = row else {
            tx.commit().await?;
            return Ok(AttemptOutcome::Missing);
        };

        let attempts = attempts + 1;
        let outcome = if attempts >= max_attempts {
            sqlx::query("DELETE FROM queue WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            AttemptOutcome::Exhausted
        } else {
            sqlx::query("UPDATE queue SET attempts = ?, last_attempt = ? WHERE id = ?")
                .bind(attempts)
                .bind(at)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            AttemptOutcome::Retained
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Scan queued operations whose `created` value is at or below the bound.
    pub async fn operations_created_before(
        &self,
        bound: i64,
    ) -> Result<Vec<QueuedOperation>, EngineError> {
        let rows = sqlx::query_as::<_, QueuedOperationRow>(
            "SELECT * FROM queue WHERE created <= ? ORDER BY id",
        )
        .bind(bound)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| r.decode().map_err(EngineError::from))
            .collect()
    }

    /// Delete queued operations older than the bound (retention sweep).
    pub async fn delete_operations_created_before(&self, bound: i64) -> Result<u64, EngineError> {
        let result = sqlx::query("DELETE FROM queue WHERE created <= ?")
            .bind(bound)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Number of pending queued operations.
    pub async fn count_operations(&self) -> Result<i64, EngineError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM queue")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Create or overwrite a setting.
    pub async fn put_setting(&self, key: &str, value: &str) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read a setting, falling back to the caller-supplied default.
    pub async fn get_setting(&self, key: &str, default: &str) -> Result<String, EngineError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value.unwrap_or_else(|| default.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::connect(&dir.path().join("test.db")).await.unwrap();
        (db, dir)
    }

    fn create_op(content: &str) -> Operation {
        Operation::CreatePost(PostPayload::new(serde_json::json!({ "content": content })))
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");

        let first = Database::connect(&path).await.unwrap();
        first.insert_post(&serde_json::json!({"content": "kept"})).await.unwrap();
        drop(first);

        let second = Database::connect(&path).await.unwrap();
        assert_eq!(second.get_all_posts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn post_ids_are_monotonically_increasing() {
        let (db, _dir) = open_store().await;

        let a = db.insert_post(&serde_json::json!({"content": "a"})).await.unwrap();
        let b = db.insert_post(&serde_json::json!({"content": "b"})).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn update_post_bumps_modified_and_keeps_created() {
        let (db, _dir) = open_store().await;

        let id = db.insert_post(&serde_json::json!({"content": "v1"})).await.unwrap();
        let before = db.get_post(id).await.unwrap().unwrap();

        assert!(db.update_post(id, &serde_json::json!({"content": "v2"})).await.unwrap());
        let after = db.get_post(id).await.unwrap().unwrap();

        assert_eq!(after.created, before.created);
        assert!(after.modified >= before.modified);
        assert_eq!(after.content["content"], "v2");
        assert_eq!(after.status, DRAFT_STATUS_OFFLINE);
    }

    #[tokio::test]
    async fn record_attempt_retains_below_ceiling_and_deletes_at_ceiling() {
        let (db, _dir) = open_store().await;

        let id = db.insert_operation(&create_op("x"), DEFAULT_PRIORITY, 2).await.unwrap();

        assert_eq!(
            db.record_attempt(id, now_ms()).await.unwrap(),
            AttemptOutcome::Retained
        );
        let op = db.get_operation(id).await.unwrap().unwrap();
        assert_eq!(op.attempts, 1);
        assert!(op.last_attempt.is_some());

        assert_eq!(
            db.record_attempt(id, now_ms()).await.unwrap(),
            AttemptOutcome::Exhausted
        );
        assert!(db.get_operation(id).await.unwrap().is_none());

        // Deleted records are never resurrected
        assert_eq!(
            db.record_attempt(id, now_ms()).await.unwrap(),
            AttemptOutcome::Missing
        );
    }

    #[tokio::test]
    async fn stored_rows_always_satisfy_attempts_below_ceiling() {
        let (db, _dir) = open_store().await;

        let id = db.insert_operation(&create_op("x"), DEFAULT_PRIORITY, 3).await.unwrap();
        db.record_attempt(id, now_ms()).await.unwrap();
        db.record_attempt(id, now_ms()).await.unwrap();

        for op in db.get_all_operations().await.unwrap() {
            assert!(op.attempts < op.max_attempts);
        }
    }

    #[tokio::test]
    async fn created_before_scan_respects_upper_bound() {
        let (db, _dir) = open_store().await;

        let old_id = db.insert_operation(&create_op("old"), DEFAULT_PRIORITY, 3).await.unwrap();
        let new_id = db.insert_operation(&create_op("new"), DEFAULT_PRIORITY, 3).await.unwrap();

        // Backdate the first record by 8 days
        let eight_days_ms = 8 * 24 * 3600 * 1000;
        sqlx::query("UPDATE queue SET created = ? WHERE id = ?")
            .bind(now_ms() - eight_days_ms)
            .bind(old_id)
            .execute(&db.pool)
            .await
            .unwrap();

        let cutoff = now_ms() - 7 * 24 * 3600 * 1000;
        let stale = db.operations_created_before(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old_id);

        assert_eq!(db.delete_operations_created_before(cutoff).await.unwrap(), 1);
        let remaining = db.get_all_operations().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, new_id);
    }

    #[tokio::test]
    async fn settings_overwrite_and_default() {
        let (db, _dir) = open_store().await;

        assert_eq!(
            db.get_setting("last_sync", "never").await.unwrap(),
            "never"
        );

        db.put_setting("last_sync", "123").await.unwrap();
        db.put_setting("last_sync", "456").await.unwrap();
        assert_eq!(db.get_setting("last_sync", "never").await.unwrap(), "456");
    }
}
