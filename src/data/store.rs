//! Degraded-mode wrapper around the durable store
//!
//! The engine must keep running when the store cannot be opened (locked
//! file, full disk, bad path). `StoreHandle` makes that an explicit mode:
//! reads yield empty results and writes become no-ops, while single
//! transaction failures on a healthy store are still surfaced to the
//! immediate caller.

use std::path::Path;
use std::sync::Arc;

use super::database::{AttemptOutcome, Database};
use super::models::{DraftPost, Operation, QueuedOperation};
use crate::error::EngineError;

/// Handle to the durable store, possibly degraded.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Option<Arc<Database>>,
}

impl StoreHandle {
    /// Open the store, falling back to degraded mode on failure.
    ///
    /// The failure is logged once here; callers observe it only through
    /// `is_degraded()` and the no-op behavior.
    pub async fn open(path: &Path) -> Self {
        match Database::connect(path).await {
            Ok(db) => Self {
                inner: Some(Arc::new(db)),
            },
            Err(error) => {
                tracing::error!(
                    %error,
                    path = %path.display(),
                    "Store unavailable; engine continues in degraded mode"
                );
                Self { inner: None }
            }
        }
    }

    /// Wrap an already-open database (tests, embedding).
    pub fn from_database(db: Database) -> Self {
        Self {
            inner: Some(Arc::new(db)),
        }
    }

    /// A handle with no backing store.
    pub fn degraded() -> Self {
        Self { inner: None }
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.is_none()
    }

    // =========================================================================
    // Draft posts
    // =========================================================================

    /// Persist a draft; `None` in degraded mode.
    pub async fn insert_post(
        &self,
        content: &serde_json::Value,
    ) -> Result<Option<i64>, EngineError> {
        match &self.inner {
            Some(db) => db.insert_post(content).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_post(&self, id: i64) -> Result<Option<DraftPost>, EngineError> {
        match &self.inner {
            Some(db) => db.get_post(id).await,
            None => Ok(None),
        }
    }

    pub async fn get_all_posts(&self) -> Result<Vec<DraftPost>, EngineError> {
        match &self.inner {
            Some(db) => db.get_all_posts().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn update_post(
        &self,
        id: i64,
        content: &serde_json::Value,
    ) -> Result<bool, EngineError> {
        match &self.inner {
            Some(db) => db.update_post(id, content).await,
            None => Ok(false),
        }
    }

    pub async fn delete_post(&self, id: i64) -> Result<bool, EngineError> {
        match &self.inner {
            Some(db) => db.delete_post(id).await,
            None => Ok(false),
        }
    }

    pub async fn delete_posts_created_before(&self, bound: i64) -> Result<u64, EngineError> {
        match &self.inner {
            Some(db) => db.delete_posts_created_before(bound).await,
            None => Ok(0),
        }
    }

    // =========================================================================
    // Queued operations
    // =========================================================================

    /// Enqueue an operation; `None` in degraded mode.
    pub async fn insert_operation(
        &self,
        operation: &Operation,
        priority: i64,
        max_attempts: i64,
    ) -> Result<Option<i64>, EngineError> {
        match &self.inner {
            Some(db) => db
                .insert_operation(operation, priority, max_attempts)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_operation(&self, id: i64) -> Result<Option<QueuedOperation>, EngineError> {
        match &self.inner {
            Some(db) => db.get_operation(id).await,
            None => Ok(None),
        }
    }

    pub async fn get_all_operations(&self) -> Result<Vec<QueuedOperation>, EngineError> {
        match &self.inner {
            Some(db) => db.get_all_operations().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn delete_operation(&self, id: i64) -> Result<bool, EngineError> {
        match &self.inner {
            Some(db) => db.delete_operation(id).await,
            None => Ok(false),
        }
    }

    /// Record a failed attempt; degraded stores report the record missing.
    pub async fn record_attempt(&self, id: i64, at: i64) -> Result<AttemptOutcome, EngineError> {
        match &self.inner {
            Some(db) => db.record_attempt(id, at).await,
            None => Ok(AttemptOutcome::Missing),
        }
    }

    pub async fn delete_operations_created_before(&self, bound: i64) -> Result<u64, EngineError> {
        match &self.inner {
            Some(db) => db.delete_operations_created_before(bound).await,
            None => Ok(0),
        }
    }

    pub async fn count_operations(&self) -> Result<i64, EngineError> {
        match &self.inner {
            Some(db) => db.count_operations().await,
            None => Ok(0),
        }
    }

    // =========================================================================
    // Settings
    // =========================================================================

    pub async fn put_setting(&self, key: &str, value: &str) -> Result<bool, EngineError> {
        match &self.inner {
            Some(db) => db.put_setting(key, value).await.map(|_| true),
            None => Ok(false),
        }
    }

    pub async fn get_setting(&self, key: &str, default: &str) -> Result<String, EngineError> {
        match &self.inner {
            Some(db) => db.get_setting(key, default).await,
            None => Ok(default.to_string()),
        }
    }
}
