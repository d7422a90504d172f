//! Export/import of local state
//!
//! The export document is a plain JSON snapshot of the drafts and queue.
//! Import re-inserts every record through the normal save/enqueue paths,
//! so identities are reassigned, never preserved; only the set of
//! (type, payload) pairs survives a round trip.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::models::{DraftPost, QueuedOperation};
use crate::error::EngineError;
use crate::queue::QueueManager;

/// JSON export document: `{posts, queue, exported}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub posts: Vec<DraftPost>,
    pub queue: Vec<QueuedOperation>,
    /// ISO-8601 timestamp of the export
    pub exported: String,
}

/// Counts of re-inserted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportReport {
    pub posts: usize,
    pub operations: usize,
}

/// Snapshot the drafts and pending operations.
pub async fn export(manager: &QueueManager) -> Result<ExportDocument, EngineError> {
    Ok(ExportDocument {
        posts: manager.store().get_all_posts().await?,
        queue: manager.list_pending().await?,
        exported: Utc::now().to_rfc3339(),
    })
}

/// Re-insert an export document through the normal write paths.
///
/// Records the store refuses (degraded mode) are skipped, not errors.
pub async fn import(
    manager: &QueueManager,
    document: ExportDocument,
) -> Result<ImportReport, EngineError> {
    let mut report = ImportReport {
        posts: 0,
        operations: 0,
    };

    for post in document.posts {
        if manager.store().insert_post(&post.content).await?.is_some() {
            report.posts += 1;
        }
    }

    for queued in document.queue {
        if manager
            .enqueue(queued.operation, queued.priority, queued.max_attempts)
            .await?
            .is_some()
        {
            report.operations += 1;
        }
    }

    tracing::info!(
        posts = report.posts,
        operations = report.operations,
        "Import complete"
    );

    Ok(report)
}
