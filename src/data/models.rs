//! Data models
//!
//! Rust structs representing the three store collections and the
//! operation vocabulary replayed against the upstream backend.
//! Timestamps are epoch milliseconds throughout.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Default retry ceiling for a queued operation.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Default (low) priority for a queued operation.
pub const DEFAULT_PRIORITY: i64 = 5;

/// Priority value that marks an operation as critical.
///
/// Critical operations are eligible for the best-effort beacon flush on
/// shutdown; priority has no effect on drain order.
pub const CRITICAL_PRIORITY: i64 = 1;

/// Current epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// =============================================================================
// Draft posts
// =============================================================================

/// Status value for locally authored drafts.
pub const DRAFT_STATUS_OFFLINE: &str = "offline";

/// A post authored while disconnected, awaiting submission.
///
/// The content fields are opaque to the engine; it only tracks identity,
/// status, and timestamps. Drafts are a cache of intent — the sync layer
/// never mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftPost {
    pub id: i64,
    /// Opaque content fields (JSON object), stored verbatim
    pub content: serde_json::Value,
    /// Always "offline" for locally authored drafts
    pub status: String,
    /// Epoch ms
    pub created: i64,
    /// Epoch ms, bumped on update
    pub modified: i64,
}

/// Raw draft row; `content` is decoded from its stored JSON text.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DraftPostRow {
    pub id: i64,
    pub content: String,
    pub status: String,
    pub created: i64,
    pub modified: i64,
}

impl DraftPostRow {
    pub fn decode(self) -> Result<DraftPost, serde_json::Error> {
        Ok(DraftPost {
            id: self.id,
            content: serde_json::from_str(&self.content)?,
            status: self.status,
            created: self.created,
            modified: self.modified,
        })
    }
}

// =============================================================================
// Queued operations
// =============================================================================

/// Post payload carried by create/update operations.
///
/// Opaque structured data; the engine forwards it to the upstream
/// contract without interpreting individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PostPayload(pub serde_json::Value);

impl PostPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// A replayable mutation, one of the four known kinds.
///
/// Stored as a `type` discriminant plus JSON payload; dispatched with an
/// exhaustive match during replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Operation {
    /// Create a new post on the server
    CreatePost(PostPayload),
    /// Update an existing post
    UpdatePost { id: i64, post: PostPayload },
    /// Delete a post
    DeletePost { id: i64 },
    /// Replay a bulk upload from its captured form fields
    BulkUpload { fields: BTreeMap<String, String> },
}

impl Operation {
    /// Stable discriminant string, also the wire/export vocabulary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreatePost(_) => "create_post",
            Self::UpdatePost { .. } => "update_post",
            Self::DeletePost { .. } => "delete_post",
            Self::BulkUpload { .. } => "bulk_upload",
        }
    }

    /// The JSON stored in the `payload` column.
    pub fn payload_json(&self) -> Result<String, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        serde_json::to_string(&value["payload"])
    }
}

/// A queued operation as stored: the operation plus retry bookkeeping.
///
/// Invariant: `attempts < max_attempts` for every stored record. A record
/// that reaches the ceiling is deleted, never resurrected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: i64,
    #[serde(flatten)]
    pub operation: Operation,
    /// Caller-supplied; 1 means critical. Does not affect drain order.
    pub priority: i64,
    /// Epoch ms
    pub created: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    /// Epoch ms of the most recent failed replay
    pub last_attempt: Option<i64>,
}

/// Raw queue row; `kind` + `payload` are decoded into [`Operation`].
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedOperationRow {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub priority: i64,
    pub created: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_attempt: Option<i64>,
}

impl QueuedOperationRow {
    /// Decode the stored discriminant + payload into an [`Operation`].
    pub fn decode(self) -> Result<QueuedOperation, serde_json::Error> {
        let payload: serde_json::Value = serde_json::from_str(&self.payload)?;
        let operation = serde_json::from_value(serde_json::json!({
            "type": self.kind,
            "payload": payload,
        }))?;
        Ok(QueuedOperation {
            id: self.id,
            operation,
            priority: self.priority,
            created: self.created,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            last_attempt: self.last_attempt,
        })
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Key-value settings
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Setting {
    pub key: String,
    pub value: String,
}
