//! Upstream sync contract
//!
//! The authoritative backend is an external collaborator; the engine only
//! depends on this request/response surface. `SyncContract` is the seam
//! the queue manager replays against, mocked in unit tests and served by
//! `HttpSync` in production.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::UpstreamConfig;
use crate::data::{PostPayload, QueuedOperation};
use crate::error::EngineError;

/// The server contract consumed by replay.
///
/// Every method maps to one fixed endpoint; any non-2xx answer is a
/// replay failure, classified transient or permanent by status.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncContract: Send + Sync {
    /// `POST /api/posts`
    async fn create_post(&self, payload: &PostPayload) -> Result<serde_json::Value, EngineError>;

    /// `PUT /api/posts/{id}`
    async fn update_post(
        &self,
        id: i64,
        payload: &PostPayload,
    ) -> Result<serde_json::Value, EngineError>;

    /// `POST /api/post/{id}/delete`
    async fn delete_post(&self, id: i64) -> Result<serde_json::Value, EngineError>;

    /// `POST /bulk-upload`, multipart rebuilt from the stored fields
    async fn bulk_upload(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, EngineError>;

    /// `POST /api/sync` — best-effort critical-operation beacon.
    ///
    /// Fire-and-forget: the response body is never read and no delivery
    /// confirmation is obtained.
    async fn beacon(&self, operations: &[QueuedOperation]) -> Result<(), EngineError>;

    /// Cheap reachability check used by the connectivity watcher.
    ///
    /// Any completed HTTP exchange counts as online; only transport
    /// failures mean offline.
    async fn probe(&self) -> bool;
}

/// HTTP implementation of the sync contract.
#[derive(Clone)]
pub struct HttpSync {
    http_client: Arc<reqwest::Client>,
    upstream: Arc<UpstreamConfig>,
}

impl HttpSync {
    pub fn new(http_client: Arc<reqwest::Client>, upstream: Arc<UpstreamConfig>) -> Self {
        Self {
            http_client,
            upstream,
        }
    }

    async fn expect_json(
        response: reqwest::Response,
        context: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::replay_status(status, context));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| EngineError::replay_transport(e, context))
    }
}

#[async_trait]
impl SyncContract for HttpSync {
    async fn create_post(&self, payload: &PostPayload) -> Result<serde_json::Value, EngineError> {
        let url = self.upstream.url_for("/api/posts");
        let response = self
            .http_client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| EngineError::replay_transport(e, "create_post"))?;

        Self::expect_json(response, "create_post").await
    }

    async fn update_post(
        &self,
        id: i64,
        payload: &PostPayload,
    ) -> Result<serde_json::Value, EngineError> {
        let url = self.upstream.url_for(&format!("/api/posts/{id}"));
        let response = self
            .http_client
            .put(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| EngineError::replay_transport(e, "update_post"))?;

        Self::expect_json(response, "update_post").await
    }

    async fn delete_post(&self, id: i64) -> Result<serde_json::Value, EngineError> {
        let url = self.upstream.url_for(&format!("/api/post/{id}/delete"));
        let response = self
            .http_client
            .post(&url)
            .send()
            .await
            .map_err(|e| EngineError::replay_transport(e, "delete_post"))?;

        Self::expect_json(response, "delete_post").await
    }

    async fn bulk_upload(
        &self,
        fields: &BTreeMap<String, String>,
    ) -> Result<serde_json::Value, EngineError> {
        let url = self.upstream.url_for("/bulk-upload");

        let mut form = reqwest::multipart::Form::new();
        for (name, value) in fields {
            form = form.text(name.clone(), value.clone());
        }

        let response = self
            .http_client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| EngineError::replay_transport(e, "bulk_upload"))?;

        Self::expect_json(response, "bulk_upload").await
    }

    async fn beacon(&self, operations: &[QueuedOperation]) -> Result<(), EngineError> {
        let url = self.upstream.url_for("/api/sync");

        // Send-and-forget: status and body are deliberately not inspected.
        self.http_client
            .post(&url)
            .json(&serde_json::json!({ "operations": operations }))
            .send()
            .await
            .map_err(|e| EngineError::replay_transport(e, "beacon"))?;

        Ok(())
    }

    async fn probe(&self) -> bool {
        let url = self.upstream.url_for("/");
        match self.http_client.get(&url).send().await {
            Ok(_) => true,
            Err(error) => {
                tracing::debug!(%error, "Connectivity probe failed");
                false
            }
        }
    }
}
