//! Outpost - an offline-first operation queue and sync engine
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Interception Proxy (Axum)                    │
//! │  - classify: form / api / static                            │
//! │  - cache-first, network-first, offline deferral             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Engine Layer                            │
//! │  - queue manager (replay, retry, escalation)                │
//! │  - sync orchestrator (when to drain)                        │
//! │  - connectivity prober                                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                             │
//! │  - SQLite (sqlx): posts, queue, settings                    │
//! │  - Moka response caches (shell + runtime)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `proxy`: request interception and serving strategies
//! - `queue`: durable operation queue and replay
//! - `sync`: orchestrator, prober, retention sweep
//! - `upstream`: HTTP contract with the origin backend
//! - `data`: store, models, response caches, export/import
//! - `config`: configuration management
//! - `error`: error types

pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod sync;
pub mod upstream;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::{mpsc, watch};

use crate::data::now_ms;

/// Engine state shared across all proxy handlers
///
/// Cloned per request; holds the durable store, queue manager, response
/// caches, the upstream HTTP client, and the channels that connect the
/// proxy to the background orchestrator.
#[derive(Clone)]
pub struct EngineState {
    /// Engine configuration
    pub config: Arc<config::AppConfig>,

    /// Durable store handle (possibly degraded)
    pub store: data::StoreHandle,

    /// Queue manager (replay + escalation)
    pub queue: Arc<queue::QueueManager>,

    /// Named response caches (shell + runtime)
    pub cache: Arc<data::ResponseCache>,

    /// HTTP client shared with the upstream contract
    pub http_client: Arc<reqwest::Client>,

    /// Upstream contract used by drain and probe
    pub contract: Arc<dyn upstream::SyncContract>,

    /// Fire-and-forget signals to the orchestrator
    signal_tx: mpsc::Sender<sync::EngineSignal>,

    /// Connectivity watch channel, published by the prober
    online_tx: Arc<watch::Sender<bool>>,

    /// Epoch ms of the last intercepted request
    last_activity_ms: Arc<AtomicI64>,
}

impl EngineState {
    /// Initialize engine state
    ///
    /// # Steps
    /// 1. Open the durable store (degrading on failure)
    /// 2. Build the upstream HTTP client and contract
    /// 3. Build the queue manager and response caches
    /// 4. Create the signal and connectivity channels
    ///
    /// # Returns
    /// The state plus the receiving end of the signal channel, which the
    /// orchestrator consumes.
    pub async fn new(
        config: config::AppConfig,
    ) -> Result<(Self, mpsc::Receiver<sync::EngineSignal>), error::EngineError> {
        tracing::info!("Initializing engine state...");

        // 1. Open the durable store
        let store = data::StoreHandle::open(&config.store.path).await;
        if store.is_degraded() {
            tracing::warn!("Engine starting in degraded store mode");
        } else {
            tracing::info!(path = %config.store.path.display(), "Store opened");
        }

        // 2. Upstream HTTP client and contract
        // Redirects pass through to the client untouched; the proxy
        // never follows them on the upstream's behalf.
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent("Outpost/0.1.0")
                .redirect(reqwest::redirect::Policy::none())
                .timeout(std::time::Duration::from_secs(
                    config.upstream.request_timeout_seconds,
                ))
                .build()
                .map_err(|e| error::EngineError::Internal(e.into()))?,
        );
        let upstream_config = Arc::new(config.upstream.clone());
        let contract: Arc<dyn upstream::SyncContract> = Arc::new(upstream::HttpSync::new(
            http_client.clone(),
            upstream_config,
        ));

        // 3. Queue manager and response caches
        let queue = Arc::new(queue::QueueManager::new(store.clone(), contract.clone()));
        let cache = Arc::new(data::ResponseCache::new(
            &config.cache.shell_version,
            config.cache.runtime_max_entries,
        ));
        tracing::info!(shell = %cache.shell_cache_name(), "Response caches initialized");

        // 4. Channels
        let (signal_tx, signal_rx) = mpsc::channel(sync::SIGNAL_CHANNEL_CAPACITY);
        let (online_tx, _online_rx) = watch::channel(false);

        tracing::info!("Engine state initialized");

        Ok((
            Self {
                config: Arc::new(config),
                store,
                queue,
                cache,
                http_client,
                contract,
                signal_tx,
                online_tx: Arc::new(online_tx),
                last_activity_ms: Arc::new(AtomicI64::new(now_ms())),
            },
            signal_rx,
        ))
    }

    /// Current connectivity as last published by the prober.
    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    /// Subscribe to connectivity changes (orchestrator, tests).
    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    /// Sender half of the connectivity channel, for the prober task.
    pub fn online_sender(&self) -> Arc<watch::Sender<bool>> {
        self.online_tx.clone()
    }

    /// Force a connectivity value (tests, manual override).
    pub fn set_online(&self, online: bool) {
        let _ = self.online_tx.send(online);
    }

    /// Record client activity.
    ///
    /// # Returns
    /// `true` when the previous request was longer ago than the idle
    /// threshold, which the proxy treats as a drain trigger.
    pub fn note_activity(&self) -> bool {
        let now = now_ms();
        let previous = self.last_activity_ms.swap(now, Ordering::Relaxed);
        let idle_ms = self.config.sync.visibility_idle_seconds as i64 * 1000;
        now - previous >= idle_ms
    }

    /// Ask the orchestrator for a drain pass.
    ///
    /// At-most-once: a full signal buffer drops the message (the
    /// periodic drain timer covers the loss).
    pub fn signal_drain(&self) {
        if self.signal_tx.try_send(sync::EngineSignal::Drain).is_err() {
            tracing::debug!("Signal buffer full; drain request dropped");
        }
    }

    /// Hand a deferred mutation to the orchestrator for enqueueing.
    pub fn signal_enqueue(&self, operation: data::Operation) {
        let kind = operation.kind();
        let signal = sync::EngineSignal::Enqueue {
            operation,
            priority: data::DEFAULT_PRIORITY,
            max_attempts: data::DEFAULT_MAX_ATTEMPTS,
        };

        if self.signal_tx.try_send(signal).is_err() {
            use crate::metrics::OPERATIONS_DROPPED_TOTAL;
            OPERATIONS_DROPPED_TOTAL
                .with_label_values(&[kind, "signal_buffer_full"])
                .inc();
            tracing::warn!(kind, "Signal buffer full; deferred mutation dropped");
        }
    }
}

/// Build the Axum router for the interception proxy.
///
/// Shared by the binary and integration tests to keep route composition
/// consistent across environments.
pub fn build_router(state: EngineState) -> axum::Router {
    use tower_http::{compression::CompressionLayer, trace::TraceLayer};

    proxy::router(state)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .merge(metrics::metrics_router())
}
