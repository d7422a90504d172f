//! Sync orchestrator
//!
//! Decides *when* the queue drains, owning no replay logic itself:
//! connectivity restored, a drain signal from the proxy (renewed client
//! activity, background sync), a periodic timer, plus the hourly
//! retention sweep and the best-effort critical flush on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::data::{Operation, StoreHandle, now_ms};
use crate::error::EngineError;
use crate::queue::QueueManager;
use crate::upstream::SyncContract;

/// Message from the interception proxy to the engine.
///
/// Delivery is fire-and-forget, unordered, at-most-once: the channel is
/// bounded and senders drop on a full buffer.
#[derive(Debug)]
pub enum EngineSignal {
    /// Run a drain pass (client activity resumed, background sync)
    Drain,
    /// Enqueue a mutation captured at the transport boundary
    Enqueue {
        operation: Operation,
        priority: i64,
        max_attempts: i64,
    },
}

/// Capacity of the proxy-to-engine signal channel.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Spawn the connectivity prober.
///
/// Publishes online/offline over the watch channel; a completed HTTP
/// exchange with the upstream counts as online.
pub fn spawn_connectivity_probe(
    contract: Arc<dyn SyncContract>,
    probe_interval: Duration,
    online_tx: Arc<watch::Sender<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(probe_interval);

        loop {
            interval.tick().await;

            let online = contract.probe().await;

            use crate::metrics::ONLINE;
            ONLINE.set(if online { 1 } else { 0 });

            let changed = online_tx.send_if_modified(|current| {
                if *current != online {
                    *current = online;
                    true
                } else {
                    false
                }
            });

            if changed {
                tracing::info!(online, "Connectivity changed");
            }
        }
    })
}

/// Delete drafts and queued operations older than the retention age.
///
/// # Returns
/// `(posts_deleted, operations_deleted)`
pub async fn run_retention_sweep(
    store: &StoreHandle,
    retention_days: i64,
) -> Result<(u64, u64), EngineError> {
    let bound = now_ms() - retention_days * 24 * 3600 * 1000;

    let posts = store.delete_posts_created_before(bound).await?;
    let operations = store.delete_operations_created_before(bound).await?;

    use crate::metrics::RETENTION_DELETES_TOTAL;
    RETENTION_DELETES_TOTAL
        .with_label_values(&["posts"])
        .inc_by(posts);
    RETENTION_DELETES_TOTAL
        .with_label_values(&["queue"])
        .inc_by(operations);

    if posts > 0 || operations > 0 {
        tracing::info!(posts, operations, retention_days, "Retention sweep complete");
    }

    Ok((posts, operations))
}

/// Handle to a running orchestrator task.
pub struct OrchestratorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl OrchestratorHandle {
    /// Signal shutdown and wait for the flush to finish.
    ///
    /// While online this performs the best-effort critical beacon before
    /// the timers stop; flushed operations remain queued.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

/// The sync orchestrator task set.
pub struct SyncOrchestrator {
    queue: Arc<QueueManager>,
    config: SyncConfig,
    online_rx: watch::Receiver<bool>,
    signal_rx: mpsc::Receiver<EngineSignal>,
}

impl SyncOrchestrator {
    pub fn new(
        queue: Arc<QueueManager>,
        config: SyncConfig,
        online_rx: watch::Receiver<bool>,
        signal_rx: mpsc::Receiver<EngineSignal>,
    ) -> Self {
        Self {
            queue,
            config,
            online_rx,
            signal_rx,
        }
    }

    /// Spawn the orchestrator loop.
    pub fn spawn(self) -> OrchestratorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(shutdown_rx));

        tracing::info!("Sync orchestrator spawned");
        OrchestratorHandle { shutdown_tx, task }
    }

    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut drain_timer =
            tokio::time::interval(Duration::from_secs(self.config.drain_interval_seconds));
        let mut retention_timer =
            tokio::time::interval(Duration::from_secs(self.config.retention_interval_seconds));

        // Consume the immediate first ticks; timers fire one interval in.
        drain_timer.tick().await;
        retention_timer.tick().await;

        let mut was_online = *self.online_rx.borrow();

        loop {
            tokio::select! {
                changed = self.online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *self.online_rx.borrow();
                    if online && !was_online {
                        tracing::info!("Connectivity restored; draining queue");
                        self.drain().await;
                    }
                    was_online = online;
                }
                signal = self.signal_rx.recv() => {
                    match signal {
                        Some(EngineSignal::Drain) => {
                            if *self.online_rx.borrow() {
                                self.drain().await;
                            }
                        }
                        Some(EngineSignal::Enqueue { operation, priority, max_attempts }) => {
                            if let Err(error) = self
                                .queue
                                .enqueue(operation, priority, max_attempts)
                                .await
                            {
                                tracing::error!(%error, "Failed to enqueue deferred mutation");
                            }
                        }
                        None => break,
                    }
                }
                _ = drain_timer.tick() => {
                    if *self.online_rx.borrow() {
                        self.drain().await;
                    }
                }
                _ = retention_timer.tick() => {
                    if let Err(error) =
                        run_retention_sweep(self.queue.store(), self.config.retention_days).await
                    {
                        tracing::error!(%error, "Retention sweep failed");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *self.online_rx.borrow() {
                        if let Err(error) = self.queue.flush_critical().await {
                            tracing::warn!(%error, "Critical flush on shutdown failed");
                        }
                    }
                    tracing::info!("Sync orchestrator stopped");
                    break;
                }
            }
        }
    }

    async fn drain(&self) {
        if let Err(error) = self.queue.drain().await {
            tracing::error!(%error, "Drain pass failed");
        }
    }
}
