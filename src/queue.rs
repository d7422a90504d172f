//! Queue manager
//!
//! Enqueues replayable mutations, drains them against the upstream sync
//! contract one at a time, and applies the retry/escalation policy:
//! transient failures consume an attempt up to the ceiling, permanent
//! (validation) failures are dropped immediately with a surfaced error.

use std::sync::Arc;
use std::time::Instant;

use crate::data::{
    AttemptOutcome, CRITICAL_PRIORITY, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, Operation,
    QueuedOperation, StoreHandle, now_ms,
};
use crate::error::EngineError;
use crate::upstream::SyncContract;

/// Summary of one drain pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Operations the pass attempted to replay
    pub replayed: usize,
    /// Replays accepted by the upstream and deleted from the queue
    pub delivered: usize,
    /// Transient failures left queued for a later pass
    pub retried: usize,
    /// Permanent failures dropped without consuming the retry budget
    pub dropped_permanent: usize,
    /// Operations that reached their attempt ceiling and were dropped
    pub dropped_exhausted: usize,
}

/// Outcome of the optimistic direct-send path.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Sent directly; the upstream's JSON answer
    Delivered(serde_json::Value),
    /// Deferred into the queue; `None` when the store is degraded
    Queued(Option<i64>),
}

/// Queue manager: owns enqueue/dequeue and the replay loop.
///
/// `drain` is safe to call repeatedly and concurrently with itself;
/// overlapping passes may race on the same records, which the store's
/// per-record transactions keep convergent.
pub struct QueueManager {
    store: StoreHandle,
    contract: Arc<dyn SyncContract>,
}

impl QueueManager {
    pub fn new(store: StoreHandle, contract: Arc<dyn SyncContract>) -> Self {
        Self { store, contract }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Insert an operation with `attempts = 0`.
    ///
    /// No dedup: duplicate submissions produce duplicate replays. The
    /// attempt ceiling is clamped to at least 1 so every stored row
    /// satisfies `attempts < max_attempts`.
    ///
    /// # Returns
    /// The assigned identity, or `None` when the store is degraded.
    pub async fn enqueue(
        &self,
        operation: Operation,
        priority: i64,
        max_attempts: i64,
    ) -> Result<Option<i64>, EngineError> {
        let max_attempts = max_attempts.max(1);
        let id = self
            .store
            .insert_operation(&operation, priority, max_attempts)
            .await?;

        if let Some(id) = id {
            use crate::metrics::OPERATIONS_ENQUEUED_TOTAL;
            OPERATIONS_ENQUEUED_TOTAL
                .with_label_values(&[operation.kind()])
                .inc();
            tracing::debug!(id, kind = operation.kind(), priority, "Operation enqueued");
        }

        self.update_depth_gauge().await;
        Ok(id)
    }

    /// Enqueue with the default priority and attempt ceiling.
    pub async fn enqueue_default(&self, operation: Operation) -> Result<Option<i64>, EngineError> {
        self.enqueue(operation, DEFAULT_PRIORITY, DEFAULT_MAX_ATTEMPTS)
            .await
    }

    /// All pending operations, in store iteration order.
    ///
    /// The `priority` field does not influence this order; it only feeds
    /// the shutdown beacon filter.
    pub async fn list_pending(&self) -> Result<Vec<QueuedOperation>, EngineError> {
        self.store.get_all_operations().await
    }

    /// Replay one operation against the sync contract.
    async fn replay(&self, operation: &Operation) -> Result<serde_json::Value, EngineError> {
        match operation {
            Operation::CreatePost(payload) => self.contract.create_post(payload).await,
            Operation::UpdatePost { id, post } => self.contract.update_post(*id, post).await,
            Operation::DeletePost { id } => self.contract.delete_post(*id).await,
            Operation::BulkUpload { fields } => self.contract.bulk_upload(fields).await,
        }
    }

    /// Process all currently queued operations once, strictly sequentially.
    ///
    /// An empty queue costs one snapshot read: no store writes, no
    /// network calls. Operations enqueued mid-pass may or may not be
    /// observed.
    pub async fn drain(&self) -> Result<DrainReport, EngineError> {
        let pending = self.list_pending().await?;
        if pending.is_empty() {
            return Ok(DrainReport::default());
        }

        let started = Instant::now();
        let mut report = DrainReport::default();

        for queued in pending {
            report.replayed += 1;
            let kind = queued.operation.kind();

            match self.replay(&queued.operation).await {
                Ok(_) => {
                    self.store.delete_operation(queued.id).await?;
                    report.delivered += 1;

                    use crate::metrics::REPLAYS_TOTAL;
                    REPLAYS_TOTAL.with_label_values(&[kind, "delivered"]).inc();
                    tracing::debug!(id = queued.id, kind, "Replay delivered");
                }
                Err(error) if error.is_retryable() => {
                    use crate::metrics::REPLAYS_TOTAL;
                    REPLAYS_TOTAL.with_label_values(&[kind, "transient"]).inc();

                    match self.escalate(&queued).await? {
                        AttemptOutcome::Retained => {
                            report.retried += 1;
                            tracing::debug!(
                                id = queued.id,
                                kind,
                                %error,
                                "Replay failed; retained for a later pass"
                            );
                        }
                        AttemptOutcome::Exhausted => {
                            report.dropped_exhausted += 1;

                            use crate::metrics::OPERATIONS_DROPPED_TOTAL;
                            OPERATIONS_DROPPED_TOTAL
                                .with_label_values(&[kind, "exhausted"])
                                .inc();
                            tracing::warn!(
                                id = queued.id,
                                kind,
                                max_attempts = queued.max_attempts,
                                %error,
                                "Replay attempts exhausted; operation dropped"
                            );
                        }
                        AttemptOutcome::Missing => {
                            // Raced with an overlapping drain; nothing left to do
                            tracing::debug!(id = queued.id, kind, "Operation gone mid-drain");
                        }
                    }
                }
                Err(error) => {
                    // Permanently invalid payload: retrying would only burn
                    // the budget on the same rejection.
                    self.store.delete_operation(queued.id).await?;
                    report.dropped_permanent += 1;

                    use crate::metrics::{OPERATIONS_DROPPED_TOTAL, REPLAYS_TOTAL};
                    REPLAYS_TOTAL.with_label_values(&[kind, "permanent"]).inc();
                    OPERATIONS_DROPPED_TOTAL
                        .with_label_values(&[kind, "permanent"])
                        .inc();
                    tracing::error!(
                        id = queued.id,
                        kind,
                        %error,
                        "Upstream rejected operation permanently; dropped"
                    );
                }
            }
        }

        use crate::metrics::{DRAIN_DURATION_SECONDS, DRAINS_TOTAL};
        DRAINS_TOTAL.inc();
        DRAIN_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        self.update_depth_gauge().await;

        tracing::info!(
            replayed = report.replayed,
            delivered = report.delivered,
            retried = report.retried,
            dropped_permanent = report.dropped_permanent,
            dropped_exhausted = report.dropped_exhausted,
            "Drain pass complete"
        );

        Ok(report)
    }

    /// Escalate a failed operation: attempts + 1, `last_attempt` set, and
    /// deletion once the ceiling is reached — one atomic store step.
    async fn escalate(&self, queued: &QueuedOperation) -> Result<AttemptOutcome, EngineError> {
        self.store.record_attempt(queued.id, now_ms()).await
    }

    /// Optimistic direct-send: try the wire while online, fall back to the
    /// queue on any failure (or immediately when offline).
    pub async fn submit(
        &self,
        operation: Operation,
        priority: i64,
        max_attempts: i64,
        online: bool,
    ) -> Result<SubmitOutcome, EngineError> {
        if online {
            match self.replay(&operation).await {
                Ok(result) => {
                    use crate::metrics::REPLAYS_TOTAL;
                    REPLAYS_TOTAL
                        .with_label_values(&[operation.kind(), "delivered"])
                        .inc();
                    return Ok(SubmitOutcome::Delivered(result));
                }
                Err(error) => {
                    tracing::debug!(
                        kind = operation.kind(),
                        %error,
                        "Direct send failed; deferring to queue"
                    );
                }
            }
        }

        let id = self.enqueue(operation, priority, max_attempts).await?;
        Ok(SubmitOutcome::Queued(id))
    }

    /// Best-effort flush of critical (priority 1) operations via the
    /// beacon endpoint.
    ///
    /// No delivery confirmation exists, so the operations stay queued and
    /// will be replayed again on the next normal drain — an intentional
    /// at-least-once duplicate-risk tradeoff.
    pub async fn flush_critical(&self) -> Result<usize, EngineError> {
        let critical: Vec<QueuedOperation> = self
            .list_pending()
            .await?
            .into_iter()
            .filter(|op| op.priority == CRITICAL_PRIORITY)
            .collect();

        if critical.is_empty() {
            return Ok(0);
        }

        let count = critical.len();
        if let Err(error) = self.contract.beacon(&critical).await {
            tracing::warn!(%error, count, "Critical beacon flush failed");
        } else {
            use crate::metrics::BEACON_FLUSHES_TOTAL;
            BEACON_FLUSHES_TOTAL.inc();
            tracing::info!(count, "Critical operations flushed via beacon");
        }

        Ok(count)
    }

    async fn update_depth_gauge(&self) {
        if let Ok(depth) = self.store.count_operations().await {
            use crate::metrics::QUEUE_DEPTH;
            QUEUE_DEPTH.set(depth);
        }
    }
}
