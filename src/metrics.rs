//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Queue Metrics
    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "outpost_queue_depth",
        "Current number of pending queued operations"
    ).expect("metric can be created");
    pub static ref OPERATIONS_ENQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("outpost_operations_enqueued_total", "Total number of operations enqueued"),
        &["kind"]
    ).expect("metric can be created");
    pub static ref REPLAYS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("outpost_replays_total", "Total number of replay attempts"),
        &["kind", "outcome"]
    ).expect("metric can be created");
    pub static ref OPERATIONS_DROPPED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("outpost_operations_dropped_total", "Total number of operations dropped from the queue"),
        &["kind", "reason"]
    ).expect("metric can be created");
    pub static ref DRAINS_TOTAL: IntCounter = IntCounter::new(
        "outpost_drains_total",
        "Total number of drain passes"
    ).expect("metric can be created");
    pub static ref DRAIN_DURATION_SECONDS: prometheus::Histogram = prometheus::Histogram::with_opts(
        HistogramOpts::new(
            "outpost_drain_duration_seconds",
            "Drain pass duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).expect("metric can be created");
    pub static ref RETENTION_DELETES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("outpost_retention_deletes_total", "Total records deleted by the retention sweep"),
        &["collection"]
    ).expect("metric can be created");
    pub static ref BEACON_FLUSHES_TOTAL: IntCounter = IntCounter::new(
        "outpost_beacon_flushes_total",
        "Total number of critical-operation beacon flushes"
    ).expect("metric can be created");

    // Proxy Metrics
    pub static ref PROXY_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("outpost_proxy_requests_total", "Total number of intercepted requests"),
        &["class", "outcome"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("outpost_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("outpost_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("outpost_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Connectivity Metrics
    pub static ref ONLINE: IntGauge = IntGauge::new(
        "outpost_online",
        "1 while the upstream backend is reachable, 0 while offline"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("outpost_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(QUEUE_DEPTH.clone()))
        .expect("QUEUE_DEPTH can be registered");
    REGISTRY
        .register(Box::new(OPERATIONS_ENQUEUED_TOTAL.clone()))
        .expect("OPERATIONS_ENQUEUED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(REPLAYS_TOTAL.clone()))
        .expect("REPLAYS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(OPERATIONS_DROPPED_TOTAL.clone()))
        .expect("OPERATIONS_DROPPED_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DRAINS_TOTAL.clone()))
        .expect("DRAINS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DRAIN_DURATION_SECONDS.clone()))
        .expect("DRAIN_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(RETENTION_DELETES_TOTAL.clone()))
        .expect("RETENTION_DELETES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(BEACON_FLUSHES_TOTAL.clone()))
        .expect("BEACON_FLUSHES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(PROXY_REQUESTS_TOTAL.clone()))
        .expect("PROXY_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_HITS_TOTAL.clone()))
        .expect("CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_MISSES_TOTAL.clone()))
        .expect("CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_SIZE.clone()))
        .expect("CACHE_SIZE can be registered");
    REGISTRY
        .register(Box::new(ONLINE.clone()))
        .expect("ONLINE can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}

/// Metrics endpoint handler
///
/// Returns all metrics in Prometheus text format.
async fn metrics_handler() -> axum::response::Response {
    use axum::response::IntoResponse;
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

/// Create metrics router
///
/// Exposes the `/metrics` endpoint.
pub fn metrics_router<S>() -> axum::Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    axum::Router::new().route("/metrics", axum::routing::get(metrics_handler))
}
