//! Outpost binary entry point

use outpost::{EngineState, config, sync};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize EngineState
/// 4. Install the interception layer (shell precache + activate)
/// 5. Start background tasks (prober, orchestrator)
/// 6. Start the proxy server with graceful shutdown
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("OUTPOST__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "outpost=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "outpost=info,tower_http=debug".into()),
            )
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Outpost...");

    // 2. Initialize metrics
    outpost::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        upstream = %config.upstream.base_url,
        store = %config.store.path.display(),
        "Configuration loaded"
    );

    // 4. Initialize engine state
    let (state, signal_rx) = EngineState::new(config.clone()).await?;

    // 5. Install the interception layer
    outpost::proxy::install(&state).await;

    // 6. Start background tasks
    let prober = sync::spawn_connectivity_probe(
        state.contract.clone(),
        std::time::Duration::from_secs(config.sync.probe_interval_seconds),
        state.online_sender(),
    );

    let orchestrator = sync::SyncOrchestrator::new(
        state.queue.clone(),
        config.sync.clone(),
        state.subscribe_online(),
        signal_rx,
    )
    .spawn();

    // 7. Build router and start the proxy server
    let app = outpost::build_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Proxy listening on {}", addr);
    tracing::info!("Upstream origin: {}", config.upstream.base_url);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The session-end hook: the orchestrator flushes critical operations
    // over the beacon path before the process exits.
    orchestrator.shutdown().await;
    prober.abort();

    tracing::info!("Outpost stopped");
    Ok(())
}

/// Resolve when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
}
