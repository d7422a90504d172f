//! Common test utilities for E2E tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use outpost::{EngineState, config, sync};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// A request the mock upstream received.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
struct MockState {
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    /// Scripted HTTP statuses for upcoming requests (FIFO); an empty
    /// queue answers 200.
    failures: Arc<Mutex<VecDeque<u16>>>,
    /// Fixed body for GET requests, if set
    get_body: Arc<Mutex<Option<String>>>,
    /// Extra headers stamped onto every response
    response_headers: Arc<Mutex<Vec<(String, String)>>>,
}

/// A scriptable upstream origin.
///
/// Records every request and answers 200 JSON unless a failure status
/// has been scripted with `fail_next`. Shutting it down turns further
/// requests into transport failures (connection refused).
pub struct MockUpstream {
    pub base_url: String,
    state: MockState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockUpstream {
    pub async fn start() -> Self {
        let state = MockState {
            requests: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            get_body: Arc::new(Mutex::new(None)),
            response_headers: Arc::new(Mutex::new(Vec::new())),
        };

        let app = axum::Router::new()
            .fallback(mock_handler)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Script the next responses: one HTTP status per upcoming request.
    pub fn fail_next(&self, statuses: &[u16]) {
        let mut failures = self.state.failures.lock().unwrap();
        failures.extend(statuses.iter().copied());
    }

    /// Fix the body every GET answers with.
    pub fn set_get_body(&self, body: &str) {
        *self.state.get_body.lock().unwrap() = Some(body.to_string());
    }

    /// Stamp a header onto every response.
    pub fn set_response_header(&self, name: &str, value: &str) {
        self.state
            .response_headers
            .lock()
            .unwrap()
            .push((name.to_string(), value.to_string()));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    /// Stop the server; subsequent requests fail at the transport level.
    pub async fn go_offline(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Let in-flight connections drain before tests continue
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

async fn mock_handler(State(state): State<MockState>, req: Request) -> Response {
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let headers = req
        .headers()
        .iter()
        .filter_map(|(n, v)| {
            v.to_str()
                .ok()
                .map(|value| (n.as_str().to_string(), value.to_string()))
        })
        .collect();
    let body = to_bytes(req.into_body(), 16 * 1024 * 1024)
        .await
        .unwrap()
        .to_vec();

    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        path,
        content_type,
        headers,
        body,
    });

    let mut response = if let Some(status) = state.failures.lock().unwrap().pop_front() {
        (
            StatusCode::from_u16(status).unwrap(),
            axum::Json(serde_json::json!({ "error": "scripted failure" })),
        )
            .into_response()
    } else if method == "GET" && state.get_body.lock().unwrap().is_some() {
        let body = state.get_body.lock().unwrap().clone().unwrap();
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    } else {
        (
            StatusCode::OK,
            axum::Json(serde_json::json!({ "id": 1, "status": "ok" })),
        )
            .into_response()
    };

    for (name, value) in state.response_headers.lock().unwrap().iter() {
        if let (Ok(name), Ok(value)) = (
            name.parse::<axum::http::HeaderName>(),
            value.parse::<axum::http::HeaderValue>(),
        ) {
            response.headers_mut().append(name, value);
        }
    }

    response
}

/// A bound-then-dropped address; connecting to it is refused.
pub async fn dead_upstream_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Test engine instance: proxy server, engine state, orchestrator.
pub struct TestServer {
    pub addr: String,
    pub state: EngineState,
    pub orchestrator: Option<sync::OrchestratorHandle>,
    pub db_path: std::path::PathBuf,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// A server fronting the given upstream origin.
    pub async fn with_upstream(upstream_url: &str) -> Self {
        // The registry is process-global; register instruments once
        static METRICS: std::sync::Once = std::sync::Once::new();
        METRICS.call_once(outpost::metrics::init_metrics);

        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            upstream: config::UpstreamConfig {
                base_url: upstream_url.to_string(),
                api_prefix: "/api".to_string(),
                request_timeout_seconds: 2,
            },
            store: config::StoreConfig {
                path: db_path.clone(),
            },
            sync: config::SyncConfig {
                drain_interval_seconds: 3600,
                retention_interval_seconds: 3600,
                retention_days: 7,
                probe_interval_seconds: 3600,
                visibility_idle_seconds: 3600,
            },
            cache: config::CacheConfig {
                shell_version: "v1".to_string(),
                shell_manifest: vec![],
                runtime_max_entries: 64,
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };

        let (state, signal_rx) = EngineState::new(config.clone()).await.unwrap();

        // Tests flip connectivity explicitly instead of running the prober
        let orchestrator = sync::SyncOrchestrator::new(
            state.queue.clone(),
            config.sync.clone(),
            state.subscribe_online(),
            signal_rx,
        )
        .spawn();

        // No redirect following: deferral answers are 302s the tests inspect
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let addr_str = format!("http://{}", addr);

        let app = outpost::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        Self {
            addr: addr_str,
            state,
            orchestrator: Some(orchestrator),
            db_path,
            _temp_dir: temp_dir,
            client,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// A second pool onto the same store file, for fixture surgery
    /// such as backdating timestamps.
    pub async fn raw_pool(&self) -> sqlx::SqlitePool {
        sqlx::SqlitePool::connect(&format!("sqlite:{}", self.db_path.display()))
            .await
            .unwrap()
    }

    /// Stop the orchestrator, running its shutdown flush.
    pub async fn shutdown_orchestrator(&mut self) {
        if let Some(handle) = self.orchestrator.take() {
            handle.shutdown().await;
        }
    }
}
