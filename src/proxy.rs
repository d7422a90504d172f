//! Network interception layer
//!
//! A request-level proxy fronting the upstream origin. Every incoming
//! request is classified and served by one of three strategies:
//! cache-first for static assets and navigations, network-first with
//! cache fallback for API calls, and offline deferral for form
//! submissions. The proxy runs independently of any client session and
//! coordinates with the engine only through the signal channel and the
//! durable store.

use std::collections::BTreeMap;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;

use crate::EngineState;
use crate::data::{CachedResponse, Operation, PostPayload, RUNTIME_CACHE, request_key};
use crate::error::EngineError;

/// Largest request/response body the proxy will buffer.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Synthesized fallback page for navigations that fail without a cache
/// entry. Links to the posts view, the same target the notification
/// deep-link used.
const OFFLINE_FALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Offline</title>
</head>
<body>
  <h1>You are offline</h1>
  <p>Your changes are saved locally and will sync when the connection returns.</p>
  <p><a href="/posts">View your posts</a></p>
</body>
</html>
"#;

/// How a request will be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// POST form submission: forward, defer on failure
    FormSubmission,
    /// API call: network-first with cache fallback
    Api,
    /// Static asset or navigation: cache-first
    Static,
}

impl RequestClass {
    fn as_str(&self) -> &'static str {
        match self {
            Self::FormSubmission => "form",
            Self::Api => "api",
            Self::Static => "static",
        }
    }
}

/// Classify a request by method, content type, and path.
pub fn classify(method: &Method, content_type: Option<&str>, path: &str, api_prefix: &str) -> RequestClass {
    if *method == Method::POST {
        let form_like = content_type.is_some_and(|ct| {
            ct.starts_with("application/x-www-form-urlencoded") || ct.starts_with("multipart/form-data")
        });
        if form_like {
            return RequestClass::FormSubmission;
        }
    }

    if path.starts_with(api_prefix) {
        return RequestClass::Api;
    }

    RequestClass::Static
}

/// Build the proxy router: internal engine endpoints, the metrics
/// endpoint, and the classifying fallback that intercepts everything
/// else.
pub fn router(state: EngineState) -> Router {
    Router::new()
        .route("/_outpost/sync", post(trigger_sync))
        .route("/_outpost/export", get(export_state))
        .route("/_outpost/import", post(import_state))
        .route("/_outpost/caches/evict", post(evict_caches))
        .fallback(intercept)
        .with_state(state)
}

/// On-startup install step: precache the shell manifest under the
/// versioned cache name, then activate (expiring stale versions).
pub async fn install(state: &EngineState) {
    let shell_cache = state.cache.shell_cache_name();
    let manifest = &state.config.cache.shell_manifest;

    for path in manifest {
        let url = state.config.upstream.url_for(path);
        match state.http_client.get(&url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                let content_type = response_content_type(&response);
                match response.bytes().await {
                    Ok(body) => {
                        state
                            .cache
                            .put(
                                &shell_cache,
                                request_key("GET", path),
                                CachedResponse::new(200, content_type, body),
                            )
                            .await;
                        tracing::debug!(path = %path, "Shell URL precached");
                    }
                    Err(error) => {
                        tracing::warn!(path = %path, %error, "Failed to read shell URL body");
                    }
                }
            }
            Ok(response) => {
                tracing::warn!(path = %path, status = %response.status(), "Shell URL not precached");
            }
            Err(error) => {
                tracing::warn!(path = %path, %error, "Shell URL fetch failed during install");
            }
        }
    }

    state.cache.activate();
    tracing::info!(
        cache = %shell_cache,
        urls = manifest.len(),
        "Interception layer installed"
    );
}

// =============================================================================
// Fallback interception
// =============================================================================

async fn intercept(State(state): State<EngineState>, req: Request) -> Response {
    // Renewed client activity after an idle gap doubles as the
    // visibility-restored trigger.
    if state.note_activity() && state.is_online() {
        state.signal_drain();
    }

    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();
    let path = uri.path().to_string();

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let class = classify(
        &method,
        content_type.as_deref(),
        &path,
        &state.config.upstream.api_prefix,
    );

    let body = match to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(%error, "Failed to buffer request body");
            return EngineError::Validation("request body too large".to_string()).into_response();
        }
    };

    let response = match class {
        RequestClass::FormSubmission => {
            serve_form_submission(&state, &method, &uri, &headers, content_type.as_deref(), body)
                .await
        }
        RequestClass::Api => serve_network_first(&state, &method, &uri, &headers, body).await,
        RequestClass::Static => serve_cache_first(&state, &method, &uri, &headers, body).await,
    };

    response
}

/// Cache-first: durable cache hit, else network (caching good basic
/// responses), else the offline fallback for navigations.
async fn serve_cache_first(
    state: &EngineState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let key = request_key(method.as_str(), path_and_query(uri));

    if let Some(cached) = state.cache.get_any(&key).await {
        observe("static", "cache");
        return cached_to_response(&cached);
    }

    match forward(state, method, uri, headers, body).await {
        Ok(upstream) => {
            if upstream.status == 200 && *method == Method::GET {
                state
                    .cache
                    .put(RUNTIME_CACHE, key, upstream.to_cached())
                    .await;
            }
            observe("static", "network");
            upstream.into_response()
        }
        Err(error) => {
            if is_navigation(method, headers) {
                tracing::debug!(%error, path = %uri.path(), "Navigation offline; serving fallback page");
                observe("static", "fallback");
                offline_fallback_page()
            } else {
                observe("static", "synthesized");
                offline_json_response()
            }
        }
    }
}

/// Network-first: try upstream, cache successful GET responses, fall
/// back to the runtime cache, and synthesize an offline JSON answer as
/// the last resort.
async fn serve_network_first(
    state: &EngineState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let key = request_key(method.as_str(), path_and_query(uri));

    match forward(state, method, uri, headers, body).await {
        Ok(upstream) => {
            if upstream.status == 200 && *method == Method::GET {
                state
                    .cache
                    .put(RUNTIME_CACHE, key, upstream.to_cached())
                    .await;
            }
            observe("api", "network");
            upstream.into_response()
        }
        Err(error) => {
            tracing::debug!(%error, path = %uri.path(), "API call offline; trying runtime cache");
            if let Some(cached) = state.cache.get(RUNTIME_CACHE, &key).await {
                observe("api", "cache");
                cached_to_response(&cached)
            } else {
                observe("api", "synthesized");
                offline_json_response()
            }
        }
    }
}

/// Offline deferral: forward the submission; on network failure capture
/// the form fields, hand them to the engine as a queued operation, and
/// answer with a redirect so the submission appears successful.
async fn serve_form_submission(
    state: &EngineState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    content_type: Option<&str>,
    body: Bytes,
) -> Response {
    match forward(state, method, uri, headers, body.clone()).await {
        Ok(upstream) => {
            observe("form", "network");
            upstream.into_response()
        }
        Err(error) => {
            tracing::info!(%error, path = %uri.path(), "Form submission offline; deferring");

            let fields = match extract_form_fields(content_type, body).await {
                Ok(fields) => fields,
                Err(error) => {
                    tracing::warn!(%error, "Failed to extract deferred form fields");
                    observe("form", "synthesized");
                    return offline_json_response();
                }
            };

            let operation = operation_for_form(uri.path(), fields);
            state.signal_enqueue(operation);

            observe("form", "deferred");
            offline_redirect(uri)
        }
    }
}

// =============================================================================
// Forwarding
// =============================================================================

/// Whether a header is carried across the proxy hop.
///
/// Hop-by-hop headers describe the connection, not the message, and stay
/// on their side; Host and Content-Length are recomputed by the HTTP
/// stacks.
fn is_forwardable(name: &header::HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

/// A buffered upstream response, end-to-end headers included.
struct UpstreamResponse {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
}

impl UpstreamResponse {
    fn content_type(&self) -> String {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string()
    }

    fn to_cached(&self) -> CachedResponse {
        CachedResponse::new(self.status, self.content_type(), self.body.clone())
    }

    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        for (name, value) in &self.headers {
            if is_forwardable(name) {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        response
    }
}

/// Replay a request against the upstream origin, carrying every
/// end-to-end header in both directions (cookies, auth, redirects).
async fn forward(
    state: &EngineState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<UpstreamResponse, reqwest::Error> {
    let url = state.config.upstream.url_for(path_and_query(uri));

    let mut outbound = HeaderMap::new();
    for (name, value) in headers {
        if is_forwardable(name) {
            outbound.append(name.clone(), value.clone());
        }
    }

    let mut request = state
        .http_client
        .request(method.clone(), &url)
        .headers(outbound);
    if !body.is_empty() {
        request = request.body(body);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.bytes().await?;

    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}

fn response_content_type(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string()
}

// =============================================================================
// Deferral helpers
// =============================================================================

/// Pull the key/value fields out of a urlencoded or multipart body.
async fn extract_form_fields(
    content_type: Option<&str>,
    body: Bytes,
) -> Result<BTreeMap<String, String>, EngineError> {
    let content_type = content_type.unwrap_or("");

    if content_type.starts_with("multipart/form-data") {
        let request = Request::builder()
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("rebuild request: {e}")))?;

        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| EngineError::Validation(format!("not a multipart body: {e}")))?;

        let mut fields = BTreeMap::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| EngineError::Validation(format!("multipart field: {e}")))?
        {
            let Some(name) = field.name().map(|n| n.to_string()) else {
                continue;
            };
            let value = field
                .text()
                .await
                .map_err(|e| EngineError::Validation(format!("multipart text: {e}")))?;
            fields.insert(name, value);
        }
        return Ok(fields);
    }

    Ok(url::form_urlencoded::parse(&body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect())
}

/// Map a deferred submission to its queued operation by target path.
pub fn operation_for_form(path: &str, fields: BTreeMap<String, String>) -> Operation {
    if path.contains("bulk-upload") {
        return Operation::BulkUpload { fields };
    }

    if let Some(id) = delete_target(path) {
        return Operation::DeletePost { id };
    }

    let payload: serde_json::Map<String, serde_json::Value> = fields
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();
    Operation::CreatePost(PostPayload::new(serde_json::Value::Object(payload)))
}

/// Parse `/api/post/{id}/delete` style paths.
fn delete_target(path: &str) -> Option<i64> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["api", "post", id, "delete"] => id.parse().ok(),
        _ => None,
    }
}

// =============================================================================
// Responses
// =============================================================================

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

fn build_response(status: u16, content_type: &str, body: Bytes) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build proxied response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

fn cached_to_response(cached: &CachedResponse) -> Response {
    build_response(cached.status, &cached.content_type, cached.body.clone())
}

/// `302` back to the submitted path with `offline=true` appended once.
fn offline_redirect(uri: &Uri) -> Response {
    let path = uri.path();
    let location = match uri.query() {
        Some(query) if query.split('&').any(|pair| pair == "offline=true") => {
            format!("{path}?{query}")
        }
        Some(query) if !query.is_empty() => format!("{path}?{query}&offline=true"),
        _ => format!("{path}?offline=true"),
    };

    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location)
        .body(Body::empty())
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to build offline redirect");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// Synthesized `503` JSON answer for unreachable API calls.
fn offline_json_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(header::CONTENT_TYPE, "application/json")],
        serde_json::json!({
            "error": "You are currently offline. This request has been queued.",
            "offline": true,
        })
        .to_string(),
    )
        .into_response()
}

fn offline_fallback_page() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        OFFLINE_FALLBACK_PAGE,
    )
        .into_response()
}

/// Whether a failed fetch should fall back to the offline page.
fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    *method == Method::GET
        && headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
}

fn observe(class: &str, outcome: &str) {
    use crate::metrics::PROXY_REQUESTS_TOTAL;
    PROXY_REQUESTS_TOTAL.with_label_values(&[class, outcome]).inc();
}

// =============================================================================
// Internal engine endpoints
// =============================================================================

/// Background-sync signal: ask the engine for a drain pass.
async fn trigger_sync(State(state): State<EngineState>) -> Response {
    state.signal_drain();
    (
        StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({ "scheduled": true })),
    )
        .into_response()
}

/// Export local state as `{posts, queue, exported}`.
async fn export_state(State(state): State<EngineState>) -> Result<Response, EngineError> {
    let document = crate::data::export(&state.queue).await?;
    Ok(axum::Json(document).into_response())
}

/// Import a previously exported document through the normal write paths.
async fn import_state(
    State(state): State<EngineState>,
    axum::Json(document): axum::Json<crate::data::ExportDocument>,
) -> Result<Response, EngineError> {
    let report = crate::data::import(&state.queue, document).await?;
    Ok(axum::Json(serde_json::json!({
        "posts": report.posts,
        "operations": report.operations,
    }))
    .into_response())
}

/// Storage-pressure corrective: evict stale response caches.
async fn evict_caches(State(state): State<EngineState>) -> Response {
    let deleted = state.cache.handle_quota_pressure();
    axum::Json(serde_json::json!({ "deleted": deleted })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_forms_classify_as_submissions() {
        assert_eq!(
            classify(
                &Method::POST,
                Some("application/x-www-form-urlencoded"),
                "/schedule-post",
                "/api"
            ),
            RequestClass::FormSubmission
        );
        assert_eq!(
            classify(
                &Method::POST,
                Some("multipart/form-data; boundary=x"),
                "/bulk-upload",
                "/api"
            ),
            RequestClass::FormSubmission
        );
    }

    #[test]
    fn json_posts_under_the_api_prefix_classify_as_api() {
        assert_eq!(
            classify(&Method::POST, Some("application/json"), "/api/posts", "/api"),
            RequestClass::Api
        );
        assert_eq!(
            classify(&Method::GET, None, "/api/stats", "/api"),
            RequestClass::Api
        );
    }

    #[test]
    fn everything_else_classifies_as_static() {
        assert_eq!(
            classify(&Method::GET, None, "/static/app.css", "/api"),
            RequestClass::Static
        );
        assert_eq!(
            classify(&Method::GET, Some("text/html"), "/dashboard", "/api"),
            RequestClass::Static
        );
    }

    #[test]
    fn form_targets_map_to_the_right_operations() {
        let mut fields = BTreeMap::new();
        fields.insert("content".to_string(), "hello".to_string());

        assert!(matches!(
            operation_for_form("/bulk-upload", fields.clone()),
            Operation::BulkUpload { .. }
        ));
        assert_eq!(
            operation_for_form("/api/post/42/delete", fields.clone()),
            Operation::DeletePost { id: 42 }
        );

        let created = operation_for_form("/schedule-post", fields);
        match created {
            Operation::CreatePost(payload) => {
                assert_eq!(payload.0["content"], "hello");
            }
            other => panic!("expected CreatePost, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn urlencoded_fields_are_extracted() {
        let body = Bytes::from_static(b"content=hello+world&platform=all");
        let fields = extract_form_fields(Some("application/x-www-form-urlencoded"), body)
            .await
            .unwrap();

        assert_eq!(fields["content"], "hello world");
        assert_eq!(fields["platform"], "all");
    }

    #[test]
    fn offline_redirect_appends_the_flag() {
        let uri: Uri = "/schedule-post".parse().unwrap();
        let response = offline_redirect(&uri);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/schedule-post?offline=true"
        );

        let uri: Uri = "/schedule-post?draft=1".parse().unwrap();
        let response = offline_redirect(&uri);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/schedule-post?draft=1&offline=true"
        );
    }

    #[test]
    fn offline_redirect_does_not_duplicate_the_flag() {
        let uri: Uri = "/schedule-post?offline=true".parse().unwrap();
        let response = offline_redirect(&uri);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/schedule-post?offline=true"
        );

        let uri: Uri = "/schedule-post?draft=1&offline=true".parse().unwrap();
        let response = offline_redirect(&uri);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/schedule-post?draft=1&offline=true"
        );
    }

    #[test]
    fn upstream_headers_are_mirrored_minus_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::SET_COOKIE, "session=abc; Path=/".parse().unwrap());
        headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());

        let response = UpstreamResponse {
            status: 302,
            headers,
            body: Bytes::new(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::SET_COOKIE).unwrap(),
            "session=abc; Path=/"
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
        assert!(response.headers().get(header::CONNECTION).is_none());
        assert!(response.headers().get(header::TRANSFER_ENCODING).is_none());
    }

    #[test]
    fn connection_scoped_headers_are_not_forwarded() {
        assert!(is_forwardable(&header::COOKIE));
        assert!(is_forwardable(&header::AUTHORIZATION));
        assert!(is_forwardable(&header::LOCATION));
        assert!(!is_forwardable(&header::HOST));
        assert!(!is_forwardable(&header::CONNECTION));
        assert!(!is_forwardable(&header::CONTENT_LENGTH));
    }

    #[test]
    fn fallback_page_is_nonempty_html()  {
        let response = offline_fallback_page();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
        assert!(!OFFLINE_FALLBACK_PAGE.trim().is_empty());
    }
}
