//! E2E tests for queue replay, retry escalation, and drop semantics

mod common;

use common::{MockUpstream, TestServer};
use outpost::data::{CRITICAL_PRIORITY, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, Operation, PostPayload};

fn create_op(content: &str) -> Operation {
    Operation::CreatePost(PostPayload::new(serde_json::json!({ "content": content })))
}

#[tokio::test]
async fn empty_drain_is_idempotent_and_makes_no_calls() {
    let upstream = MockUpstream::start().await;
    let server = TestServer::with_upstream(&upstream.base_url).await;

    for _ in 0..2 {
        let report = server.state.queue.drain().await.unwrap();
        assert_eq!(report.replayed, 0);
        assert_eq!(report.delivered, 0);
        assert_eq!(report.retried, 0);
        assert_eq!(report.dropped_permanent, 0);
        assert_eq!(report.dropped_exhausted, 0);
    }

    assert_eq!(upstream.request_count(), 0);
}

#[tokio::test]
async fn transient_failures_exhaust_after_max_attempts() {
    let upstream = MockUpstream::start().await;
    let server = TestServer::with_upstream(&upstream.base_url).await;

    server
        .state
        .queue
        .enqueue(create_op("doomed"), DEFAULT_PRIORITY, 3)
        .await
        .unwrap();

    upstream.fail_next(&[500, 500, 500]);

    let first = server.state.queue.drain().await.unwrap();
    assert_eq!(first.retried, 1);
    assert_eq!(server.state.queue.list_pending().await.unwrap().len(), 1);

    let second = server.state.queue.drain().await.unwrap();
    assert_eq!(second.retried, 1);
    assert_eq!(server.state.queue.list_pending().await.unwrap().len(), 1);

    let third = server.state.queue.drain().await.unwrap();
    assert_eq!(third.dropped_exhausted, 1);
    assert!(server.state.queue.list_pending().await.unwrap().is_empty());

    // One upstream call per drain pass, none after exhaustion
    assert_eq!(upstream.requests_for("/api/posts").len(), 3);
    let fourth = server.state.queue.drain().await.unwrap();
    assert_eq!(fourth.replayed, 0);
    assert_eq!(upstream.requests_for("/api/posts").len(), 3);
}

#[tokio::test]
async fn two_transient_failures_then_success_replays_identically() {
    let upstream = MockUpstream::start().await;
    let server = TestServer::with_upstream(&upstream.base_url).await;

    server
        .state
        .queue
        .enqueue(create_op("persistent"), DEFAULT_PRIORITY, DEFAULT_MAX_ATTEMPTS)
        .await
        .unwrap();

    upstream.fail_next(&[500, 503]);

    assert_eq!(server.state.queue.drain().await.unwrap().retried, 1);
    assert_eq!(server.state.queue.drain().await.unwrap().retried, 1);
    let report = server.state.queue.drain().await.unwrap();
    assert_eq!(report.delivered, 1);

    assert!(server.state.queue.list_pending().await.unwrap().is_empty());

    // Exactly three identical create calls reached the upstream
    let calls = upstream.requests_for("/api/posts");
    assert_eq!(calls.len(), 3);
    for call in &calls {
        assert_eq!(call.method, "POST");
        assert_eq!(call.body, calls[0].body);
    }
}

#[tokio::test]
async fn permanent_failure_drops_without_consuming_retry_budget() {
    let upstream = MockUpstream::start().await;
    let server = TestServer::with_upstream(&upstream.base_url).await;

    server
        .state
        .queue
        .enqueue(create_op("rejected"), DEFAULT_PRIORITY, DEFAULT_MAX_ATTEMPTS)
        .await
        .unwrap();

    upstream.fail_next(&[422]);

    let report = server.state.queue.drain().await.unwrap();
    assert_eq!(report.dropped_permanent, 1);
    assert_eq!(report.retried, 0);

    // Dropped on the first rejection; no retries follow
    assert!(server.state.queue.list_pending().await.unwrap().is_empty());
    assert_eq!(upstream.requests_for("/api/posts").len(), 1);
}

#[tokio::test]
async fn drain_replays_in_store_order_ignoring_priority() {
    let upstream = MockUpstream::start().await;
    let server = TestServer::with_upstream(&upstream.base_url).await;

    // Low-priority first, critical second; store order must win
    server
        .state
        .queue
        .enqueue(create_op("first"), DEFAULT_PRIORITY, DEFAULT_MAX_ATTEMPTS)
        .await
        .unwrap();
    server
        .state
        .queue
        .enqueue(create_op("second"), CRITICAL_PRIORITY, DEFAULT_MAX_ATTEMPTS)
        .await
        .unwrap();

    let report = server.state.queue.drain().await.unwrap();
    assert_eq!(report.delivered, 2);

    let calls = upstream.requests_for("/api/posts");
    assert_eq!(calls.len(), 2);

    let first: serde_json::Value = serde_json::from_slice(&calls[0].body).unwrap();
    let second: serde_json::Value = serde_json::from_slice(&calls[1].body).unwrap();
    assert_eq!(first["content"], "first");
    assert_eq!(second["content"], "second");
}

#[tokio::test]
async fn mixed_outcomes_in_one_pass_are_reported_separately() {
    let upstream = MockUpstream::start().await;
    let server = TestServer::with_upstream(&upstream.base_url).await;

    server
        .state
        .queue
        .enqueue(create_op("delivered"), DEFAULT_PRIORITY, DEFAULT_MAX_ATTEMPTS)
        .await
        .unwrap();
    server
        .state
        .queue
        .enqueue(create_op("rejected"), DEFAULT_PRIORITY, DEFAULT_MAX_ATTEMPTS)
        .await
        .unwrap();
    server
        .state
        .queue
        .enqueue(create_op("retried"), DEFAULT_PRIORITY, DEFAULT_MAX_ATTEMPTS)
        .await
        .unwrap();

    upstream.fail_next(&[200, 404, 502]);

    let report = server.state.queue.drain().await.unwrap();
    assert_eq!(report.replayed, 3);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.dropped_permanent, 1);
    assert_eq!(report.retried, 1);

    // Only the transiently failed operation survives
    let pending = server.state.queue.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, create_op("retried"));
}
