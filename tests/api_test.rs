use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt; // for `oneshot`

use bundlebox::api::models::{BundleCreatedResponse, ControlResponse};
use bundlebox::api::{AppState, router};
use bundlebox::config::Config;
use bundlebox::context::Runtime;
use bundlebox::queue::{FjallQueue, JobQueue, JobState, PART_QUEUE, RetryPolicy};

/// Builds a test app over an isolated queue. No workers run, so parts stay
/// where the requests put them.
fn build_test_app() -> (Router, Runtime, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");

    let mut config = Config::default();
    config.server.queue_path = temp_dir.path().join("queue");
    config.storage.download_dir = temp_dir.path().join("downloads");
    config.api.max_urls_per_bundle = 4;

    let queue = FjallQueue::open(&config.server.queue_path, RetryPolicy::default())
        .expect("Failed to open test queue");
    let runtime = Runtime::with_queue(config, Arc::new(queue)).expect("Failed to build runtime");

    let app = router(AppState::new(&runtime));
    (app, runtime, temp_dir)
}

fn post_bundle_request(body: Value) -> Request<Body> {
    Request::builder()
        .uri("/bundles")
        .method("POST")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = ServiceExt::<Request<Body>>::oneshot(app.clone(), request)
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

async fn create_bundle(app: &Router, urls: &[&str]) -> BundleCreatedResponse {
    let (status, body) = send(app, post_bundle_request(json!({ "name": "X", "urls": urls }))).await;
    assert_eq!(status, StatusCode::CREATED, "unexpected body: {body}");
    serde_json::from_value(body).unwrap()
}

#[tokio::test]
async fn test_create_bundle_success() {
    let (app, runtime, _temp_dir) = build_test_app();

    let created = create_bundle(&app, &["http://a/1.bin", "http://a/2.bin"]).await;
    assert_eq!(created.part_ids.len(), 2);
    assert!(created.part_ids.iter().all(|id| *id != created.bundle_id));

    let bundle = runtime.flow.bundle(created.bundle_id).await.unwrap().unwrap();
    assert_eq!(bundle.name, "X");
    assert!(!bundle.completed);
    assert_eq!(bundle.unprocessed.len(), 2);
    assert_eq!(runtime.metrics.snapshot().bundles_created, 1);

    let waiting = runtime
        .queue
        .list_by_state(PART_QUEUE, JobState::Waiting)
        .await
        .unwrap();
    assert_eq!(waiting, created.part_ids);
}

#[tokio::test]
async fn test_create_bundle_rejects_invalid_payloads() {
    let (app, _runtime, _temp_dir) = build_test_app();

    let (status, body) = send(&app, post_bundle_request(json!({ "name": "X", "urls": [] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PAYLOAD");

    let (status, _) = send(
        &app,
        post_bundle_request(json!({ "name": "", "urls": ["http://a/1"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_bundle_request(json!({ "name": "X", "urls": ["ftp://a/1"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let too_many: Vec<String> = (0..5).map(|i| format!("http://a/{i}")).collect();
    let (status, _) = send(
        &app,
        post_bundle_request(json!({ "name": "X", "urls": too_many })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post_bundle_request(json!({ "name": "X" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_bundle_requires_json_content_type() {
    let (app, _runtime, _temp_dir) = build_test_app();

    let request = Request::builder()
        .uri("/bundles")
        .method("POST")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(r#"{"name":"X","urls":["http://a/1"]}"#))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PAYLOAD");

    let request = Request::builder()
        .uri("/bundles")
        .method("POST")
        .body(Body::from(r#"{"name":"X","urls":["http://a/1"]}"#))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_bundle_payload_too_large() {
    let (app, _runtime, _temp_dir) = build_test_app();

    let huge_name = "x".repeat(300 * 1024);
    let (status, body) = send(
        &app,
        post_bundle_request(json!({ "name": huge_name, "urls": ["http://a/1"] })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn test_get_bundle_and_parts() {
    let (app, _runtime, _temp_dir) = build_test_app();
    let created = create_bundle(&app, &["http://a/1.bin", "http://a/2.bin"]).await;

    let (status, body) = send(&app, request("GET", &format!("/bundles/{}", created.bundle_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "X");
    assert_eq!(body["completed"], false);
    assert_eq!(body["parts"].as_array().unwrap().len(), 2);
    assert_eq!(body["parts"][0]["state"], "queued");
    assert_eq!(body["parts"][0]["name"], "1.bin");

    let part_id = created.part_ids[1];
    let (status, body) = send(&app, request("GET", &format!("/parts/{part_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["url"], "http://a/2.bin");
    assert_eq!(body["bundle_id"], json!(created.bundle_id));

    let (status, body) = send(&app, request("GET", "/bundles/active")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bundles"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        request("GET", &format!("/bundles/{}/progress", created.bundle_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["parts"], 2);
    assert_eq!(body["transferred"], 0);
}

#[tokio::test]
async fn test_get_missing_resources() {
    let (app, _runtime, _temp_dir) = build_test_app();

    let (status, body) = send(&app, request("GET", "/bundles/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(&app, request("GET", "/parts/999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, request("GET", "/bundles/999/progress")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // A part id does not name a bundle
    let created = create_bundle(&app, &["http://a/1"]).await;
    let (status, _) = send(&app, request("GET", &format!("/bundles/{}", created.part_ids[0]))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_pause_and_resume_queued_part() {
    let (app, _runtime, _temp_dir) = build_test_app();
    let created = create_bundle(&app, &["http://a/1", "http://a/2"]).await;
    let part_id = created.part_ids[0];

    let (status, body) = send(&app, request("PATCH", &format!("/parts/{part_id}/pause"))).await;
    assert_eq!(status, StatusCode::OK);
    let response: ControlResponse = serde_json::from_value(body).unwrap();
    assert_eq!(response.outcome, "paused");

    // Pausing twice is a no-op
    let (_, body) = send(&app, request("PATCH", &format!("/parts/{part_id}/pause"))).await;
    assert_eq!(body["outcome"], "unchanged");

    let (_, body) = send(&app, request("GET", "/parts/paused")).await;
    let paused = body["parts"].as_array().unwrap();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused[0]["id"], json!(part_id));

    let (status, body) = send(&app, request("PATCH", &format!("/parts/{part_id}/resume"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "resumed");

    let (_, body) = send(&app, request("GET", &format!("/parts/{part_id}"))).await;
    assert_eq!(body["state"], "queued");

    let (_, body) = send(&app, request("PATCH", &format!("/parts/{part_id}/resume"))).await;
    assert_eq!(body["outcome"], "unchanged");
}

#[tokio::test]
async fn test_resume_missing_or_finished_part() {
    let (app, runtime, _temp_dir) = build_test_app();

    let (status, _) = send(&app, request("PATCH", "/parts/999/resume")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let created = create_bundle(&app, &["http://a/1"]).await;
    let job = runtime.queue.claim(PART_QUEUE).await.unwrap().unwrap();
    assert!(runtime.queue.complete(job.id).await.unwrap());

    let (status, body) = send(&app, request("PATCH", &format!("/parts/{}/resume", created.part_ids[0]))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
}

#[tokio::test]
async fn test_cancel_queued_part_removes_it() {
    let (app, runtime, _temp_dir) = build_test_app();
    let created = create_bundle(&app, &["http://a/1", "http://a/2"]).await;
    let part_id = created.part_ids[0];

    let (status, body) = send(&app, request("DELETE", &format!("/parts/{part_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "removed");

    let (status, _) = send(&app, request("GET", &format!("/parts/{part_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Idempotent
    let (status, body) = send(&app, request("DELETE", &format!("/parts/{part_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "unchanged");

    let bundle = runtime.flow.bundle(created.bundle_id).await.unwrap().unwrap();
    assert!(bundle.processed.contains(&part_id));
    assert!(!bundle.completed);
}

#[tokio::test]
async fn test_cancel_last_part_completes_bundle() {
    let (app, runtime, _temp_dir) = build_test_app();
    let created = create_bundle(&app, &["http://a/1"]).await;

    let (_, body) = send(&app, request("DELETE", &format!("/parts/{}", created.part_ids[0]))).await;
    assert_eq!(body["outcome"], "removed");

    let bundle = runtime.flow.bundle(created.bundle_id).await.unwrap().unwrap();
    assert!(bundle.completed);
}

#[tokio::test]
async fn test_control_active_part_is_signalled() {
    let (app, runtime, _temp_dir) = build_test_app();
    let created = create_bundle(&app, &["http://a/1"]).await;
    let part_id = created.part_ids[0];

    let mut watch = runtime.inbox.register(part_id);
    runtime.queue.claim(PART_QUEUE).await.unwrap().unwrap();

    let (status, body) = send(&app, request("PATCH", &format!("/parts/{part_id}/pause"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["outcome"], "signalled");
    assert!(watch.pending().is_some());

    let (status, body) = send(&app, request("DELETE", &format!("/parts/{part_id}"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["outcome"], "signalled");

    let kind = tokio::time::timeout(Duration::from_secs(1), watch.changed())
        .await
        .unwrap();
    assert_eq!(kind, bundlebox::control::ControlKind::Cancel);
}

#[tokio::test]
async fn test_part_routes_ignore_bundle_ids() {
    let (app, runtime, _temp_dir) = build_test_app();
    let created = create_bundle(&app, &["http://a/1", "http://a/2"]).await;
    let bundle_id = created.bundle_id;

    let (status, _) = send(&app, request("GET", &format!("/parts/{bundle_id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, request("PATCH", &format!("/parts/{bundle_id}/pause"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "unchanged");

    let (status, _) = send(&app, request("PATCH", &format!("/parts/{bundle_id}/resume"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&app, request("DELETE", &format!("/parts/{bundle_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "unchanged");

    // The bundle and its parts are untouched and still complete normally
    let parent = runtime.queue.get_job(bundle_id).await.unwrap().unwrap();
    assert_eq!(parent.state, JobState::Waiting);
    for _ in &created.part_ids {
        let job = runtime.queue.claim(PART_QUEUE).await.unwrap().unwrap();
        assert!(runtime.queue.complete(job.id).await.unwrap());
    }
    runtime.pipeline.settle_bundle(bundle_id).await.unwrap();

    let bundle = runtime.flow.bundle(bundle_id).await.unwrap().unwrap();
    assert!(bundle.completed);
}

#[tokio::test]
async fn test_cancel_paused_part_with_output() {
    let (app, runtime, temp_dir) = build_test_app();
    let created = create_bundle(&app, &["http://a/1.bin"]).await;
    let part_id = created.part_ids[0];

    // Leave a paused part with a partial file, as a worker would
    let job = runtime.queue.claim(PART_QUEUE).await.unwrap().unwrap();
    let storage = bundlebox::storage::LocalStorage::new(temp_dir.path().join("downloads"));
    let mut file = storage.create(job.parent_id, part_id, "1.bin").await.unwrap();
    file.write(b"partial").await.unwrap();
    let path = file.close().await.unwrap();
    runtime.queue.delay(part_id, None, JobState::Active).await.unwrap();

    let (status, body) = send(&app, request("DELETE", &format!("/parts/{part_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "cancelled");
    assert!(!path.exists());

    let (_, body) = send(&app, request("GET", &format!("/parts/{part_id}"))).await;
    assert_eq!(body["state"], "cancelled");
    assert_eq!(runtime.metrics.snapshot().parts_cancelled, 1);

    let bundle = runtime.flow.bundle(created.bundle_id).await.unwrap().unwrap();
    assert!(bundle.completed);
}

#[tokio::test]
async fn test_parts_stream_pushes_lifecycle_events() {
    let (app, _runtime, _temp_dir) = build_test_app();
    let created = create_bundle(&app, &["http://a/1"]).await;
    let part_id = created.part_ids[0];

    let response = ServiceExt::<Request<Body>>::oneshot(
        app.clone(),
        request("GET", "/parts/stream?topics=paused"),
    )
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let (_, body) = send(&app, request("PATCH", &format!("/parts/{part_id}/pause"))).await;
    assert_eq!(body["outcome"], "paused");

    let mut frames = response.into_body().into_data_stream();
    let frame = tokio::time::timeout(Duration::from_secs(2), frames.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.to_vec()).unwrap();
    assert!(text.contains("event: paused"), "unexpected frame: {text}");
    assert!(text.contains(&format!("\"id\":{part_id}")));
}

#[tokio::test]
async fn test_stream_rejects_unknown_topic() {
    let (app, _runtime, _temp_dir) = build_test_app();

    let (status, body) = send(&app, request("GET", "/bundles/stream?topics=progress,bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_PAYLOAD");
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _runtime, _temp_dir) = build_test_app();

    let (status, body) = send(&app, request("GET", "/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"]["queue"], "healthy");
    assert_eq!(body["rate_budget"], "10MB/s");
    assert_eq!(body["metrics"]["bundles_created"], 0);
}

#[tokio::test]
async fn test_non_numeric_id_is_rejected() {
    let (app, _runtime, _temp_dir) = build_test_app();

    let (status, _) = send(&app, request("GET", "/parts/abc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
