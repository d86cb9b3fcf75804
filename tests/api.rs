//! HTTP API Integration Tests
//!
//! Drives the router in-process with `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use huntarr::adapters::NullAutomation;
use huntarr::api::{build_router, ApiState};
use huntarr::core::{Orchestrator, OrchestratorSettings};
use huntarr::pipeline::hunt_registry;
use huntarr::store::Store;
use serde_json::{json, Value};
use tower::ServiceExt;

fn orchestrator() -> Arc<Orchestrator> {
    let settings = OrchestratorSettings {
        auto_drive: false,
        ..Default::default()
    };
    Orchestrator::new(
        Arc::new(Store::open_in_memory().unwrap()),
        hunt_registry(Arc::new(NullAutomation)).unwrap(),
        settings,
    )
}

fn app() -> Router {
    build_router(ApiState::new(orchestrator()))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn create_run(app: &Router) -> String {
    let (status, run) = send(app, post("/api/runs", json!({ "mode": "manual" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    run["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(&app(), get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert!(body["database_time"].is_string());
}

#[tokio::test]
async fn test_create_and_fetch_run() {
    let app = app();
    let (status, run) = send(
        &app,
        post(
            "/api/runs",
            json!({ "mode": "scheduled", "search_config": { "role_keywords": ["rust"] } }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(run["status"], "queued");
    assert_eq!(run["mode"], "scheduled");
    assert_eq!(run["search_config"]["role_keywords"], json!(["rust"]));

    let id = run["id"].as_str().unwrap();
    let (status, fetched) = send(&app, get(&format!("/api/runs/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    // timestamps included: the create response is the stored record
    assert_eq!(fetched, run);

    let (status, list) = send(&app, get("/api/runs?limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["items"].as_array().unwrap().len(), 1);

    let (status, events) = send(&app, get(&format!("/api/runs/{}/events/batch", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events[0]["event_type"], "run_created");
}

#[tokio::test]
async fn test_invalid_input_is_rejected() {
    let app = app();

    let (status, body) = send(
        &app,
        post("/api/runs", json!({ "search_config": { "max_jobs_per_run": 0 } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_argument");

    let malformed = Request::builder()
        .method("POST")
        .uri("/api/runs")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_argument");

    let id = create_run(&app).await;
    for query in ["limit=0", "limit=251", "after_id=-1"] {
        let (status, _) = send(&app, get(&format!("/api/runs/{}/events/batch?{}", id, query))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "query {}", query);
    }

    let (status, _) = send(&app, get("/api/manual-actions?status=bogus")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_not_found_carries_request_id() {
    let request = Request::builder()
        .uri("/api/runs/does-not-exist")
        .header("x-request-id", "req-7")
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-request-id"], "req-7");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["request_id"], "req-7");
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(body["error"]["details"]["id"], "does-not-exist");
}

#[tokio::test]
async fn test_pause_queued_run_conflicts() {
    let app = app();
    let id = create_run(&app).await;

    let (status, body) = send(&app, post_empty(&format!("/api/runs/{}/pause", id))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "invalid_state");
    assert_eq!(body["error"]["details"]["status"], "queued");
}

#[tokio::test]
async fn test_manual_action_flow() {
    let app = app();
    let run_id = create_run(&app).await;

    let (status, action) = send(
        &app,
        post(
            "/api/manual-actions",
            json!({ "run_id": run_id, "action_type": "captcha", "job_id": "job-1" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(action["status"], "pending");
    let action_id = action["id"].as_str().unwrap().to_string();

    let (_, run) = send(&app, get(&format!("/api/runs/{}", run_id))).await;
    assert_eq!(run["status"], "paused");

    // resume is refused while the action is outstanding
    let (status, body) = send(&app, post_empty(&format!("/api/runs/{}/resume", run_id))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "manual_action_pending");
    assert_eq!(body["error"]["details"]["manual_action_id"], action_id);

    let resolve_uri = format!("/api/manual-actions/{}/resolve", action_id);
    let (status, _) = send(&app, post(&resolve_uri, json!({ "status": "pending" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, first) = send(&app, post_empty(&resolve_uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "resolved");

    let (status, second) = send(&app, post(&resolve_uri, json!({ "details": { "late": true } }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, first);

    let (_, run) = send(&app, get(&format!("/api/runs/{}", run_id))).await;
    assert_eq!(run["status"], "queued");

    let (status, list) = send(
        &app,
        get(&format!("/api/manual-actions?status=resolved&run_id={}", run_id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list["items"][0]["id"], action_id);

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/api/manual-actions/{}", action_id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, get(&format!("/api/manual-actions/{}", action_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_session_on_unknown_action() {
    let (status, body) = send(&app(), post_empty("/api/manual-actions/nope/start-session")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["details"]["kind"], "manual action");
}

#[tokio::test]
async fn test_applications_list_is_wrapped() {
    let (status, body) = send(&app(), get("/api/applications?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "items": [] }));
}

#[tokio::test]
async fn test_event_stream_replays_finished_run() {
    let orch = orchestrator();
    let app = build_router(ApiState::new(Arc::clone(&orch)));
    let run_id = create_run(&app).await;
    let run = orch.run_to_idle(&run_id).await.unwrap();
    assert_eq!(run.status.as_str(), "completed");

    let request = Request::builder()
        .uri(format!("/api/runs/{}/events", run_id))
        .header("last-event-id", "1")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // the stream ends on its own once a terminal run is drained
    let bytes = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), usize::MAX),
    )
    .await
    .unwrap()
    .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    let ids: Vec<i64> = text
        .lines()
        .filter_map(|line| line.strip_prefix("id:"))
        .map(|id| id.trim().parse().unwrap())
        .collect();
    assert_eq!(ids.first(), Some(&2));
    assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
    assert!(text.contains("run_event"));
    assert!(text.contains("run_completed"));
}
