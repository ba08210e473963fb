use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use http_body_util::BodyExt;
use tower::ServiceExt;

use rtc_core::config::Config;
use rtc_core::dispatch::{DispatchOutcome, DispatchRequest, RequestDispatcher};
use rtc_core::engine::{Engine, EngineConfig};
use rtc_core::store::MemoryStore;
use rtc_server::AppState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Answers every dispatch with a fixed status and never calls back.
struct FixedDispatcher(u16);

#[async_trait]
impl RequestDispatcher for FixedDispatcher {
    async fn dispatch(&self, _request: &DispatchRequest) -> rtc_core::Result<DispatchOutcome> {
        Ok(DispatchOutcome::new(self.0, "Fixed"))
    }
}

fn app_state(dispatch_status: u16, max_attempts: u32, timeout_ms: u64) -> AppState {
    let config = Config::default();
    let engine_config = EngineConfig {
        max_attempts,
        timeout_limit: Duration::from_millis(timeout_ms),
        ..EngineConfig::from_config(&config).unwrap()
    };
    let engine = Engine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(FixedDispatcher(dispatch_status)),
        engine_config,
    )
    .unwrap();
    AppState::new(engine, config)
}

async fn send(
    app: axum::Router,
    method: &str,
    uri: &str,
    body: &str,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "text/plain")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    send(app, "GET", uri, "").await
}

async fn post(app: axum::Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
    send(app, "POST", uri, body).await
}

/// Poll the status endpoint until the run's step matches `step`.
async fn wait_for_step(app: &axum::Router, id: &str, step: &str) -> serde_json::Value {
    for _ in 0..300 {
        let (status, json) = get(app.clone(), &format!("/api/orchestrations/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        if json["step"]["type"] == step {
            return json;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance {id} never reached step '{step}'");
}

async fn start(app: &axum::Router) -> String {
    let (status, json) = post(app.clone(), "/api/orchestrations", "").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    json["id"].as_str().unwrap().to_string()
}

// ---------------------------------------------------------------------------
// Start / status / callback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_returns_addresses() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000));
    let (status, json) = post(app, "/api/orchestrations", "").await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let id = json["id"].as_str().unwrap();
    assert_eq!(
        json["status_uri"],
        format!("http://localhost:7071/api/orchestrations/{id}")
    );
    assert_eq!(
        json["callback_uri"],
        format!("http://localhost:7071/api/orchestrations/{id}/events/Callback")
    );
}

#[tokio::test]
async fn callback_completes_waiting_run() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000));
    let id = start(&app).await;

    let waiting = wait_for_step(&app, &id, "await_callback").await;
    assert_eq!(waiting["running"], true);
    assert_eq!(waiting["attempts"][0]["state"], "WaitingForCallback");

    let (status, json) = post(
        app.clone(),
        &format!("/api/orchestrations/{id}/events/Callback"),
        "\"True\"\n",
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["delivered"], true);

    let done = wait_for_step(&app, &id, "completed").await;
    assert_eq!(done["attempts"][0]["state"], "CallbackSuccess");
    assert_eq!(done["attempts"][0]["is_success"], true);
    assert_eq!(done["counters"]["attempts"], 1);
    assert_eq!(done["step"]["summary"]["succeeded"], true);
    assert_eq!(done["overall_state"], "Completed successfully after 1 attempt(s)");
}

#[tokio::test]
async fn callback_tagged_with_another_attempt_is_ignored() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000));
    let id = start(&app).await;

    let waiting = wait_for_step(&app, &id, "await_callback").await;
    let attempt = waiting["attempts"][0]["id"].as_str().unwrap().to_string();
    let other = uuid::Uuid::new_v4();

    let (status, json) = post(
        app.clone(),
        &format!("/api/orchestrations/{id}/events/Callback?attempt={other}"),
        "true",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["delivered"], false);
    assert_eq!(json["stale"], true);

    let (status, _) = post(
        app.clone(),
        &format!("/api/orchestrations/{id}/events/Callback?attempt=not-a-uuid"),
        "true",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = post(
        app.clone(),
        &format!("/api/orchestrations/{id}/events/Callback?attempt={attempt}"),
        "false",
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["delivered"], true);
}

#[tokio::test]
async fn failing_dispatch_is_visible_in_status() {
    let app = rtc_server::build_router(app_state(500, 2, 5_000));
    let id = start(&app).await;

    let done = wait_for_step(&app, &id, "completed").await;
    assert_eq!(done["counters"]["attempts"], 2);
    assert_eq!(done["counters"]["errors"], 2);
    assert_eq!(done["step"]["summary"]["succeeded"], false);
    let overall = done["overall_state"].as_str().unwrap();
    assert!(overall.starts_with("Failed after 2 attempt(s)"), "{overall}");
}

#[tokio::test]
async fn status_of_unknown_instance_is_404() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000));
    let (status, json) = get(app, "/api/orchestrations/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test]
async fn callback_without_waiter_is_a_noop() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000));
    let (status, json) = post(app, "/api/orchestrations/nobody/events/Callback", "true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["delivered"], false);
}

#[tokio::test]
async fn malformed_callback_body_is_400() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000));
    let (status, _) = post(app, "/api/orchestrations/x/events/Callback", "maybe").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_event_name_is_404() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000));
    let (status, _) = post(app, "/api/orchestrations/x/events/Other", "true").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_includes_started_instances() {
    let app = rtc_server::build_router(app_state(500, 1, 5_000));
    let id = start(&app).await;
    let (status, json) = get(app, "/api/orchestrations").await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = json["instances"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(ids.contains(&id.as_str()));
}

// ---------------------------------------------------------------------------
// Management
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_and_delete_are_refused_while_running() {
    let app = rtc_server::build_router(app_state(200, 1, 5_000));
    let id = start(&app).await;
    wait_for_step(&app, &id, "await_callback").await;

    let (status, _) = post(app.clone(), &format!("/api/orchestrations/{id}/reset"), "").await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = send(app.clone(), "DELETE", &format!("/api/orchestrations/{id}"), "").await;
    assert_eq!(status, StatusCode::CONFLICT);

    post(
        app.clone(),
        &format!("/api/orchestrations/{id}/events/Callback"),
        "false",
    )
    .await;
    wait_for_step(&app, &id, "completed").await;

    let (status, json) = post(app.clone(), &format!("/api/orchestrations/{id}/reset"), "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["reset"], true);
    let (_, after) = get(app.clone(), &format!("/api/orchestrations/{id}")).await;
    assert_eq!(after["counters"]["attempts"], 0);

    let (status, _) = send(app.clone(), "DELETE", &format!("/api/orchestrations/{id}"), "").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(app, &format!("/api/orchestrations/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_unknown_instance_is_404() {
    let app = rtc_server::build_router(app_state(200, 1, 5_000));
    let (status, _) = send(app, "DELETE", "/api/orchestrations/ghost", "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn config_endpoint_reports_defaults() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000));
    let (status, json) = get(app, "/api/config").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["orchestration"]["max_attempts"], 3);
    assert_eq!(json["orchestration"]["timeout_limit_seconds"], 30);
    assert_eq!(json["server"]["port"], 7071);
    assert!(json["warnings"].is_array());
}

// ---------------------------------------------------------------------------
// Simulated job service
// ---------------------------------------------------------------------------

#[tokio::test]
async fn job_route_is_absent_without_simulator() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000));
    let (status, _) = send(app, "POST", "/api/job", "{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

async fn post_job(app: axum::Router, body: serde_json::Value) -> StatusCode {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri("/api/job")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    app.oneshot(req).await.unwrap().status()
}

#[tokio::test]
async fn simulator_fails_when_told_to() {
    let app = rtc_server::build_router(app_state(200, 3, 5_000).with_simulator(true));
    let status = post_job(
        app,
        serde_json::json!({ "returnError": true, "callbackUri": "http://127.0.0.1:9/cb" }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn simulator_calls_back_with_true() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/cb")
        .match_body("true")
        .with_status(202)
        .create_async()
        .await;

    let app = rtc_server::build_router(app_state(200, 3, 5_000).with_simulator(true));
    let status = post_job(
        app,
        serde_json::json!({
            "returnError": false,
            "callbackUri": format!("{}/cb", server.url()),
            "callbackAfterMilliseconds": 10,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..200 {
        if mock.matched_async().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    mock.assert_async().await;
}
