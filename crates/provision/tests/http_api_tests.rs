//! HTTP API tests driven through the router with `oneshot`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{device, fast_config, Harness, SERVER_ADDRESS};
use provision::render::ConfigRenderer;
use provision::server::{router, ApiState};
use provision::{ProvisionRequest, SessionId, SessionState};

fn app(harness: &Harness) -> Router {
    router(ApiState::new(
        Arc::clone(&harness.provisioner),
        Arc::clone(&harness.renderer) as Arc<dyn ConfigRenderer>,
        Arc::clone(&harness.fetches),
        SERVER_ADDRESS,
    ))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn post_json(app: &Router, uri: &str, body: &Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_health() {
    let harness = Harness::happy(fast_config());
    let (status, body) = get_json(&app(&harness), "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_create_requires_hardware_address() {
    let harness = Harness::happy(fast_config());
    let app = app(&harness);

    let (status, body) = post_json(&app, "/api/sessions", &json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("hardware_address"));

    let (status, _) = post_json(&app, "/api/sessions", &json!({"hardware_address": "zz"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::post("/api/sessions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(harness.registry.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let harness = Harness::happy(fast_config());
    let app = app(&harness);

    let id = SessionId::new();
    for uri in [
        format!("/api/sessions/{id}"),
        format!("/api/sessions/{id}/timeline"),
        format!("/api/sessions/{id}/events"),
        "/api/sessions/not-a-uuid".to_string(),
    ] {
        let (status, _) = get(&app, &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }

    let (status, _) = post_json(&app, &format!("/api/sessions/{id}/cancel"), &json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_filter_is_rejected() {
    let harness = Harness::happy(fast_config());
    let (status, _) = get(&app(&harness), "/api/sessions?filter=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_base_config_rendered_on_demand() {
    let harness = Harness::happy(fast_config());
    let (status, body) = get(&app(&harness), "/config/base.rsc").await;
    assert_eq!(status, StatusCode::OK);

    let script = String::from_utf8(body).unwrap();
    assert!(script.contains("http://192.168.88.10:5000/config/"));
    assert!(harness.renderer.lookup_base().await.is_some());
}

#[tokio::test]
async fn test_personalized_config_download_records_fetch() {
    let harness = Harness::happy(fast_config());
    let app = app(&harness);

    let (status, _) = get(&app, "/config/AA:BB:CC:DD:EE:FF.rsc").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get(&app, "/config/garbage").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    harness
        .renderer
        .render_personalized(&device(), &provision::NetworkParams::default())
        .await
        .unwrap();

    // the device requests its own MAC in colon form
    let (status, body) = get(&app, "/config/AA:BB:CC:DD:EE:FF.rsc").await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8(body).unwrap().contains("RouterBoard-AABBCCDDEEFF"));
    assert!(harness.fetches.last_fetch(&device()).await.is_some());

    let (status, listing) = get_json(&app, "/api/configs").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["total"], 1);
    assert!(!listing["configs"][0]["fetched_at"].is_null());

    let request = Request::delete("/api/configs/aabbccddeeff")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = get(&app, "/config/aabbccddeeff.rsc").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_session_lifecycle_over_http() {
    let harness = Harness::happy(fast_config());
    let app = app(&harness);

    let (id, state) = harness
        .provisioner
        .run_to_completion(ProvisionRequest::for_address("AA:BB:CC:DD:EE:FF"))
        .await
        .unwrap();
    assert_eq!(state, SessionState::Completed);

    let (status, snapshot) = get_json(&app, &format!("/api/sessions/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["state"], "completed");
    assert_eq!(snapshot["hardware_address"], "AA:BB:CC:DD:EE:FF");
    assert_eq!(snapshot["is_complete"], true);

    let (status, timeline) = get_json(&app, &format!("/api/sessions/{id}/timeline")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(timeline["timeline"].as_array().unwrap().len(), 7);
    assert_eq!(timeline["timeline"][0]["sequence"], 1);

    let (_, listing) = get_json(&app, "/api/sessions?filter=completed").await;
    assert_eq!(listing["total"], 1);
    let (_, listing) = get_json(&app, "/api/sessions?filter=active").await;
    assert_eq!(listing["total"], 0);

    let (status, _) = post_json(&app, &format!("/api/sessions/{id}/cancel"), &json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let request = Request::delete(format!("/api/sessions/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = get(&app, &format!("/api/sessions/{id}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn test_event_stream_replays_finished_session() {
    let harness = Harness::happy(fast_config());
    let app = app(&harness);

    let (id, _) = harness
        .provisioner
        .run_to_completion(ProvisionRequest::for_address("AA:BB:CC:DD:EE:FF"))
        .await
        .unwrap();

    let request = Request::get(format!("/api/sessions/{id}/events"))
        .header("last-event-id", "5")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    // the stream ends after the terminal event, so the body is complete
    let text = String::from_utf8(body).unwrap();
    let ids: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("id:"))
        .map(str::trim)
        .collect();
    assert_eq!(ids, vec!["6", "7"]);
    assert!(text.contains("\"state\":\"completed\""));
}

#[tokio::test(start_paused = true)]
async fn test_event_stream_reconnect_after_terminal_event_closes() {
    let harness = Harness::happy(fast_config());
    let app = app(&harness);

    let (id, _) = harness
        .provisioner
        .run_to_completion(ProvisionRequest::for_address("AA:BB:CC:DD:EE:FF"))
        .await
        .unwrap();

    // an EventSource reconnects with the id of the last frame it saw
    let request = Request::get(format!("/api/sessions/{id}/events"))
        .header("last-event-id", "7")
        .body(Body::empty())
        .unwrap();
    let (status, body) = tokio::time::timeout(Duration::from_secs(60), send(&app, request))
        .await
        .expect("event stream should close after the terminal event");
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(!text.lines().any(|line| line.starts_with("id:")));
}

#[tokio::test(start_paused = true)]
async fn test_created_session_runs_in_background() {
    let harness = Harness::happy(fast_config());
    let app = app(&harness);

    let (status, created) = post_json(
        &app,
        "/api/sessions",
        &json!({"hardware_address": "aa-bb-cc-dd-ee-ff", "password": "pw"}),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = SessionId::parse(created["session_id"].as_str().unwrap()).unwrap();
    assert_eq!(created["events_url"], format!("/api/sessions/{id}/events"));

    let mut subscription = harness.bus.subscribe(id).await.unwrap();
    let mut last = None;
    while let Some(event) = subscription.next().await {
        last = Some(event);
    }
    assert_eq!(last.unwrap().state, SessionState::Completed);
}
