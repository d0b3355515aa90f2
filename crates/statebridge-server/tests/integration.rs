use axum::http::StatusCode;
use http_body_util::BodyExt;
use statebridge_core::{BridgeConfig, MemoryStore};
use statebridge_server::{build_router, Bridge};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn app_with(initial: i64, config: BridgeConfig) -> (axum::Router, Arc<Bridge>) {
    let bridge = Bridge::new(Arc::new(MemoryStore::counter(initial)), config);
    (build_router(bridge.clone()), bridge)
}

/// Send a GET request via `oneshot` and return (status, parsed JSON body).
async fn get(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Send a POST request with a JSON body via `oneshot` and return (status, parsed JSON body).
async fn post_json(
    app: axum::Router,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

/// Open a consumer's event stream and return its body.
async fn open_events(app: axum::Router, id: u32) -> axum::body::Body {
    let req = axum::http::Request::builder()
        .uri(format!("/api/consumers/{id}/events"))
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    response.into_body()
}

/// Read SSE frames until one carries a `data:` line, and parse it.
async fn next_event(body: &mut axum::body::Body) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("no event within 2s")
            .expect("event stream ended")
            .unwrap();
        let Ok(data) = frame.into_data() else {
            continue;
        };
        let text = String::from_utf8(data.to_vec()).unwrap();
        if let Some(line) = text.lines().find_map(|l| l.strip_prefix("data: ")) {
            return serde_json::from_str(line).unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_endpoint_returns_full_store_state() {
    let (app, _) = app_with(3, BridgeConfig::default());
    let (status, body) = get(app, "/api/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({ "counter": 3 }));
}

#[tokio::test]
async fn scheduler_starts_idle() {
    let (app, _) = app_with(0, BridgeConfig::default());
    let (status, body) = get(app, "/api/scheduler").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["is_idle"], true);
    assert_eq!(body["queued_count"], 0);
    assert_eq!(body["running_count"], 0);
}

#[tokio::test]
async fn operations_lists_no_thunks_initially() {
    let (app, _) = app_with(0, BridgeConfig::default());
    let (status, body) = get(app, "/api/operations").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["thunks"], serde_json::json!([]));
}

#[tokio::test]
async fn unknown_consumer_has_no_subscriptions() {
    let (app, _) = app_with(0, BridgeConfig::default());
    let (status, body) = get(app, "/api/consumers/42/subscriptions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consumer_id"], 42);
    assert_eq!(body["keys"], serde_json::json!([]));
}

// ---------------------------------------------------------------------------
// Consumer channels
// ---------------------------------------------------------------------------

#[tokio::test]
async fn message_without_event_stream_is_404() {
    let (app, _) = app_with(0, BridgeConfig::default());
    let (status, body) = post_json(
        app,
        "/api/consumers/7/messages",
        serde_json::json!({ "type": "subscribe" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("consumer 7"));
}

#[tokio::test]
async fn reserved_consumer_id_is_rejected() {
    let (app, _) = app_with(0, BridgeConfig::default());
    let (status, _) = get(app, "/api/consumers/0/events").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_message_is_rejected() {
    let (app, _) = app_with(0, BridgeConfig::default());
    let _events = open_events(app.clone(), 3).await;
    let (status, _) = post_json(
        app,
        "/api/consumers/3/messages",
        serde_json::json!({ "type": "no_such_message" }),
    )
    .await;
    assert!(status.is_client_error());
}

#[tokio::test]
async fn consumer_round_trip_over_http() {
    let (app, bridge) = app_with(1, BridgeConfig::default());
    let mut events = open_events(app.clone(), 5).await;

    let (status, body) = post_json(
        app.clone(),
        "/api/consumers/5/messages",
        serde_json::json!({ "type": "subscribe", "keys": ["counter"] }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], "subscribe");

    let initial = next_event(&mut events).await;
    assert_eq!(initial["type"], "state_update");
    assert_eq!(initial["state"], serde_json::json!({ "counter": 1 }));

    let (_, subs) = get(app.clone(), "/api/consumers/5/subscriptions").await;
    assert_eq!(subs["keys"], serde_json::json!(["counter"]));

    let (status, _) = post_json(
        app.clone(),
        "/api/consumers/5/messages",
        serde_json::json!({
            "type": "dispatch",
            "action": { "id": "act-1", "type": "counter:increment" }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // The broadcast is pushed before the acknowledgment.
    let update = next_event(&mut events).await;
    assert_eq!(update["type"], "state_update");
    assert_eq!(update["state"]["counter"], 2);
    let ack = next_event(&mut events).await;
    assert_eq!(ack["type"], "dispatch_ack");
    assert_eq!(ack["action_id"], "act-1");
    assert_eq!(ack["state"], serde_json::json!({ "counter": 2 }));

    // Closing the stream disconnects the consumer.
    drop(events);
    let (status, _) = post_json(
        app.clone(),
        "/api/consumers/5/messages",
        serde_json::json!({ "type": "unsubscribe" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(bridge.subscriptions(statebridge_core::ConsumerId(5)).is_empty());
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[tokio::test]
async fn yaml_config_drives_access_control() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "enforce_access_control: true").unwrap();
    writeln!(file, "max_serialization_depth: 4").unwrap();
    let config = BridgeConfig::load(file.path()).unwrap();
    assert!(config.enforce_access_control);

    let (app, _) = app_with(0, config);
    let mut events = open_events(app.clone(), 8).await;
    post_json(
        app.clone(),
        "/api/consumers/8/messages",
        serde_json::json!({ "type": "subscribe", "keys": ["counter"] }),
    )
    .await;
    next_event(&mut events).await;

    post_json(
        app.clone(),
        "/api/consumers/8/messages",
        serde_json::json!({
            "type": "dispatch",
            "action": { "id": "act-2", "type": "state:set", "payload": { "key": "x", "value": 1 } }
        }),
    )
    .await;
    let ack = next_event(&mut events).await;
    assert_eq!(ack["type"], "dispatch_ack");
    assert_eq!(ack["error"]["kind"], "access_denied");
    assert_eq!(ack["error"]["key"], "state");

    let (_, state) = get(app, "/api/state").await;
    assert!(state.get("x").is_none());
}
