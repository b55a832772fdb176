//! End-to-end tests of the HTTP surface over the in-memory store and broker.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use vparser_api::auth::{digest_key, API_KEY_HEADER};
use vparser_api::{create_router, ApiConfig, ApiKeyRegistry, AppState, OutboxRelay};
use vparser_queue::{
    MemoryBroker, Publisher, Topology, TopologyManager, ARCHIVE_QUEUE, DEFAULT_RETRY_DELAY,
    WORKER_QUEUE,
};
use vparser_store::{JobStore, MemoryJobStore};

const KEY: &str = "integration-test-key";

struct TestApp {
    app: Router,
    state: AppState,
    store: Arc<MemoryJobStore>,
    broker: Arc<MemoryBroker>,
}

async fn test_app() -> TestApp {
    test_app_with(ApiConfig::default()).await
}

async fn test_app_with(config: ApiConfig) -> TestApp {
    let store = Arc::new(MemoryJobStore::new());
    let broker = Arc::new(MemoryBroker::new());
    TopologyManager::new(broker.clone(), Topology::video_parser(DEFAULT_RETRY_DELAY))
        .declare()
        .await
        .unwrap();

    let publisher = Publisher::spawn(broker.clone(), 16);
    let api_keys = ApiKeyRegistry::from_entries(&format!("tests:{}", digest_key(KEY))).unwrap();
    let state = AppState::new(
        config,
        store.clone(),
        broker.clone(),
        publisher,
        api_keys,
    );

    TestApp {
        app: create_router(state.clone(), None),
        state,
        store,
        broker,
    }
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<&str>,
    key: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header(API_KEY_HEADER, key);
    }
    let body = match body {
        Some(text) => {
            builder = builder.header("content-type", "application/json");
            Body::from(text.to_string())
        }
        None => Body::empty(),
    };

    let res = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = res.status();
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn authed(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let text = body.map(|b| b.to_string());
    call(app, method, uri, text.as_deref(), Some(KEY)).await
}

#[tokio::test]
async fn test_create_stores_and_fans_out() {
    let t = test_app().await;

    let (status, body) = authed(
        &t.app,
        Method::POST,
        "/requests",
        Some(json!({"name": "vid1", "video_url": "http://cdn.example.com/1.mp4"})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Successfully added new request");
    assert_eq!(body["data"]["name"], "vid1");
    assert_eq!(body["data"]["processed"], false);
    assert!(body["data"].get("id").is_none());

    assert_eq!(t.broker.queue_len(WORKER_QUEUE), 1);
    assert_eq!(t.broker.queue_len(ARCHIVE_QUEUE), 1);
    let queued = t.broker.drain(WORKER_QUEUE);
    let payload: Value = serde_json::from_slice(&queued[0].body).unwrap();
    assert_eq!(payload["name"], "vid1");
    assert_eq!(payload["archived"], false);
}

#[tokio::test]
async fn test_list_get_update_delete_cycle() {
    let t = test_app().await;
    authed(
        &t.app,
        Method::POST,
        "/requests",
        Some(json!({"name": "vid1", "description": "first", "video_url": "http://x/1.mp4"})),
    )
    .await;

    let (status, body) = authed(&t.app, Method::GET, "/requests", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Successfully got all the requests");
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = authed(&t.app, Method::GET, "/requests/vid1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Successfully got the request info");
    assert_eq!(body["data"]["description"], "first");

    let (status, body) = authed(
        &t.app,
        Method::PUT,
        "/requests/vid1",
        Some(json!({"processed": true, "name": "ignored"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Successfully updated request");
    assert_eq!(body["data"]["name"], "vid1");
    assert_eq!(body["data"]["processed"], true);
    assert_eq!(body["data"]["description"], "first");

    let (status, body) = authed(&t.app, Method::DELETE, "/requests/vid1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Successfully deleted request");
    assert_eq!(body["data"], Value::Null);

    let (status, body) = authed(&t.app, Method::GET, "/requests/vid1", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Request doesn't exist");

    let (_, body) = authed(&t.app, Method::GET, "/requests", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 0);

    // The archived row stays; only the name is released.
    assert_eq!(t.store.all_rows().len(), 1);
    let (status, _) = authed(
        &t.app,
        Method::POST,
        "/requests",
        Some(json!({"name": "vid1", "video_url": "http://x/2.mp4"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(t.store.all_rows().len(), 2);
}

#[tokio::test]
async fn test_unknown_names_report_missing() {
    let t = test_app().await;

    for method in [Method::GET, Method::DELETE] {
        let (status, body) = authed(&t.app, method, "/requests/nope", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "Request doesn't exist");
    }

    let (status, body) = authed(
        &t.app,
        Method::PUT,
        "/requests/nope",
        Some(json!({"processed": true})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Request doesn't exist");

    // Existence is checked before the body is parsed.
    let (status, body) =
        call(&t.app, Method::PUT, "/requests/nope", Some("{not json"), Some(KEY)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Request doesn't exist");
}

#[tokio::test]
async fn test_undecodable_name_is_enveloped() {
    let t = test_app().await;

    for method in [Method::GET, Method::DELETE] {
        let (status, body) = authed(&t.app, method, "/requests/%FF", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "Invalid request name");
    }
}

#[tokio::test]
async fn test_oversized_body_is_enveloped() {
    let t = test_app_with(ApiConfig {
        max_body_size: 64,
        ..ApiConfig::default()
    })
    .await;
    let text = json!({"name": "vid1", "description": "x".repeat(256)}).to_string();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/requests")
        .header(API_KEY_HEADER, KEY)
        .header("content-type", "application/json")
        .header("content-length", text.len())
        .body(Body::from(text))
        .unwrap();
    let res = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(res.headers()["content-type"], "application/json");

    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Request body too large");
    assert!(t.store.all_rows().is_empty());
}

#[tokio::test]
async fn test_unknown_route_is_enveloped() {
    let t = test_app().await;

    let (status, body) = authed(&t.app, Method::GET, "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Not found");
}

#[tokio::test]
async fn test_missing_or_invalid_key_is_unauthorized() {
    let t = test_app().await;

    let (status, body) = call(&t.app, Method::GET, "/requests", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Unauthorized");

    let (status, _) = call(&t.app, Method::GET, "/requests", None, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &t.app,
        Method::POST,
        "/requests",
        Some(r#"{"name":"vid1"}"#),
        Some("wrong"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(t.broker.published_count(), 0);
}

#[tokio::test]
async fn test_create_validation_errors() {
    let t = test_app().await;

    let (status, body) = authed(
        &t.app,
        Method::POST,
        "/requests",
        Some(json!({"video_url": "http://x/1.mp4"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "name can't be null");

    let (status, body) =
        call(&t.app, Method::POST, "/requests", Some("{not json"), Some(KEY)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Can't parse json");

    assert_eq!(t.broker.published_count(), 0);
    assert!(t.store.all_rows().is_empty());
}

#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let t = test_app().await;
    let body = json!({"name": "vid1", "video_url": "http://x/1.mp4"});

    authed(&t.app, Method::POST, "/requests", Some(body.clone())).await;
    let (status, response) = authed(&t.app, Method::POST, "/requests", Some(body)).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["message"], "Request with name vid1 already exists");
    assert_eq!(t.broker.queue_len(WORKER_QUEUE), 1);
}

#[tokio::test]
async fn test_broker_outage_defers_then_relay_publishes() {
    let t = test_app().await;
    t.broker.set_offline(true);

    let (status, body) = authed(
        &t.app,
        Method::POST,
        "/requests",
        Some(json!({"name": "vid1", "video_url": "http://x/1.mp4"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Request stored, queueing deferred");
    assert_eq!(t.store.unpublished_count().await.unwrap(), 1);

    t.broker.set_offline(false);
    tokio::time::sleep(Duration::from_millis(5)).await;
    let relay = OutboxRelay::new(
        t.state.store.clone(),
        t.state.publisher.clone(),
        &ApiConfig::default(),
    )
    .with_grace(Duration::ZERO);
    let report = relay.relay_once().await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(t.broker.queue_len(WORKER_QUEUE), 1);
    assert_eq!(t.store.unpublished_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_store_outage_is_internal_error() {
    let t = test_app().await;
    t.store.set_unavailable(true);

    let (status, body) = authed(&t.app, Method::GET, "/requests", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Internal server error");
}

#[tokio::test]
async fn test_health_and_readiness() {
    let t = test_app().await;

    let (status, body) = call(&t.app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = call(&t.app, Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["database"]["status"], "ok");
    assert_eq!(body["outbox_backlog"], 0);

    t.broker.set_offline(true);
    let (status, body) = call(&t.app, Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["broker"]["status"], "error");
}

#[tokio::test]
async fn test_readiness_hides_database_error_detail() {
    let t = test_app().await;
    t.store.set_unavailable(true);

    let (status, body) = call(&t.app, Method::GET, "/ready", None, None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["database"]["status"], "error");
    assert_eq!(body["checks"]["database"]["error"], "database unreachable");
    assert!(body.get("outbox_backlog").is_none());
}
