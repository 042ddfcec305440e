//! Integration tests for the dev server's MCP endpoint.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use flod::config::TransportConfig;
use flod::environment::EnvironmentProfile;
use flod::mcp::{HandlerError, McpServer};
use flod::runner::HttpServerRunner;
use flod::storage::MemoryStore;
use flod::transport::HttpServerTransport;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

/// Helper to create a test app instance.
fn create_test_app(config: TransportConfig) -> (Router, Arc<HttpServerRunner>) {
    use flod::create_app;

    let engine = McpServer::new("flod-test", "0.0.0")
        .on_request("echo", |params| async move {
            Ok::<_, HandlerError>(params.unwrap_or(Value::Null))
        })
        .on_request("crash", |_| async {
            Err::<Value, _>(HandlerError::from(anyhow::anyhow!("handler crashed")))
        });
    let store = Arc::new(MemoryStore::new(config.max_queue_size));
    let transport = HttpServerTransport::new(config, store);
    let runner = Arc::new(HttpServerRunner::with_profile(
        Arc::new(engine),
        Arc::new(transport),
        EnvironmentProfile::default(),
    ));
    (create_app(Arc::clone(&runner)), runner)
}

fn default_app() -> Router {
    create_test_app(TransportConfig::default()).0
}

fn post(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("accept", "application/json, text/event-stream")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let response = default_app()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let response = default_app()
        .oneshot(
            Request::builder()
                .uri("/api/flows")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_initialize() {
    let response = default_app()
        .oneshot(post(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("mcp-session-id"));
    assert!(response.headers()["server"]
        .to_str()
        .unwrap()
        .starts_with("flod/"));

    let body = body_json(response).await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(body["result"]["serverInfo"]["name"], "flod-test");
}

#[tokio::test]
async fn test_batch_returns_array_in_order() {
    let response = default_app()
        .oneshot(post(
            r#"[
                {"jsonrpc":"2.0","id":"a","method":"echo","params":1},
                {"jsonrpc":"2.0","method":"notifications/initialized"},
                {"jsonrpc":"2.0","id":"b","method":"nope"}
            ]"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let replies = body.as_array().unwrap();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0]["id"], "a");
    assert_eq!(replies[0]["result"], 1);
    assert_eq!(replies[1]["id"], "b");
    assert_eq!(replies[1]["error"]["code"], -32601);
}

#[tokio::test]
async fn test_notification_is_accepted() {
    let response = default_app()
        .oneshot(post(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_malformed_json_is_400() {
    let response = default_app().oneshot(post("{not json")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32700);
    assert!(body["id"].is_null());
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("mcp-session-id", "00000000-0000-0000-0000-000000000000")
        .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .unwrap();

    let response = default_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_session_id_round_trip_and_delete() {
    let (app, _runner) = create_test_app(TransportConfig::default());

    let response = app
        .clone()
        .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#))
        .await
        .unwrap();
    let sid = response.headers()["mcp-session-id"]
        .to_str()
        .unwrap()
        .to_string();

    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("mcp-session-id", &sid)
        .body(Body::from(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method("DELETE")
        .uri("/mcp")
        .header("mcp-session-id", &sid)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // The terminated id is no longer valid
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("mcp-session-id", &sid)
        .body(Body::from(r#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_get_without_event_stream_is_405() {
    let response = default_app()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/mcp")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_unsupported_method_is_405() {
    let response = default_app()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/mcp")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers()["allow"], "GET, POST, DELETE");
}

#[tokio::test]
async fn test_full_queue_is_503() {
    let config = TransportConfig {
        max_queue_size: 1,
        ..Default::default()
    };
    let (app, _runner) = create_test_app(config);

    let response = app
        .oneshot(post(
            r#"[{"jsonrpc":"2.0","id":1,"method":"ping"},{"jsonrpc":"2.0","id":2,"method":"ping"}]"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "1");
}

#[tokio::test]
async fn test_handler_failure_is_500() {
    let response = default_app()
        .oneshot(post(r#"{"jsonrpc":"2.0","id":1,"method":"crash"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert_eq!(body, json!({"error": "Internal server error"}));
}

#[tokio::test]
async fn test_foreign_origin_is_403() {
    let request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header("origin", "https://attacker.example")
        .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
        .unwrap();

    let response = default_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_streaming_response_is_sse() {
    let config = TransportConfig {
        streaming_enabled: true,
        ..Default::default()
    };
    let (app, runner) = create_test_app(config);

    let response = app
        .oneshot(post(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let chunk = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();
    assert!(chunk.starts_with("event: message\ndata: "));
    let data: Value = serde_json::from_str(
        chunk
            .trim_start_matches("event: message\ndata: ")
            .trim_end(),
    )
    .unwrap();
    assert_eq!(data["id"], 7);

    runner.stop().await;
    assert!(body.frame().await.is_none());
}
