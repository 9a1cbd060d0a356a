//! HTTP surface tests driven through the router without a listener.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use pairgate_core::harness::ScriptedEngine;
use pairgate_core::{ConnectionEvent, DisconnectReason, EngineError};
use pairgate_server::config::ServerConfig;
use pairgate_server::PairingServer;

fn test_config(root: &Path) -> ServerConfig {
    ServerConfig {
        sessions_root: root.to_path_buf(),
        ..ServerConfig::default()
    }
}

fn router(config: ServerConfig, engine: &ScriptedEngine) -> Router {
    PairingServer::new(config, Arc::new(engine.clone()))
        .unwrap()
        .router()
}

fn request(uri: &str, client: [u8; 4]) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .extension(ConnectInfo(SocketAddr::from((client, 40000))))
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_pairing_returns_qr_and_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new();
    engine.emit(ConnectionEvent::PairingCode("ref-1".into()));

    let config = test_config(tmp.path());
    let expected_steps = config.pairing_instructions.len();
    let app = router(config, &engine);

    let response = app.oneshot(request("/", [10, 0, 0, 1])).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert!(body["qr"]
        .as_str()
        .unwrap()
        .starts_with("data:image/svg+xml;base64,"));
    let session_id = body["sessionId"].as_str().unwrap();
    assert!(session_id.starts_with("session_"));
    assert!(tmp.path().join(session_id).is_dir());
    assert!(!body["message"].as_str().unwrap().is_empty());
    assert_eq!(body["instructions"].as_array().unwrap().len(), expected_steps);
}

#[tokio::test(start_paused = true)]
async fn test_pairing_deadline_maps_to_request_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new();
    let app = router(test_config(tmp.path()), &engine);

    let response = app.oneshot(request("/", [10, 0, 0, 2])).await.unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

    let body = json_body(response).await;
    assert_eq!(body["error"], "Timed out waiting for a pairing code");
}

#[tokio::test]
async fn test_engine_open_failure_is_internal_error() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new();
    engine.fail_open(EngineError::new("socket refused"));
    let app = router(test_config(tmp.path()), &engine);

    let response = app.oneshot(request("/", [10, 0, 0, 3])).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = json_body(response).await;
    assert_eq!(body["error"], "Failed to initialize pairing session");
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_rate_limit_rejects_with_retry_after() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new();
    engine.emit(ConnectionEvent::PairingCode("ref-1".into()));

    let mut config = test_config(tmp.path());
    config.rate_limit.sessions_per_window = 1;
    let app = router(config, &engine);

    let first = app
        .clone()
        .oneshot(request("/", [10, 0, 0, 4]))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .clone()
        .oneshot(request("/", [10, 0, 0, 4]))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second.headers()["Retry-After"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    let metrics = app.oneshot(request("/metrics", [10, 0, 0, 4])).await.unwrap();
    let bytes = axum::body::to_bytes(metrics.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("pairgate_rate_limit_hits_total 1"));
    assert!(text.contains("pairgate_sessions_started_total 1"));
}

#[tokio::test]
async fn test_capacity_limit_and_health() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new();
    engine.emit(ConnectionEvent::PairingCode("ref-1".into()));

    let mut config = test_config(tmp.path());
    config.max_active_sessions = 1;
    let app = router(config, &engine);

    let first = app
        .clone()
        .oneshot(request("/", [10, 0, 0, 5]))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    // The first session keeps running until its deadline.
    let second = app
        .clone()
        .oneshot(request("/", [10, 0, 0, 6]))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

    let health = app.oneshot(request("/health", [10, 0, 0, 5])).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body = json_body(health).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["activeSessions"], 1);
}

#[tokio::test]
async fn test_capacity_refusal_keeps_rate_limit_quota() {
    let tmp = tempfile::tempdir().unwrap();
    let engine = ScriptedEngine::new();
    engine.emit(ConnectionEvent::PairingCode("ref-1".into()));

    let mut config = test_config(tmp.path());
    config.max_active_sessions = 1;
    config.rate_limit.sessions_per_window = 1;
    let app = router(config, &engine);

    let first = app
        .clone()
        .oneshot(request("/", [10, 0, 0, 7]))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let refused = app
        .clone()
        .oneshot(request("/", [10, 0, 0, 8]))
        .await
        .unwrap();
    assert_eq!(refused.status(), StatusCode::SERVICE_UNAVAILABLE);

    engine.emit(ConnectionEvent::Closed {
        reason: DisconnectReason::LoggedOut,
    });
    let mut released = false;
    for _ in 0..200 {
        let health = app
            .clone()
            .oneshot(request("/health", [10, 0, 0, 7]))
            .await
            .unwrap();
        if json_body(health).await["activeSessions"] == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(released);

    // The scripted engine opens only once, so this session fails to
    // initialize; getting that far means the client still had its token.
    let retried = app
        .clone()
        .oneshot(request("/", [10, 0, 0, 8]))
        .await
        .unwrap();
    assert_eq!(retried.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let metrics = app.oneshot(request("/metrics", [10, 0, 0, 8])).await.unwrap();
    let bytes = axum::body::to_bytes(metrics.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("pairgate_rate_limit_hits_total 0"));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.max_active_sessions = 0;

    assert!(PairingServer::new(config, Arc::new(ScriptedEngine::new())).is_err());
}
