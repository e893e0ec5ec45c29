//! End-to-end request/response tests against the real router, backed by
//! `FakeContext`/`FakePage` instead of a real browser.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tabd_api::auth::AuthConfig;
use tabd_api::{build_router, AppState};
use tabd_core::config::{AppConfig, HeadlessMode, NodeEnv};
use tabd_core::pool::{ContextLauncher, SeedOptions};
use tabd_core::Core;
use tabd_engine::error::EngineResult;
use tabd_engine::fake::FakeContext;
use tabd_engine::traits::BrowserContext;
use tower::ServiceExt;

struct FakeLauncher;

#[async_trait]
impl ContextLauncher for FakeLauncher {
    async fn launch(&self, _profile_dir: &Path, _seed: &SeedOptions) -> EngineResult<Arc<dyn BrowserContext>> {
        Ok(FakeContext::new())
    }
}

/// Always hands back the same pre-built context, so a test can configure it
/// (e.g. an `evaluate` delay) before any request reaches the handler that
/// ends up calling `ensure_context` for the first time.
struct FixedLauncher(Arc<FakeContext>);

#[async_trait]
impl ContextLauncher for FixedLauncher {
    async fn launch(&self, _profile_dir: &Path, _seed: &SeedOptions) -> EngineResult<Arc<dyn BrowserContext>> {
        Ok(self.0.clone())
    }
}

fn test_config(profiles: &Path, downloads: &Path) -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        log_filter: "info".to_string(),
        node_env: NodeEnv::Development,
        admin_key: Some("admin-secret".to_string()),
        api_key: Some("api-secret".to_string()),
        profiles_dir: profiles.to_path_buf(),
        downloads_dir: downloads.to_path_buf(),
        download_ttl: Duration::from_secs(3600),
        max_download_size_mb: 50,
        max_blob_size_mb: 20,
        max_downloads_per_user: 100,
        request_timeout: Duration::from_secs(30),
        max_concurrency_per_user: 3,
        max_sessions: 50,
        idle_session_timeout: Duration::from_secs(1800),
        snapshot_max_chars: 80_000,
        snapshot_tail_chars: 5_000,
        build_refs_timeout: Duration::from_secs(12),
        tab_lock_timeout: Duration::from_secs(30),
        health_probe_interval: Duration::from_secs(60),
        consecutive_failure_threshold: 3,
        headless: HeadlessMode::True,
        proxy: None,
        batch_concurrency: 5,
        max_batch_files: 50,
        rate_limit_eval_extended_max: 20,
    }
}

async fn test_app() -> (axum::Router, tempfile::TempDir) {
    test_app_with_launcher(Arc::new(FakeLauncher)).await
}

async fn test_app_with_launcher(launcher: Arc<dyn ContextLauncher>) -> (axum::Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir.path().join("profiles"), &dir.path().join("downloads"));
    let auth = AuthConfig::new(config.api_key.clone(), config.admin_key.clone());
    let core = Arc::new(Core::new(config, launcher));
    core.reconcile_downloads().await.unwrap();
    let state = AppState::new(core, auth);
    (build_router(state), dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn create_tab_then_navigate_then_snapshot() {
    let (app, _dir) = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tabs",
            json!({ "userId": "u1", "sessionKey": "s" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    let tab_id = created["tabId"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/tabs/{tab_id}/navigate"),
            json!({ "userId": "u1", "url": "https://example.com" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let navigated = body_json(response).await;
    assert_eq!(navigated["ok"], json!(true));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/tabs/{tab_id}/snapshot?userId=u1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = body_json(response).await;
    assert!(snapshot["refsCount"].as_u64().unwrap() >= 0);
}

#[tokio::test]
async fn cross_user_snapshot_is_404() {
    let (app, _dir) = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tabs",
            json!({ "userId": "u1", "sessionKey": "s" }),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let tab_id = created["tabId"].as_str().unwrap().to_string();

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/tabs/{tab_id}/snapshot?userId=u2"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn evaluate_without_api_key_is_forbidden() {
    let (app, _dir) = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tabs",
            json!({ "userId": "u1", "sessionKey": "s" }),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let tab_id = created["tabId"].as_str().unwrap().to_string();

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/tabs/{tab_id}/evaluate"),
            json!({ "userId": "u1", "expression": "1 + 1" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn evaluate_with_bearer_token_succeeds() {
    let (app, _dir) = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tabs",
            json!({ "userId": "u1", "sessionKey": "s" }),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let tab_id = created["tabId"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/tabs/{tab_id}/evaluate"))
        .header("content-type", "application/json")
        .header("authorization", "Bearer api-secret")
        .body(Body::from(json!({ "userId": "u1", "expression": "1 + 1" }).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn admin_stop_requires_admin_key() {
    let (app, _dir) = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/stop")
                .header("x-admin-key", "admin-secret")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_reports_ok_before_shutdown() {
    let (app, _dir) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(true));
}

#[tokio::test]
async fn evaluate_honors_a_requested_timeout_shorter_than_the_route_ceiling() {
    let fixed_context = FakeContext::new();
    fixed_context.set_default_eval_delay(Duration::from_millis(200));
    let (app, _dir) = test_app_with_launcher(Arc::new(FixedLauncher(fixed_context))).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tabs",
            json!({ "userId": "u1", "sessionKey": "s" }),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let tab_id = created["tabId"].as_str().unwrap().to_string();

    let request = Request::builder()
        .method("POST")
        .uri(format!("/tabs/{tab_id}/evaluate"))
        .header("content-type", "application/json")
        .header("authorization", "Bearer api-secret")
        .body(Body::from(
            json!({ "userId": "u1", "expression": "1 + 1", "timeoutMs": 20 }).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], json!(false));
    assert_eq!(body["errorType"], json!("timeout"));
}

#[tokio::test]
async fn cross_user_tab_downloads_listing_is_404() {
    let (app, _dir) = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/tabs",
            json!({ "userId": "u1", "sessionKey": "s" }),
        ))
        .await
        .unwrap();
    let created = body_json(response).await;
    let tab_id = created["tabId"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/tabs/{tab_id}/downloads?userId=u2"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!("/tabs/{tab_id}/downloads?userId=u1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_route_returns_json_404() {
    let (app, _dir) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/not-a-real-route")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"].is_string());
}
