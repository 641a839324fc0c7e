//! Integration tests for the read-only endpoints.

mod common;

use axum::http::StatusCode;
use common::{body_json, build_configured_app, build_test_app, get, FakeBackend};
use outpaint_core::config::OutpaintConfig;
use outpaint_core::types::BackendKind;

// ---------------------------------------------------------------------------
// Test: GET / lists the endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn index_lists_endpoints() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_test_app(
        FakeBackend::working(BackendKind::FalAi),
        OutpaintConfig::default(),
        dir.path(),
    );
    let response = get(app, "/").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["name"], "Outpaint API");
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["endpoints"]["outpaint"], "/outpaint (POST)");
    assert_eq!(json["endpoints"]["backend_status"], "/backend/status (GET)");
}

// ---------------------------------------------------------------------------
// Test: GET /health reports the backend probe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_backend_probe() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_test_app(
        FakeBackend::working(BackendKind::FalAi),
        OutpaintConfig {
            falai_api_key: "key".into(),
            ..Default::default()
        },
        dir.path(),
    );
    let json = body_json(get(app, "/health").await).await;

    assert_eq!(json["status"], "healthy");
    assert!(json["version"].is_string());
    assert_eq!(json["backend"]["type"], "falai");
    assert_eq!(json["backend"]["available"], true);
    assert_eq!(json["auto_fallback"], "not_needed");
}

#[tokio::test]
async fn health_marks_fallback_enabled_for_comfyui() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_test_app(
        FakeBackend::working(BackendKind::ComfyUi),
        OutpaintConfig {
            backend: BackendKind::ComfyUi,
            ..Default::default()
        },
        dir.path(),
    );
    let json = body_json(get(app, "/health").await).await;
    assert_eq!(json["backend"]["type"], "comfyui");
    assert_eq!(json["auto_fallback"], "enabled");
}

// ---------------------------------------------------------------------------
// Test: GET /backend/status surfaces construction errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backend_status_reports_missing_credential() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_configured_app(OutpaintConfig::default(), dir.path());
    let response = get(app, "/backend/status").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["backend"], "falai");
    assert_eq!(json["available"], false);
    assert!(json["message"]
        .as_str()
        .unwrap()
        .contains("falai_api_key is required"));
    assert_eq!(json["fallback_available"], false);
}

// ---------------------------------------------------------------------------
// Test: GET /config masks the API key
// ---------------------------------------------------------------------------

#[tokio::test]
async fn config_masks_api_key() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_test_app(
        FakeBackend::working(BackendKind::ComfyUi),
        OutpaintConfig {
            backend: BackendKind::ComfyUi,
            falai_api_key: "abcdefghijklmnop".into(),
            ..Default::default()
        },
        dir.path(),
    );
    let json = body_json(get(app, "/config").await).await;

    assert_eq!(json["config"]["falai_api_key"], "abcdefgh...");
    assert_eq!(json["config"]["backend"], "comfyui");
    assert_eq!(json["auto_fallback"], true);
}

// ---------------------------------------------------------------------------
// Test: Unknown route returns 404
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_route_returns_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_test_app(
        FakeBackend::working(BackendKind::FalAi),
        OutpaintConfig::default(),
        dir.path(),
    );
    let response = get(app, "/this-route-does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
