//! RemoteQueueAdapter against in-process fake image host and queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use outpaint_cloud::adapter::RemoteQueueAdapter;
use outpaint_cloud::hosting::FreeImageHost;
use outpaint_cloud::poll::PollSchedule;
use outpaint_cloud::queue::FalQueueClient;
use outpaint_core::backend::{BackendAdapter, BackendRequest};
use outpaint_core::error::OutpaintError;
use outpaint_core::params::{ExpandPixels, GenerationParameters};
use outpaint_core::sink::NullSink;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, PartialEq)]
enum Scenario {
    NestedOutput,
    ResponseUrl,
    PaymentRequired,
    Failed,
    Expired,
    NeverDone,
}

struct FakeFal {
    base: String,
    scenario: Scenario,
    status_calls: AtomicU32,
    host_form: Mutex<Option<HashMap<String, String>>>,
    submitted: Mutex<Option<(String, Value)>>,
}

async fn host_upload(State(s): State<Arc<FakeFal>>, Form(form): Form<HashMap<String, String>>) -> Json<Value> {
    *s.host_form.lock().unwrap() = Some(form);
    Json(json!({"status_code": 200, "image": {"url": format!("{}/staged/source.jpg", s.base)}}))
}

async fn submit(State(s): State<Arc<FakeFal>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    *s.submitted.lock().unwrap() = Some((auth, body));
    if s.scenario == Scenario::PaymentRequired {
        return (StatusCode::PAYMENT_REQUIRED, "insufficient balance").into_response();
    }
    Json(json!({
        "request_id": "r-1",
        "status_url": format!("{}/requests/r-1/status", s.base),
        "response_url": format!("{}/requests/r-1", s.base)
    }))
    .into_response()
}

async fn status(State(s): State<Arc<FakeFal>>) -> Response {
    let call = s.status_calls.fetch_add(1, Ordering::SeqCst) + 1;
    match (s.scenario, call) {
        (Scenario::Expired, _) => StatusCode::NOT_FOUND.into_response(),
        (Scenario::NeverDone, _) | (_, 1) => Json(json!({"status": "IN_QUEUE"})).into_response(),
        (_, 2) => StatusCode::TOO_MANY_REQUESTS.into_response(),
        (_, 3) => Json(json!({"status": "IN_PROGRESS"})).into_response(),
        (Scenario::Failed, _) => {
            Json(json!({"status": "FAILED", "error": "NSFW content detected"})).into_response()
        }
        (Scenario::ResponseUrl, _) => Json(json!({
            "status": "COMPLETED",
            "response_url": format!("{}/requests/r-1", s.base)
        }))
        .into_response(),
        _ => Json(json!({
            "status": "COMPLETED",
            "output": {"images": [
                {"url": format!("{}/files/a.png", s.base)},
                {"url": format!("{}/files/missing.png", s.base)},
                {"url": format!("{}/files/b.png", s.base)}
            ]}
        }))
        .into_response(),
    }
}

async fn result(State(s): State<Arc<FakeFal>>) -> Json<Value> {
    Json(json!({"images": [{"url": format!("{}/files/c.png", s.base)}]}))
}

async fn file(Path(name): Path<String>) -> Response {
    if name == "missing.png" {
        return StatusCode::NOT_FOUND.into_response();
    }
    format!("image:{name}").into_response()
}

async fn spawn(scenario: Scenario) -> (Arc<FakeFal>, RemoteQueueAdapter) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let state = Arc::new(FakeFal {
        base: base.clone(),
        scenario,
        status_calls: AtomicU32::new(0),
        host_form: Mutex::new(None),
        submitted: Mutex::new(None),
    });
    let router = Router::new()
        .route("/host/upload", post(host_upload))
        .route("/queue", post(submit))
        .route("/requests/r-1/status", get(status))
        .route("/requests/r-1", get(result))
        .route("/files/{name}", get(file))
        .with_state(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = reqwest::Client::new();
    let adapter = RemoteQueueAdapter::with_clients(
        FalQueueClient::with_url(client.clone(), &format!("{base}/queue"), "test-key"),
        FreeImageHost::with_endpoint(client, &format!("{base}/host/upload"), "host-key"),
    )
    .with_schedule(PollSchedule::uniform(Duration::from_millis(5), 20));
    (state, adapter)
}

fn request(dir: &tempfile::TempDir) -> BackendRequest {
    let image_path = dir.path().join("source.png");
    image::RgbaImage::new(16, 8).save(&image_path).unwrap();
    BackendRequest {
        image_path,
        params: GenerationParameters {
            num_images: 2,
            zoom_out_percentage: 20,
            prompt: "harbour at dusk".into(),
            ..Default::default()
        },
        expand: ExpandPixels::new(4, 5, 6, 7),
    }
}

// ---------------------------------------------------------------------------
// Success paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_job_downloads_nested_output_images() {
    let (state, adapter) = spawn(Scenario::NestedOutput).await;
    let dir = tempfile::tempdir().unwrap();

    let outputs = adapter
        .outpaint(&request(&dir), &NullSink, &CancellationToken::new())
        .await
        .unwrap();

    // The 404 download is skipped, the rest are kept in order.
    assert_eq!(outputs, vec![b"image:a.png".to_vec(), b"image:b.png".to_vec()]);
    assert_eq!(state.status_calls.load(Ordering::SeqCst), 4);

    let form = state.host_form.lock().unwrap().clone().unwrap();
    assert_eq!(form["key"], "host-key");
    assert_eq!(form["action"], "upload");
    assert!(!form["source"].is_empty());

    let (auth, payload) = state.submitted.lock().unwrap().clone().unwrap();
    assert_eq!(auth, "Key test-key");
    assert_eq!(payload["image_url"], format!("{}/staged/source.jpg", state.base));
    assert_eq!(payload["zoom_out_percentage"], 20);
    assert_eq!(payload["expand_left"], 4);
    assert_eq!(payload["expand_bottom"], 7);
    assert_eq!(payload["num_images"], 2);
    assert_eq!(payload["output_format"], "png");
    assert_eq!(payload["enable_safety_checker"], true);
}

#[tokio::test]
async fn response_url_indirection_is_followed() {
    let (_state, adapter) = spawn(Scenario::ResponseUrl).await;
    let dir = tempfile::tempdir().unwrap();

    let outputs = adapter
        .outpaint(&request(&dir), &NullSink, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outputs, vec![b"image:c.png".to_vec()]);
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn payment_required_surfaces_typed_error() {
    let (state, adapter) = spawn(Scenario::PaymentRequired).await;
    let dir = tempfile::tempdir().unwrap();

    let err = adapter
        .outpaint(&request(&dir), &NullSink, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_matches!(err, OutpaintError::PaymentRequired(body) if body.contains("insufficient"));
    assert_eq!(state.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_job_reports_service_error() {
    let (_state, adapter) = spawn(Scenario::Failed).await;
    let dir = tempfile::tempdir().unwrap();

    let err = adapter
        .outpaint(&request(&dir), &NullSink, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_matches!(err, OutpaintError::Execution(msg) if msg == "NSFW content detected");
}

#[tokio::test]
async fn expired_job_fails() {
    let (_state, adapter) = spawn(Scenario::Expired).await;
    let dir = tempfile::tempdir().unwrap();

    let err = adapter
        .outpaint(&request(&dir), &NullSink, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_matches!(err, OutpaintError::Execution(msg) if msg.contains("expired"));
}

#[tokio::test]
async fn poll_budget_exhaustion_times_out() {
    let (state, adapter) = spawn(Scenario::NeverDone).await;
    let adapter = adapter.with_schedule(PollSchedule::uniform(Duration::from_millis(1), 3));
    let dir = tempfile::tempdir().unwrap();

    let err = adapter
        .outpaint(&request(&dir), &NullSink, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_matches!(err, OutpaintError::Timeout(_));
    assert_eq!(state.status_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancellation_interrupts_polling() {
    let (_state, adapter) = spawn(Scenario::NeverDone).await;
    let adapter = adapter.with_schedule(PollSchedule::uniform(Duration::from_secs(60), 240));
    let dir = tempfile::tempdir().unwrap();
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = adapter
        .outpaint(&request(&dir), &NullSink, &token)
        .await
        .unwrap_err();
    assert_matches!(err, OutpaintError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn missing_key_is_unavailable() {
    let adapter = RemoteQueueAdapter::with_clients(
        FalQueueClient::new("   "),
        FreeImageHost::with_endpoint(reqwest::Client::new(), "http://127.0.0.1:1/unused", "k"),
    );
    assert!(!adapter.check_available().await.ready);

    let dir = tempfile::tempdir().unwrap();
    let err = adapter
        .outpaint(&request(&dir), &NullSink, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_matches!(err, OutpaintError::BackendUnavailable(_));
}
