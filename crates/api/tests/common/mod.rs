//! Shared helpers for the API integration tests.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat, RgbImage};
use outpaint_core::backend::{Availability, BackendAdapter, BackendRequest, SharedBackend};
use outpaint_core::config::OutpaintConfig;
use outpaint_core::error::OutpaintError;
use outpaint_core::sink::{MessageSink, NullSink};
use outpaint_core::types::BackendKind;
use outpaint_pipeline::generator::JobOrchestrator;
use outpaint_pipeline::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use outpaint_api::config::ServerConfig;
use outpaint_api::router::build_app_router;
use outpaint_api::state::AppState;

pub const BOUNDARY: &str = "outpaint-test-boundary";

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

/// Returns `num_images` small PNGs, or the configured error.
pub struct FakeBackend {
    kind: BackendKind,
    failure: Option<OutpaintError>,
    calls: AtomicUsize,
    last_request: Mutex<Option<BackendRequest>>,
}

impl FakeBackend {
    pub fn working(kind: BackendKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            failure: None,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub fn failing(kind: BackendKind, err: OutpaintError) -> Arc<Self> {
        Arc::new(Self {
            kind,
            failure: Some(err),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<BackendRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendAdapter for FakeBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn outpaint(
        &self,
        request: &BackendRequest,
        _progress: &dyn MessageSink,
        _cancel: &CancellationToken,
    ) -> Result<Vec<Vec<u8>>, OutpaintError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok((0..request.params.num_images)
                .map(|_| png_bytes(8, 8))
                .collect()),
        }
    }

    async fn check_available(&self) -> Availability {
        Availability::ready(format!("{} fake ready", self.kind.display_name()))
    }
}

pub fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::new(w, h))
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

// ---------------------------------------------------------------------------
// App builders
// ---------------------------------------------------------------------------

pub fn test_config(work_dir: &Path) -> ServerConfig {
    let mut config = ServerConfig::from_lookup(|_| None).unwrap();
    config.host = "127.0.0.1".into();
    config.port = 0;
    config.request_timeout_secs = 30;
    config.work_dir = work_dir.to_path_buf();
    config
}

/// Router whose requests all run against `backend`.
pub fn build_test_app(
    backend: Arc<FakeBackend>,
    base: OutpaintConfig,
    work_dir: &Path,
) -> Router {
    let factory = move |config: OutpaintConfig| -> Result<JobOrchestrator, OutpaintError> {
        let active: SharedBackend = backend.clone();
        Ok(JobOrchestrator::with_backends(config, active, None)
            .with_retry_policy(RetryPolicy::none())
            .with_progress(Arc::new(NullSink)))
    };
    let state = AppState::new(test_config(work_dir), base).with_orchestrators(factory);
    build_app_router(state).unwrap()
}

/// Router using the production adapter factory.
pub fn build_configured_app(base: OutpaintConfig, work_dir: &Path) -> Router {
    build_app_router(AppState::new(test_config(work_dir), base)).unwrap()
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

/// Multipart form with text `fields` and an optional `image` part.
pub fn multipart_body(fields: &[(&str, &str)], image: Option<(&str, &[u8])>) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in fields {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
            )
            .as_bytes(),
        );
    }
    if let Some((content_type, bytes)) = image {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; \
                 filename=\"cat.png\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn post_outpaint(app: Router, body: Vec<u8>) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/outpaint")
        .header(
            CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Entries left under the work dir.
pub fn leftover_entries(work_dir: &Path) -> usize {
    std::fs::read_dir(work_dir).map(|d| d.count()).unwrap_or(0)
}
