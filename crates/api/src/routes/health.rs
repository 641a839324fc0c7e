use axum::extract::State;
use axum::{routing::get, Json, Router};
use outpaint_core::backend::Availability;
use outpaint_core::config::ConfigProvider;
use outpaint_core::types::BackendKind;
use serde::Serialize;

use crate::state::AppState;

/// Service banner with the route map.
#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub status: &'static str,
    pub endpoints: Endpoints,
}

#[derive(Debug, Serialize)]
pub struct Endpoints {
    pub health: &'static str,
    pub outpaint: &'static str,
    pub config: &'static str,
    pub backend_status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct BackendHealth {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub available: bool,
    pub message: String,
}

/// Health check response payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// The process is up; backend readiness is reported separately.
    pub status: &'static str,
    pub version: &'static str,
    pub backend: BackendHealth,
    /// `"enabled"` when ComfyUI is selected, `"not_needed"` otherwise.
    pub auto_fallback: &'static str,
}

#[derive(Debug, Serialize)]
pub struct BackendStatusResponse {
    pub backend: BackendKind,
    pub available: bool,
    pub message: String,
    pub fallback_available: bool,
}

struct Probe {
    kind: BackendKind,
    availability: Availability,
    fallback_available: bool,
}

/// Probe the configured backend without submitting work. A backend that
/// cannot even be constructed reports the construction error.
async fn probe(state: &AppState) -> Probe {
    let config = state.outpaint.current();
    let kind = config.backend;
    match state.orchestrators.build(config) {
        Ok(orchestrator) => Probe {
            kind,
            availability: orchestrator.check_backend_available().await,
            fallback_available: orchestrator.fallback_available(),
        },
        Err(err) => Probe {
            kind,
            availability: Availability::unavailable(err.to_string()),
            fallback_available: false,
        },
    }
}

/// GET / -- service banner.
async fn index() -> Json<IndexResponse> {
    Json(IndexResponse {
        name: "Outpaint API",
        version: env!("CARGO_PKG_VERSION"),
        status: "healthy",
        endpoints: Endpoints {
            health: "/health",
            outpaint: "/outpaint (POST)",
            config: "/config (GET)",
            backend_status: "/backend/status (GET)",
        },
    })
}

/// GET /health -- service status plus a backend readiness probe.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let probe = probe(&state).await;
    let auto_fallback = match probe.kind {
        BackendKind::ComfyUi => "enabled",
        BackendKind::FalAi => "not_needed",
    };

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        backend: BackendHealth {
            kind: probe.kind,
            available: probe.availability.ready,
            message: probe.availability.message,
        },
        auto_fallback,
    })
}

/// GET /backend/status
async fn backend_status(State(state): State<AppState>) -> Json<BackendStatusResponse> {
    let probe = probe(&state).await;
    tracing::debug!(
        backend = %probe.kind,
        available = probe.availability.ready,
        "Backend status probed"
    );

    Json(BackendStatusResponse {
        backend: probe.kind,
        available: probe.availability.ready,
        message: probe.availability.message,
        fallback_available: probe.fallback_available,
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .route("/backend/status", get(backend_status))
}
