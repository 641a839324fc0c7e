//! Shared application router builder.
//!
//! The binary and the integration tests both go through
//! [`build_app_router`] so they exercise the same middleware stack.

use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::Router;
use outpaint_core::error::CoreError;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;
use crate::routes;
use crate::state::AppState;

/// Build the full application [`Router`] with all middleware layers.
///
/// The middleware stack is applied bottom-up:
///
/// 1. CORS
/// 2. Structured request/response tracing
/// 3. Request timeout
/// 4. Panic recovery (catch panics, return 500)
/// 5. Upload size limit
pub fn build_app_router(state: AppState) -> Result<Router, CoreError> {
    let config = state.config.clone();
    let cors = build_cors_layer(&config)?;

    Ok(routes::api_routes()
        // -- Middleware stack (applied bottom-up) --
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors)
        .with_state(state))
}

/// Build the CORS middleware layer from server configuration.
///
/// `*` allows any origin without credentials; otherwise every origin must
/// parse as a header value.
pub fn build_cors_layer(config: &ServerConfig) -> Result<CorsLayer, CoreError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    if config.allows_any_origin() {
        return Ok(layer.allow_origin(Any));
    }

    let origins = config
        .cors_origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>()
                .map_err(|e| CoreError::Config(format!("Invalid CORS origin '{o}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(layer.allow_origin(origins).allow_credentials(true))
}
