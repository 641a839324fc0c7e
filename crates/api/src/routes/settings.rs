use axum::extract::State;
use axum::{routing::get, Json, Router};
use outpaint_core::config::ConfigProvider;
use outpaint_core::types::BackendKind;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    /// Current settings with the fal.ai key masked.
    pub config: serde_json::Value,
    /// Whether a ComfyUI crash would switch requests to fal.ai.
    pub auto_fallback: bool,
}

/// GET /config
async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let config = state.outpaint.current();
    let auto_fallback = config.backend == BackendKind::ComfyUi && config.has_fal_credential();

    Json(ConfigResponse {
        config: config.redacted(),
        auto_fallback,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/config", get(get_config))
}
