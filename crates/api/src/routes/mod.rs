pub mod health;
pub mod outpaint;
pub mod settings;

use axum::Router;

use crate::state::AppState;

/// Build the route tree.
///
/// ```text
/// /                     GET   service banner
/// /health               GET   process + backend readiness
/// /backend/status       GET   backend readiness, fallback availability
/// /config               GET   settings with the API key masked
/// /outpaint             POST  multipart single-image outpaint
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(settings::router())
        .merge(outpaint::router())
}
