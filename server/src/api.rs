//! # HTTP Endpoints
//!
//! The non-WebSocket surface: a root redirect for browsers that wander in,
//! the health probe, and a counters snapshot for dashboards.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::state::AppState;
use crate::stats::StatsSnapshot;

/// `GET /` — 302 to the configured redirect URL, or 404 when none is set.
pub async fn root(State(app): State<AppState>) -> Response {
    match &app.config.redirect_url {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.clone())]).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `GET /health` — liveness probe.
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// `GET /api/stats` — point-in-time counters for external dashboards.
pub async fn stats(State(app): State<AppState>) -> Json<StatsSnapshot> {
    Json(app.stats.snapshot())
}
