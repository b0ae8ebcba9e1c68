// src/routes/health.rs
//! Service health endpoint.
//!
//! `GET /health` is used by orchestrators and CI to check that the service
//! answers and that its backing store is reachable. A failing store turns
//! the response into a 503 with `status: "degraded"`; cache and publisher
//! counters are included for quick inspection.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde_json::json;

use super::{envelope, ApiResult, AppState};

/// Handle `GET /health`.
async fn health(State(engine): State<AppState>) -> ApiResult {
    // ---
    let report = engine.health().await;
    let status = if report.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(envelope(status, report, json!({})))
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
