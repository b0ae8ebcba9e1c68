//! Station report ingestion.
//!
//! - `POST /reports` takes a JSON report tagged with its `format`
//! - `GET /weatherstation/updateweatherstation.php` takes the Weather
//!   Underground upload protocol as query parameters

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tracing::debug;

use super::{envelope, ApiResult, AppState};
use crate::error::CoreError;
use crate::models::{RawReport, WundergroundReport};

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/reports", post(ingest_report))
        .route(
            "/weatherstation/updateweatherstation.php",
            get(ingest_wunderground),
        )
}

async fn ingest_report(State(engine): State<AppState>, body: Bytes) -> ApiResult {
    // ---
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| CoreError::malformed(format!("invalid JSON body: {e}")))?;
    let raw = RawReport::from_value(value)?;

    let measurement = engine.ingest(&raw).await?;
    debug!(station = %measurement.station_id, "POST /reports accepted");

    let meta = json!({ "fields": measurement.fields.len() });
    Ok(envelope(StatusCode::CREATED, measurement, meta))
}

async fn ingest_wunderground(
    State(engine): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> ApiResult {
    // ---
    let params = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    let raw = RawReport::Wunderground(WundergroundReport { params });

    let measurement = engine.ingest(&raw).await?;
    let meta = json!({ "fields": measurement.fields.len() });
    Ok(envelope(StatusCode::CREATED, measurement, meta))
}
