//! Station registry and latest-reading routes.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::json;

use super::{envelope, ApiError, ApiResult, AppState};
use crate::error::CoreError;

// ---

#[derive(Debug, Deserialize)]
struct NewStation {
    id: String,
}

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/stations", get(list_stations).post(register_station))
        .route("/stations/{id}/latest", get(latest))
}

async fn list_stations(State(engine): State<AppState>) -> ApiResult {
    let stations = engine.stations();
    let meta = json!({ "count": stations.len() });
    Ok(envelope(StatusCode::OK, stations, meta))
}

async fn register_station(State(engine): State<AppState>, body: Bytes) -> ApiResult {
    // ---
    let station: NewStation = serde_json::from_slice(&body)
        .map_err(|e| CoreError::malformed(format!("invalid station body: {e}")))?;

    let created = engine.register_station(&station.id).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(envelope(status, json!({ "id": station.id.trim() }), json!({ "created": created })))
}

async fn latest(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult {
    // ---
    let measurement = engine.latest(&id).await.map_err(|e| {
        let not_found = matches!(e, CoreError::UnknownStation { .. });
        let err = ApiError::from(e);
        if not_found {
            err.with_status(StatusCode::NOT_FOUND)
        } else {
            err
        }
    })?;

    let meta = json!({ "station_id": id, "has_data": measurement.is_some() });
    Ok(envelope(StatusCode::OK, measurement, meta))
}
