use std::sync::Arc;

use axum::Router;

use crate::Engine;

mod aggregates;
mod health;
mod reports;
mod response;
mod rules;
mod stations;

use response::{envelope, ApiError, ApiResult};

/// State shared by every route.
pub type AppState = Arc<Engine>;

// ---

pub fn router(engine: AppState) -> Router {
    // ---
    Router::new()
        .merge(reports::router())
        .merge(aggregates::router())
        .merge(stations::router())
        .merge(rules::router())
        .merge(health::router())
        .with_state(engine)
}
