//! Success and error envelopes shared by every route.
//!
//! - success: `{"data": …, "meta": …}`
//! - failure: `{"error": {"code", "message", "details"}}`

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::error::CoreError;

// ---

/// Wrap `data` and `meta` in the success envelope.
pub fn envelope<T: Serialize>(status: StatusCode, data: T, meta: Value) -> Response {
    (status, Json(json!({ "data": data, "meta": meta }))).into_response()
}

/// Core error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    error: CoreError,
    status: StatusCode,
}

impl ApiError {
    /// Override the default status, e.g. 404 for an unknown station on a
    /// read path.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        let status = error.status();
        Self { error, status }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        if self.status.is_server_error() {
            error!(code = self.error.code(), error = %self.error, "Request failed");
        } else {
            warn!(code = self.error.code(), error = %self.error, "Request rejected");
        }
        (
            self.status,
            Json(json!({ "error": self.error.to_body() })),
        )
            .into_response()
    }
}

pub type ApiResult = Result<Response, ApiError>;
