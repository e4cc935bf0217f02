use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use refinery_core::error::RefineryError;

/// Engine error rendered as `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub RefineryError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            e if e.is_validation() => StatusCode::UNPROCESSABLE_ENTITY,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            RefineryError::CancellationConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RefineryError> for ApiError {
    fn from(e: RefineryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
