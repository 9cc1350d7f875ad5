//! Error responses for the Cadence API
//!
//! Every error leaves the API in the same envelope:
//! `{"error": msg, "errorDetails": {"errorCode": "ERR_...", "errorMessage": msg}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, warn};

use crate::error::ServerError;

/// Build the standard error envelope
pub fn error_response(status: StatusCode, error_code: &str, message: &str) -> Response {
    let body = Json(json!({
        "error": message,
        "errorDetails": {
            "errorCode": error_code,
            "errorMessage": message,
        }
    }));

    (status, body).into_response()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND"),
            ServerError::ValidationError(_) => (StatusCode::BAD_REQUEST, "ERR_VALIDATION_ERROR"),
            ServerError::Conflict(_) => (StatusCode::CONFLICT, "ERR_CONFLICT"),
            ServerError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "ERR_STORE_UNAVAILABLE"),
            ServerError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_CONFIG_ERROR"),
            ServerError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL_SERVER_ERROR"),
        };

        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }

        error_response(status, error_code, &self.to_string())
    }
}
