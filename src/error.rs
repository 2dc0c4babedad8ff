// Clima Agent -- HTTP error type
//
// Errors for the plain REST endpoints. JSON-RPC failures never go through
// here; they are encoded in the RPC response body with HTTP 200.

use axum::Json;
use axum::http::StatusCode;
use serde_json::json;
use uuid::Uuid;

/// Logs full details server-side, returns sanitized JSON to the client.
///
/// ```json
/// { "error": { "code": "NOT_FOUND", "message": "...", "request_id": "uuid", "details": null } }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Never leaks internal details.
    fn sanitized_message(&self) -> String {
        match self {
            ApiError::BadRequest(m) => m.clone(),
            ApiError::NotFound(_) => "Resource not found".to_string(),
            ApiError::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let request_id = Uuid::new_v4().to_string();

        if status.is_server_error() {
            tracing::error!(request_id = %request_id, code = self.error_code(), "API error ({}): {}", status.as_u16(), self);
        } else {
            tracing::debug!(request_id = %request_id, code = self.error_code(), "API error ({}): {}", status.as_u16(), self);
        }

        let body = json!({
            "error": {
                "code": self.error_code(),
                "message": self.sanitized_message(),
                "request_id": request_id,
                "details": null,
            }
        });
        (status, Json(body)).into_response()
    }
}
