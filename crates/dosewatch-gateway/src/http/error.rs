use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dosewatch_scheduler::SchedulerError;
use serde_json::json;
use tracing::error;

/// Error body returned by every API handler: `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Request body that does not deserialize into the expected shape.
    pub fn invalid_body(e: serde_json::Error) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_SPEC",
            message: e.to_string(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            SchedulerError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
            SchedulerError::NotFound { .. } => StatusCode::NOT_FOUND,
            SchedulerError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Storage details stay in the log.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(code = e.code(), "request failed: {e}");
            "internal error".to_string()
        } else {
            e.to_string()
        };
        Self {
            status,
            code: e.code(),
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": { "code": self.code, "message": self.message } })),
        )
            .into_response()
    }
}
