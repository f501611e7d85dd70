use http::StatusCode;
use serde_json::json;

/// Gateway error type used across modules.
///
/// Only failures before the SSE headers are sent become a `GatewayError`
/// response; once streaming, failures finish the stream instead.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The prepare collaborator refused the request or answered unusably.
    #[error("Prepare error: status={status}, message={message}")]
    Prepare { status: u16, message: String },
    /// The vendor answered non-OK before streaming started.
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Prepare { status, .. } | Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message, without the variant prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Config(message)
            | Self::InvalidRequest(message)
            | Self::Transport(message)
            | Self::Internal(message)
            | Self::Prepare { message, .. }
            | Self::Upstream { message, .. } => message,
        }
    }
}

/// OpenAI error `type` for an HTTP status.
#[must_use]
pub fn openai_error_type(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        429 => "rate_limit_error",
        503 => "service_unavailable_error",
        500..=599 => "api_error",
        _ => "invalid_request_error",
    }
}

/// `{"error":{...}}` body in the OpenAI shape.
#[must_use]
pub fn openai_error_body(status: StatusCode, message: &str) -> serde_json::Value {
    json!({
        "error": {
            "message": message,
            "type": openai_error_type(status),
            "code": null,
            "param": null,
        }
    })
}

#[must_use]
pub fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    use axum::response::IntoResponse;
    (status, axum::Json(openai_error_body(status, message))).into_response()
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        error_response(self.status(), self.message())
    }
}
