use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use statebridge_core::BridgeError;

// ---------------------------------------------------------------------------
// Sentinels for explicit statuses
// ---------------------------------------------------------------------------

/// Carries an explicit 404 through the `anyhow::Error` chain.
#[derive(Debug)]
struct NotFoundError(String);

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NotFoundError {}

#[derive(Debug)]
struct BadRequestError(String);

impl std::fmt::Display for BadRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadRequestError {}

// ---------------------------------------------------------------------------
// AppError
// ---------------------------------------------------------------------------

/// Unified error type for HTTP responses.
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(BadRequestError(msg.into()).into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self(NotFoundError(msg.into()).into())
    }
}

fn status_of(err: &BridgeError) -> StatusCode {
    match err {
        BridgeError::ThunkNotFound(_) => StatusCode::NOT_FOUND,
        BridgeError::AccessDenied { .. } => StatusCode::FORBIDDEN,
        BridgeError::InvalidParent(_) | BridgeError::ApplyActionFailed(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        BridgeError::ActionCancelled(_) => StatusCode::CONFLICT,
        BridgeError::ChannelLost(_) => StatusCode::SERVICE_UNAVAILABLE,
        BridgeError::LockTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        BridgeError::Config(_) => StatusCode::BAD_REQUEST,
        BridgeError::Io(_) | BridgeError::Json(_) | BridgeError::Yaml(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(n) = self.0.downcast_ref::<NotFoundError>() {
            let body = serde_json::json!({ "error": n.0.clone() });
            return (StatusCode::NOT_FOUND, axum::Json(body)).into_response();
        }
        if let Some(b) = self.0.downcast_ref::<BadRequestError>() {
            let body = serde_json::json!({ "error": b.0.clone() });
            return (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
        }

        let status = self
            .0
            .downcast_ref::<BridgeError>()
            .map(status_of)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
