use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::auth::AuthError;
use crate::engine::{EngineError, ErrorKind};

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    kind: &'static str,
    code: &'static str,
}

/// Every failure the API returns. Status comes from the error kind alone.
#[derive(Debug)]
pub struct HttpError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl HttpError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "validation",
            code: "invalid",
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            kind: "transient",
            code: "unavailable",
            message: message.into(),
        }
    }
}

fn status_for(kind: ErrorKind) -> (StatusCode, &'static str) {
    match kind {
        ErrorKind::Authorization => (StatusCode::FORBIDDEN, "authorization"),
        ErrorKind::Conflict => (StatusCode::CONFLICT, "conflict"),
        ErrorKind::Validation => (StatusCode::BAD_REQUEST, "validation"),
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        ErrorKind::Transient => (StatusCode::SERVICE_UNAVAILABLE, "transient"),
    }
}

impl From<EngineError> for HttpError {
    fn from(err: EngineError) -> Self {
        let (status, kind) = status_for(err.kind());
        if status.is_server_error() {
            tracing::error!("request failed: {err}");
        }
        Self {
            status,
            kind,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<AuthError> for HttpError {
    fn from(err: AuthError) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: "authentication",
            code: err.reason(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
            kind: self.kind,
            code: self.code,
        });
        (self.status, body).into_response()
    }
}
