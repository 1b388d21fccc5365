use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use blockhost_runner::{RunnerError, format_error_chain};
use uuid::Uuid;

/// The one failure type callers of the service layer see.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: Uuid },
    #[error("{what} {id} already exists")]
    AlreadyExists { what: &'static str, id: Uuid },
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    Unknown(String),
}

impl ServiceError {
    pub fn not_found(what: &'static str, id: Uuid) -> Self {
        ServiceError::NotFound { what, id }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        ServiceError::Invalid(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        ServiceError::Unknown(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound { .. } => "not_found",
            ServiceError::AlreadyExists { .. } => "already_exists",
            ServiceError::Invalid(_) => "invalid",
            ServiceError::Unknown(_) => "unknown",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::AlreadyExists { .. } => StatusCode::CONFLICT,
            ServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RunnerError> for ServiceError {
    fn from(value: RunnerError) -> Self {
        match value {
            RunnerError::NotFound { what, id } => ServiceError::NotFound { what, id },
            RunnerError::AlreadyExists { what, id } => ServiceError::AlreadyExists { what, id },
            RunnerError::Internal(e) => ServiceError::Unknown(format_error_chain(&e)),
        }
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(value: anyhow::Error) -> Self {
        ServiceError::Unknown(format_error_chain(&value))
    }
}

#[derive(serde::Serialize)]
struct ErrorBody {
    code: &'static str,
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        if let ServiceError::Unknown(msg) = &self {
            tracing::warn!(error = %msg, "request failed");
        }
        let body = ErrorBody {
            code: self.code(),
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
