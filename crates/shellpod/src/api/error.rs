//! API error type and its JSON rendering.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::lifecycle::SessionError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// The session is in a phase that cannot serve the request.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "{}", self);
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.error_code(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::InvalidSessionId(_) | SessionError::InvalidIdentity(_) => {
                ApiError::BadRequest(message)
            }
            SessionError::Orphaned(_) | SessionError::Destroyed(_) => ApiError::Conflict(message),
            SessionError::NotRunning(_)
            | SessionError::StartFailed(_)
            | SessionError::Unreachable(_)
            | SessionError::Unavailable(_)
            | SessionError::Container(_) => ApiError::ServiceUnavailable(message),
            SessionError::Credentials(_) | SessionError::Store(_) => ApiError::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_status_codes() {
        let cases = [
            (
                SessionError::InvalidIdentity("empty".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                SessionError::InvalidSessionId("a/b".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (SessionError::Orphaned("s".to_string()), StatusCode::CONFLICT),
            (SessionError::Destroyed("s".to_string()), StatusCode::CONFLICT),
            (
                SessionError::StartFailed("timeout".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SessionError::Unreachable("refused".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                SessionError::Credentials("partial".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn message_is_kept() {
        let err = ApiError::from(SessionError::Destroyed("s1".to_string()));
        assert_eq!(err.to_string(), "session s1 has been destroyed");
        assert_eq!(err.error_code(), "CONFLICT");
    }
}
