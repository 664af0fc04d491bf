//! Server error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use scribe_core::EngineError;
use serde_json::json;
use thiserror::Error;

/// Convenience result type for handlers.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced by the HTTP layer.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("unknown run '{0}'")]
    UnknownRun(String),

    #[error("run '{0}' is still in progress")]
    NotFinished(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Engine(EngineError),
}

impl From<EngineError> for ServerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownRun(id) => ServerError::UnknownRun(id),
            other => ServerError::Engine(other),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            ServerError::UnknownRun(_) => (StatusCode::NOT_FOUND, "unknown_run"),
            ServerError::NotFinished(_) => (StatusCode::CONFLICT, "not_finished"),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServerError::Engine(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.kind()),
        };
        let body = Json(json!({
            "error": kind,
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_run_maps_to_404() {
        let response = ServerError::UnknownRun("abc".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_engine_error_converts_unknown_run() {
        let err: ServerError = EngineError::UnknownRun("abc".into()).into();
        assert!(matches!(err, ServerError::UnknownRun(_)));
    }
}
