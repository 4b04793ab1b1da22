//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use threadline_core::workflow::EngineError;
use threadline_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    Engine(EngineError),
    Validation(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Engine(EngineError::SessionNotFound(_)) => {
                (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND")
            }
            AppError::Engine(EngineError::SessionTerminal { .. }) => {
                (StatusCode::CONFLICT, "SESSION_TERMINAL")
            }
            AppError::Engine(EngineError::NotAwaitingInput { .. }) => {
                (StatusCode::CONFLICT, "NOT_AWAITING_INPUT")
            }
            AppError::Engine(EngineError::SessionExists(_)) => {
                (StatusCode::CONFLICT, "SESSION_EXISTS")
            }
            AppError::Engine(EngineError::Repository(RepositoryError::NotFound)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            AppError::Engine(EngineError::Repository(RepositoryError::Conflict(_))) => {
                (StatusCode::CONFLICT, "CONFLICT")
            }
            AppError::Engine(EngineError::Repository(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR")
            }
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Engine(e) => e.to_string(),
            AppError::Validation(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self.message(), "request failed");
        }
        let body = ApiResponse::error(code, &self.message(), uuid::Uuid::now_v7().to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadline_types::session::SessionStatus;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                AppError::Engine(EngineError::SessionNotFound("x".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                AppError::Engine(EngineError::SessionTerminal {
                    id: "x".into(),
                    status: SessionStatus::Completed,
                }),
                StatusCode::CONFLICT,
            ),
            (
                AppError::Engine(EngineError::NotAwaitingInput {
                    id: "x".into(),
                    status: SessionStatus::Active,
                }),
                StatusCode::CONFLICT,
            ),
            (
                AppError::Engine(EngineError::SessionExists("x".into())),
                StatusCode::CONFLICT,
            ),
            (
                AppError::Engine(EngineError::Repository(RepositoryError::Query("bad".into()))),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::Validation("empty".into()), StatusCode::BAD_REQUEST),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
