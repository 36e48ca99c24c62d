use axum::{
    response::{IntoResponse, Response},
    http::StatusCode,
};
use serde_json::json;
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("LLM API error: {0}")]
    LlmError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("{0}")]
    Validation(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Operation already in progress: {0}")]
    Busy(String),
    #[error("HTTP Error: {0}")]
    HttpError(String),
    #[error("File processing error: {0}")]
    FileProcessingError(String),
    #[error("{operation} failed: {message}")]
    OperationFailed { operation: String, message: String },
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Wraps any error as the failure of a named user-facing operation,
    /// e.g. "Schema generation failed: LLM API error: rate limited".
    pub fn during(operation: &str) -> impl FnOnce(AppError) -> AppError + '_ {
        move |err| match err {
            AppError::Cancelled => AppError::Cancelled,
            other => AppError::OperationFailed {
                operation: operation.to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::HttpError(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::HttpError(_) => StatusCode::BAD_REQUEST,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::LlmError(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ParseError(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Busy(_) => StatusCode::CONFLICT,
            AppError::FileProcessingError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::OperationFailed { .. } => StatusCode::BAD_GATEWAY,
            AppError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
