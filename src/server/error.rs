//! Mapping of domain errors to HTTP responses
//!
//! Every error body is `{error, message?}`: `error` is a short stable text,
//! `message` carries the underlying cause when there is one worth showing.

use crate::fleet::OrchestratorError;
use crate::provision::ProvisionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    message: Option<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    fn internal(cause: impl ToString) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            .with_message(cause.to_string())
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ProvisionError> for ApiError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::Validation(message) => ApiError::bad_request(message),
            ProvisionError::NotFound(_) => ApiError::not_found("Key not found"),
            other => {
                error!(error = %other, kind = other.kind(), "provisioning request failed");
                ApiError::internal(other)
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Validation(message) => ApiError::bad_request(message),
            OrchestratorError::ServerNotFound(_) => ApiError::not_found("Server not found"),
            OrchestratorError::NotFound(_) => ApiError::not_found("Key not found"),
            OrchestratorError::QuotaExceeded { .. } => {
                ApiError::new(StatusCode::CONFLICT, "Key limit reached").with_message(err.to_string())
            }
            OrchestratorError::Forbidden => {
                ApiError::new(StatusCode::FORBIDDEN, "Forbidden").with_message(err.to_string())
            }
            OrchestratorError::Remote(cause) => {
                error!(error = %cause, "agent call failed");
                ApiError::new(StatusCode::BAD_GATEWAY, "Bad Gateway").with_message(cause.to_string())
            }
            other => {
                error!(error = %other, "orchestrator request failed");
                ApiError::internal(other)
            }
        }
    }
}
