//! Error handling for the validation service

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::engine::{EngineError, EngineErrorKind};
use crate::outcome::OutcomeFormatter;
use crate::package::PackageError;

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Service error types
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Package error: {0}")]
    Package(#[from] PackageError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServiceError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Engine(e) => match e.kind {
                EngineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            },
            ServiceError::Init(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Package(e) => match e {
                PackageError::NotFound(_) => StatusCode::NOT_FOUND,
                PackageError::Registry(_) => StatusCode::BAD_GATEWAY,
                PackageError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            },
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Json(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            ServiceError::BadRequest(_) => "BAD_REQUEST",
            ServiceError::Engine(e) => match e.kind {
                EngineErrorKind::UnsupportedResourceType => "UNSUPPORTED_RESOURCE_TYPE",
                EngineErrorKind::UnsupportedVersion => "UNSUPPORTED_VERSION",
                EngineErrorKind::Unprocessable => "UNPROCESSABLE_RESOURCE",
                EngineErrorKind::Unsupported => "UNSUPPORTED_OPERATION",
                EngineErrorKind::Internal => "ENGINE_ERROR",
            },
            ServiceError::Init(_) => "INIT_ERROR",
            ServiceError::Config(_) => "CONFIG_ERROR",
            ServiceError::Package(_) => "PACKAGE_ERROR",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
            ServiceError::Io(_) => "IO_ERROR",
            ServiceError::Json(_) => "JSON_ERROR",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(
                error = %self,
                status = %status,
                error_code = error_code,
                "Server error occurred"
            );
        } else {
            tracing::warn!(
                error = %self,
                status = %status,
                error_code = error_code,
                "Request rejected"
            );
        }

        let mut body = json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        });

        if let ServiceError::Engine(e) = self {
            if !e.issues.is_empty() {
                let issues: Vec<_> = e.issues.into_iter().map(OutcomeFormatter::issue).collect();
                body["issues"] = json!(issues);
            }
        }

        (status, Json(body)).into_response()
    }
}
