//! API error types and response handling.
//!
//! This module provides a unified error type for all API handlers
//! with automatic conversion to appropriate HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gasmask_core::GasMaskError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// Unified API error type.
///
/// Each variant maps to a specific HTTP status code and produces a
/// consistent JSON error response.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// 400 Bad Request - Invalid input from client.
    #[error("Bad Request: {message}")]
    BadRequest {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 403 Forbidden - The platform refused access to the link.
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 404 Not Found - Resource does not exist.
    #[error("Not Found: {message}")]
    NotFound {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 409 Conflict - Not possible in the current connection state.
    #[error("Conflict: {message}")]
    Conflict {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 422 Unprocessable Entity - Well-formed but semantically invalid.
    #[error("Unprocessable: {message}")]
    Unprocessable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 500 Internal Server Error - Unexpected server-side error.
    #[error("Internal Error: {message}")]
    InternalError {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional details (not exposed to client in production).
        details: Option<String>,
    },

    /// 502 Bad Gateway - The mask did not answer properly.
    #[error("Bad Gateway: {message}")]
    BadGateway {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
    },

    /// 503 Service Unavailable - The link is unavailable.
    #[error("Service Unavailable: {message}")]
    ServiceUnavailable {
        /// Machine-readable error code.
        error_code: String,
        /// Human-readable error message.
        message: String,
        /// Optional additional details.
        details: Option<String>,
    },
}

/// Standard JSON error response body.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "invalid_state",
    "message": "Cannot scan while connected",
    "details": null
}))]
pub struct ErrorResponse {
    /// Machine-readable error code (e.g., "connection_failed").
    #[schema(example = "invalid_state")]
    pub error: String,

    /// Human-readable error message.
    #[schema(example = "Cannot scan while connected")]
    pub message: String,

    /// Optional additional details for debugging.
    #[schema(nullable)]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Shorthand for a 400 response.
    pub fn bad_request(error_code: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }

    /// Shorthand for a 404 response.
    pub fn not_found(error_code: &str, message: impl Into<String>) -> Self {
        Self::NotFound {
            error_code: error_code.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_response = match self {
            Self::BadRequest { error_code, message }
            | Self::Forbidden { error_code, message }
            | Self::NotFound { error_code, message }
            | Self::Conflict { error_code, message }
            | Self::Unprocessable { error_code, message }
            | Self::BadGateway { error_code, message } => ErrorResponse {
                error: error_code,
                message,
                details: None,
            },

            Self::InternalError {
                error_code,
                message,
                details,
            } => {
                // Log internal errors
                tracing::error!(
                    error_code = %error_code,
                    message = %message,
                    details = ?details,
                    "Internal server error"
                );

                ErrorResponse {
                    error: error_code,
                    message,
                    details: details.map(|d| serde_json::json!(d)),
                }
            }

            Self::ServiceUnavailable {
                error_code,
                message,
                details,
            } => ErrorResponse {
                error: error_code,
                message,
                details: details.map(|d| serde_json::json!(d)),
            },
        };

        (status, Json(error_response)).into_response()
    }
}

/// Convert from gasmask_core errors, using the status each error asks for.
impl From<GasMaskError> for ApiError {
    fn from(err: GasMaskError) -> Self {
        let error_code = err.error_code().to_ascii_lowercase();
        let message = err.to_string();

        match err.http_status_code() {
            403 => Self::Forbidden {
                error_code,
                message,
            },
            404 => Self::NotFound {
                error_code,
                message,
            },
            409 => Self::Conflict {
                error_code,
                message,
            },
            422 => Self::Unprocessable {
                error_code,
                message,
            },
            502 => Self::BadGateway {
                error_code,
                message,
            },
            503 => Self::ServiceUnavailable {
                error_code,
                message,
                details: None,
            },
            _ => Self::InternalError {
                error_code,
                message,
                details: None,
            },
        }
    }
}

impl From<gasmask_core::ConnectionError> for ApiError {
    fn from(err: gasmask_core::ConnectionError) -> Self {
        Self::from(GasMaskError::from(err))
    }
}

impl From<gasmask_core::ConfigError> for ApiError {
    fn from(err: gasmask_core::ConfigError) -> Self {
        Self::from(GasMaskError::from(err))
    }
}
