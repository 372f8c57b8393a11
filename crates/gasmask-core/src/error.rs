//! Unified error types for the gasmask core library.
//!
//! This module provides a unified error type [`GasMaskError`] that covers all
//! failure modes across the pipeline. Each module also has its own specific
//! error type (`DecodeError`, `TransportError`, `ConnectionError`,
//! `ConfigError`, `StorageError`) for internal use.
//!
//! # Design Principles
//!
//! - **Specific variants**: Each error variant captures exactly one failure mode
//! - **Actionable messages**: Error messages guide users toward resolution
//! - **Context preservation**: Wrapped errors maintain their original context
//! - **HTTP-ready**: Error types include HTTP status codes and error codes
//!
//! # Example
//!
//! ```rust
//! use gasmask_core::error::{GasMaskError, Result};
//!
//! fn require_device(id: Option<&str>) -> Result<&str> {
//!     id.ok_or_else(|| GasMaskError::DeviceNotFound("no device selected".into()))
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all gasmask operations.
#[derive(Debug, Error)]
pub enum GasMaskError {
    // =========================================================================
    // TELEMETRY ERRORS
    // =========================================================================
    /// A payload was missing a channel or carried a non-numeric value.
    #[error("Incomplete reading: {0}")]
    IncompleteReading(String),

    // =========================================================================
    // CONNECTION ERRORS
    // =========================================================================
    /// A required platform permission was not granted.
    #[error("Permission denied: {0}. Grant Bluetooth/network access and try again.")]
    PermissionDenied(String),

    /// The transport could not be opened or the data endpoint was not found.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The link dropped and every reconnect attempt failed.
    #[error("Reconnect gave up after {attempts} attempts. Check that the device is powered on and in range.")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Device discovery failed.
    #[error("Device scan failed: {0}")]
    ScanFailed(String),

    /// The requested device is unknown.
    #[error("Device not found: '{0}'. Run a scan and pick one of the discovered devices.")]
    DeviceNotFound(String),

    /// The operation is not valid in the current connection state.
    #[error("Invalid connection state: {0}")]
    InvalidState(String),

    /// The operation was cancelled by an explicit disconnect.
    #[error("Operation cancelled by disconnect")]
    Cancelled,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),

    // =========================================================================
    // PERSISTENCE & I/O ERRORS
    // =========================================================================
    /// An error occurred while persisting or reading data.
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// A low-level I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// A specialized [`Result`] type for gasmask operations.
pub type Result<T> = std::result::Result<T, GasMaskError>;

/// Short alias for [`GasMaskError`].
pub type Error = GasMaskError;

impl GasMaskError {
    /// Returns `true` if this error is related to the device link.
    #[inline]
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_)
                | Self::ConnectionFailed(_)
                | Self::ReconnectExhausted { .. }
                | Self::ScanFailed(_)
                | Self::DeviceNotFound(_)
                | Self::InvalidState(_)
                | Self::Cancelled
        )
    }

    /// Returns `true` if this error is related to configuration.
    #[inline]
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound(_) | Self::ConfigParseError(_) | Self::ConfigValidationError(_)
        )
    }

    /// Returns `true` if this error is related to I/O or persistence.
    #[inline]
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(self, Self::PersistenceError(_) | Self::IoError(_))
    }

    /// Returns `true` if retrying the same action may succeed.
    #[inline]
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ReconnectExhausted { .. }
                | Self::ScanFailed(_)
                | Self::IncompleteReading(_)
                | Self::Cancelled
        )
    }

    /// Returns an HTTP-appropriate status code for this error.
    #[inline]
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 403 Forbidden - platform refused access
            Self::PermissionDenied(_) => 403,

            // 404 Not Found
            Self::ConfigNotFound(_) | Self::DeviceNotFound(_) => 404,

            // 409 Conflict - not possible in the current state
            Self::InvalidState(_) | Self::Cancelled => 409,

            // 422 Unprocessable Entity - semantic errors
            Self::IncompleteReading(_)
            | Self::ConfigParseError(_)
            | Self::ConfigValidationError(_) => 422,

            // 500 Internal Server Error - server-side issues
            Self::PersistenceError(_) | Self::IoError(_) => 500,

            // 502 Bad Gateway - the device did not answer properly
            Self::ConnectionFailed(_) => 502,

            // 503 Service Unavailable - link unavailable
            Self::ReconnectExhausted { .. } | Self::ScanFailed(_) => 503,
        }
    }

    /// Returns a machine-readable error code for API responses.
    #[inline]
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::IncompleteReading(_) => "INCOMPLETE_READING",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::ReconnectExhausted { .. } => "RECONNECT_EXHAUSTED",
            Self::ScanFailed(_) => "SCAN_FAILED",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Cancelled => "CANCELLED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
            Self::PersistenceError(_) => "PERSISTENCE_ERROR",
            Self::IoError(_) => "IO_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::decoder::DecodeError> for GasMaskError {
    fn from(err: crate::decoder::DecodeError) -> Self {
        Self::IncompleteReading(err.to_string())
    }
}

impl From<crate::transport::TransportError> for GasMaskError {
    fn from(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError;
        match err {
            TransportError::PermissionDenied { message } => Self::PermissionDenied(message),
            TransportError::AdapterUnavailable { message } | TransportError::ScanFailed { message } => {
                Self::ScanFailed(message)
            }
            TransportError::ConnectFailed { .. }
            | TransportError::EndpointNotFound { .. }
            | TransportError::Timeout { .. }
            | TransportError::Closed => Self::ConnectionFailed(err.to_string()),
            TransportError::Io(e) => Self::IoError(e),
        }
    }
}

impl From<crate::connection::ConnectionError> for GasMaskError {
    fn from(err: crate::connection::ConnectionError) -> Self {
        use crate::connection::ConnectionError;
        match err {
            ConnectionError::PermissionDenied { message } => Self::PermissionDenied(message),
            ConnectionError::ConnectionFailed { .. } => Self::ConnectionFailed(err.to_string()),
            ConnectionError::ReconnectExhausted { attempts, .. } => {
                Self::ReconnectExhausted { attempts }
            }
            ConnectionError::ScanFailed { message } => Self::ScanFailed(message),
            ConnectionError::InvalidState { .. } => Self::InvalidState(err.to_string()),
            ConnectionError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<crate::config::ConfigError> for GasMaskError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path.into()),
            ConfigError::ReadError { path, source } => {
                Self::PersistenceError(format!("Failed to read {path}: {source}"))
            }
            ConfigError::WriteError { path, source } => {
                Self::PersistenceError(format!("Failed to write {path}: {source}"))
            }
            ConfigError::LoadError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::storage::StorageError> for GasMaskError {
    fn from(err: crate::storage::StorageError) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

// =============================================================================
// TESTS
// =============================================================================
