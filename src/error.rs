//! # Coordination Error Types
//!
//! Structured error handling for the extension runtime using thiserror.
//! Every variant carries a machine-readable code and a retryability flag so
//! clients can drive programmatic retry logic.

use thiserror::Error;

/// Errors raised by the coordination primitives and the extension pipeline
#[derive(Error, Debug)]
pub enum ForrstError {
    #[error("Lock acquisition failed for key: {key}")]
    LockAcquisitionFailed { key: String },

    #[error("Lock acquisition timed out for key {key} after {timeout_ms}ms")]
    LockTimeout { key: String, timeout_ms: u64 },

    #[error("Lock not found for key: {key}")]
    LockNotFound { key: String },

    #[error("Lock ownership mismatch for key {key}: held by another owner, not {owner}")]
    LockOwnershipMismatch { key: String, owner: String },

    #[error("Unauthorized: {operation} on {subject}")]
    Unauthorized { operation: String, subject: String },

    #[error("Unknown cancellation token: {token}")]
    CancellationTokenUnknown { token: String },

    #[error("Request cancelled via token: {token}")]
    Cancelled { token: String },

    #[error("Cancellation token collision: {token} is already registered and active")]
    TokenCollision { token: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Store operation failed: {operation}: {message}")]
    Store { operation: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Extension '{extension}' failed during {phase}: {message}")]
    Extension {
        extension: String,
        phase: String,
        message: String,
    },
}

impl ForrstError {
    /// Create a lock acquisition failure
    pub fn lock_acquisition_failed(key: impl Into<String>) -> Self {
        Self::LockAcquisitionFailed { key: key.into() }
    }

    /// Create a lock timeout error
    pub fn lock_timeout(key: impl Into<String>, timeout_ms: u64) -> Self {
        Self::LockTimeout {
            key: key.into(),
            timeout_ms,
        }
    }

    /// Create a lock not found error
    pub fn lock_not_found(key: impl Into<String>) -> Self {
        Self::LockNotFound { key: key.into() }
    }

    /// Create an ownership mismatch error
    pub fn ownership_mismatch(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::LockOwnershipMismatch {
            key: key.into(),
            owner: owner.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(operation: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::Unauthorized {
            operation: operation.into(),
            subject: subject.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a store operation error
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an extension failure error
    pub fn extension(
        extension: impl Into<String>,
        phase: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Extension {
            extension: extension.into(),
            phase: phase.into(),
            message: message.into(),
        }
    }

    /// Machine-readable error code surfaced to clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::LockAcquisitionFailed { .. } => "LOCK_ACQUISITION_FAILED",
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::LockNotFound { .. } => "LOCK_NOT_FOUND",
            Self::LockOwnershipMismatch { .. } => "LOCK_OWNERSHIP_MISMATCH",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::CancellationTokenUnknown { .. } => "CANCELLATION_TOKEN_UNKNOWN",
            Self::Cancelled { .. } => "CANCELLED",
            Self::TokenCollision { .. } => "CANCELLATION_TOKEN_COLLISION",
            Self::InvalidInput { .. } => "INVALID_INPUT",
            Self::Store { .. } => "STORE_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Extension { .. } => "EXTENSION_ERROR",
        }
    }

    /// Whether the client may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LockAcquisitionFailed { .. } | Self::LockTimeout { .. } | Self::Store { .. }
        )
    }
}

/// Conversion from serde_json::Error to ForrstError
impl From<serde_json::Error> for ForrstError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, ForrstError>;
