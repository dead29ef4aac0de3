//! Unified error types shared across the Conveyor crates.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use thiserror::Error;

/// Unified error type for Conveyor.
///
/// Crate-specific error enums (job errors, breaker errors) convert into this
/// type at crate boundaries so the server binary deals with one error shape.
#[derive(Error, Debug)]
pub enum ConveyorError {
    // ============ Domain Errors ============
    /// Resource not found
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound {
        resource_type: &'static str,
        id: String,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Queue refused new work because its pending depth hit the limit
    #[error("Queue saturated: {0}")]
    QueueSaturated(String),

    // ============ Infrastructure Errors ============
    /// Job store error
    #[error("Job store error: {0}")]
    JobStore(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ============ Resilience Errors ============
    /// Circuit breaker open
    #[error("Service unavailable: circuit breaker open for {0}")]
    CircuitBreakerOpen(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    // ============ Internal Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConveyorError {
    /// Returns a machine-readable error code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::QueueSaturated(_) => "QUEUE_SATURATED",
            Self::JobStore(_) => "JOB_STORE_ERROR",
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::CircuitBreakerOpen(_) => "CIRCUIT_BREAKER_OPEN",
            Self::Timeout(_) => "TIMEOUT",
            Self::Internal(_) | Self::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Creates a not found error for a resource.
    #[must_use]
    pub fn not_found<T: ToString>(resource_type: &'static str, id: T) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a configuration error.
    #[must_use]
    pub fn configuration<T: Into<String>>(message: T) -> Self {
        Self::Configuration(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true when the error must abort process startup.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::JobStore(_) | Self::Configuration(_))
    }
}

impl From<serde_json::Error> for ConveyorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization error: {}", err))
    }
}

/// Field-level validation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Field name
    pub field: String,
    /// Error message
    pub message: String,
    /// Error code
    pub code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ConveyorError::not_found("Job", 1).error_code(), "NOT_FOUND");
        assert_eq!(ConveyorError::validation("bad input").error_code(), "VALIDATION_ERROR");
        assert_eq!(
            ConveyorError::QueueSaturated("email".to_string()).error_code(),
            "QUEUE_SATURATED"
        );
        assert_eq!(ConveyorError::internal("err").error_code(), "INTERNAL_ERROR");
        assert_eq!(ConveyorError::Timeout("t".to_string()).error_code(), "TIMEOUT");
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ConveyorError::JobStore("refused".to_string()).is_fatal());
        assert!(ConveyorError::configuration("missing url").is_fatal());
        assert!(!ConveyorError::QueueSaturated("email".to_string()).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ConveyorError::not_found("DeadLetterEntry", "job-123");
        let msg = err.to_string();
        assert!(msg.contains("DeadLetterEntry") && msg.contains("job-123"));
    }
}
