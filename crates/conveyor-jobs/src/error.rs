//! Job error types.

use conveyor_core::{render_validation_errors, ConveyorError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use validator::ValidationErrors;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Payload or options failed validation; the job was never created.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Queue refused new work.
    #[error("Queue '{queue}' is saturated: depth {depth} >= limit {limit}")]
    QueueSaturated { queue: String, depth: u64, limit: u64 },

    /// Job or entry not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Invalid job or system state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Job store error not covered by the variants above.
    #[error("Job store error: {0}")]
    Store(String),

    /// Operation timed out.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Redis(_)
                | JobError::Pool(_)
                | JobError::Store(_)
                | JobError::Timeout(_)
                | JobError::QueueSaturated { .. }
        )
    }

    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        JobError::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

impl From<ValidationErrors> for JobError {
    fn from(errors: ValidationErrors) -> Self {
        JobError::Validation(render_validation_errors(&errors))
    }
}

impl From<ConveyorError> for JobError {
    fn from(err: ConveyorError) -> Self {
        match err {
            ConveyorError::Validation(msg) => JobError::Validation(msg),
            ConveyorError::Configuration(msg) => JobError::Configuration(msg),
            ConveyorError::JobStore(msg) => JobError::Store(msg),
            other => JobError::Internal(other.to_string()),
        }
    }
}

impl From<JobError> for ConveyorError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(msg) => ConveyorError::Validation(msg),
            JobError::QueueSaturated { .. } => ConveyorError::QueueSaturated(err.to_string()),
            JobError::NotFound(id) => ConveyorError::not_found("Job", id),
            JobError::Configuration(msg) => ConveyorError::Configuration(msg),
            JobError::Redis(_) | JobError::Pool(_) | JobError::Store(_) => {
                ConveyorError::JobStore(err.to_string())
            }
            JobError::Timeout(_) => ConveyorError::Timeout(err.to_string()),
            other => ConveyorError::Internal(other.to_string()),
        }
    }
}

/// How a processor failure should be handled by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessErrorKind {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; dead-letter immediately.
    Permanent,
}

/// Classified failure reported by a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessError {
    pub kind: ProcessErrorKind,
    pub message: String,
    /// Dependency that caused the failure, when the processor knows it.
    pub dependency: Option<String>,
}

impl ProcessError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProcessErrorKind::Transient,
            message: message.into(),
            dependency: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProcessErrorKind::Permanent,
            message: message.into(),
            dependency: None,
        }
    }

    /// Attributes the failure to one dependency key.
    pub fn with_dependency(mut self, key: impl Into<String>) -> Self {
        self.dependency = Some(key.into());
        self
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == ProcessErrorKind::Permanent
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dependency {
            Some(dependency) => write!(f, "{} ({})", self.message, dependency),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ProcessError {}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[derive(Validate)]
    struct SignupForm {
        #[validate(email)]
        to: String,
    }

    #[test]
    fn test_validation_errors_render_field_names() {
        let errors = SignupForm {
            to: "not-an-email".into(),
        }
        .validate()
        .unwrap_err();
        match JobError::from(errors) {
            JobError::Validation(msg) => assert!(msg.starts_with("to:")),
            other => panic!("Expected Validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_queue_saturated_display() {
        let err = JobError::QueueSaturated {
            queue: "email".into(),
            depth: 10,
            limit: 10,
        };
        let msg = err.to_string();
        assert!(msg.contains("email") && msg.contains("10"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_not_retryable_validation() {
        assert!(!JobError::Validation("to: email".into()).is_retryable());
        assert!(!JobError::NotFound("job-1".into()).is_retryable());
    }

    #[test]
    fn test_into_conveyor_error() {
        let err: ConveyorError = JobError::QueueSaturated {
            queue: "email".into(),
            depth: 3,
            limit: 3,
        }
        .into();
        assert_eq!(err.error_code(), "QUEUE_SATURATED");

        let err: ConveyorError = JobError::Store("lost connection".into()).into();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_process_error_builders() {
        let err = ProcessError::transient("connection reset").with_dependency("smtp:primary");
        assert!(!err.is_permanent());
        assert_eq!(err.dependency.as_deref(), Some("smtp:primary"));
        assert_eq!(err.to_string(), "connection reset (smtp:primary)");

        let err = ProcessError::permanent("template not found");
        assert!(err.is_permanent());
        assert_eq!(err.to_string(), "template not found");
    }
}
