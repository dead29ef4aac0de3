//! Validation utilities.

use crate::{ConveyorError, FieldError};
use validator::{Validate, ValidationErrors};

/// Extension trait for validation.
pub trait ValidateExt: Validate {
    /// Validates the struct and returns a `ConveyorError` on failure.
    fn validate_request(&self) -> Result<(), ConveyorError> {
        self.validate().map_err(validation_errors_to_conveyor_error)
    }
}

impl<T: Validate> ValidateExt for T {}

/// Flattens `validator::ValidationErrors` into field errors.
#[must_use]
pub fn field_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, errors)| {
            errors.iter().map(move |error| FieldError {
                field: (*field).to_string(),
                message: error
                    .message
                    .as_ref()
                    .map_or_else(|| error.code.to_string(), |m| m.to_string()),
                code: error.code.to_string(),
            })
        })
        .collect()
}

/// Renders validation errors as `field: message; field: message`.
#[must_use]
pub fn render_validation_errors(errors: &ValidationErrors) -> String {
    let mut rendered: Vec<String> = field_errors(errors)
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect();
    rendered.sort();
    rendered.join("; ")
}

/// Converts `validator::ValidationErrors` to `ConveyorError`.
#[must_use]
pub fn validation_errors_to_conveyor_error(errors: ValidationErrors) -> ConveyorError {
    ConveyorError::Validation(render_validation_errors(&errors))
}

/// Common validation functions.
pub mod rules {
    use validator::ValidationError;

    /// Validates that a string is not blank (not empty after trimming).
    pub fn not_blank(value: &str) -> Result<(), ValidationError> {
        if value.trim().is_empty() {
            return Err(ValidationError::new("not_blank"));
        }
        Ok(())
    }

    /// Validates that every entry of a list is non-blank.
    pub fn no_blank_entries(values: &[String]) -> Result<(), ValidationError> {
        if values.iter().any(|v| v.trim().is_empty()) {
            return Err(ValidationError::new("blank_entry"));
        }
        Ok(())
    }

    /// Validates a dependency key of the form `system:instance`.
    pub fn dependency_key(key: &str) -> Result<(), ValidationError> {
        let Some((system, instance)) = key.split_once(':') else {
            return Err(ValidationError::new("dependency_key_format"));
        };
        let valid_part = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        };
        if !valid_part(system) || !valid_part(instance) {
            return Err(ValidationError::new("dependency_key_format"));
        }
        Ok(())
    }

    /// Validates a URL with an http(s) scheme.
    pub fn http_url(value: &str) -> Result<(), ValidationError> {
        if value.starts_with("http://") || value.starts_with("https://") {
            Ok(())
        } else {
            Err(ValidationError::new("http_url"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::rules::*;
    use super::*;

    #[derive(Validate)]
    struct SignupForm {
        #[validate(length(min = 1, message = "must not be empty"))]
        name: String,
    }

    #[test]
    fn test_not_blank() {
        assert!(not_blank("hello").is_ok());
        assert!(not_blank("   ").is_err());
        assert!(not_blank("").is_err());
    }

    #[test]
    fn test_no_blank_entries() {
        assert!(no_blank_entries(&["a".to_string(), "b".to_string()]).is_ok());
        assert!(no_blank_entries(&["a".to_string(), " ".to_string()]).is_err());
    }

    #[test]
    fn test_dependency_key() {
        assert!(dependency_key("smtp:primary").is_ok());
        assert!(dependency_key("push:fcm").is_ok());
        assert!(dependency_key("moderation:api").is_ok());
        assert!(dependency_key("smtp").is_err());
        assert!(dependency_key(":primary").is_err());
        assert!(dependency_key("smtp:pri mary").is_err());
    }

    #[test]
    fn test_http_url() {
        assert!(http_url("https://cdn.example.com/a.mp4").is_ok());
        assert!(http_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_validate_request_renders_fields() {
        let err = SignupForm { name: String::new() }.validate_request().unwrap_err();
        match err {
            ConveyorError::Validation(msg) => assert_eq!(msg, "name: must not be empty"),
            other => panic!("Expected validation error, got {other:?}"),
        }
    }
}
