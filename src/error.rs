//! Error types for gridmatch operations.
//!
//! Defines the error taxonomy shared by the scheduler components:
//! - Requirement and capability validation
//! - External collaborator (configuration, accounting) failures
//! - Scheduler-level outcomes (contention exhaustion, storage failures)
//!
//! Storage errors live next to the stores in [`crate::storage`].

use std::time::Duration;

use thiserror::Error;

use crate::storage::StoreError;

/// Errors raised while validating job requirements or resource capabilities.
///
/// Validation always happens before any store access and is never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Field '{0}' must not be empty")]
    EmptyField(&'static str),

    #[error("List field '{0}' must contain at least one value")]
    EmptyList(&'static str),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Pilot type '{0}' is private and requires the requester identity and group")]
    PrivatePilotWithoutOwner(String),

    #[error("Malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors reported by the external configuration or accounting collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Configuration source unavailable: {0}")]
    ConfigUnavailable(String),

    #[error("Accounting report failed for window of {span:?}: {reason}")]
    ReportFailed { span: Duration, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors surfaced by the scheduler facade to its callers.
///
/// A failed match is not an error; see [`crate::scheduler::MatchOutcome`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Scheduler busy: task queue still contended after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("Collaborator failure: {0}")]
    Collaborator(#[from] CollaboratorError),
}

impl SchedulerError {
    /// Returns true when the caller may retry later without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SchedulerError::Busy { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::MissingField("ownerGroup");
        assert!(err.to_string().contains("ownerGroup"));

        let err = ValidationError::EmptyList("sites");
        assert!(err.to_string().contains("sites"));

        let err = ValidationError::PrivatePilotWithoutOwner("private".to_string());
        assert!(err.to_string().contains("private"));
    }

    #[test]
    fn test_scheduler_error_retryable() {
        assert!(SchedulerError::Busy { attempts: 10 }.is_retryable());
        assert!(!SchedulerError::from(ValidationError::EmptyField("setup")).is_retryable());
        assert!(!SchedulerError::from(StoreError::DuplicateDefinition).is_retryable());
    }

    #[test]
    fn test_collaborator_error_display() {
        let err = CollaboratorError::ReportFailed {
            span: Duration::from_secs(3600),
            reason: "timeout".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("3600"));
        assert!(text.contains("timeout"));
    }
}
