//! Error types for the ops copilot orchestrator

use crate::models::ActionState;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Pipeline Errors
    // =============================

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    #[error("Generation unavailable: {0}")]
    GenerationUnavailable(String),

    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("Invalid action parameters: {0}")]
    InvalidActionParameters(String),

    /// Soft failure: recorded in the decision log, never propagated.
    #[error("Grounding failure: {0}")]
    GroundingFailure(String),

    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    // =============================
    // Action Lifecycle Errors
    // =============================

    #[error("Invalid action transition: {from} -> {to}")]
    InvalidTransition { from: ActionState, to: ActionState },

    #[error("Action request not found: {0}")]
    ActionNotFound(Uuid),

    #[error("Action request superseded: {0}")]
    ActionSuperseded(Uuid),

    #[error("Action dispatch failed: {0}")]
    DispatchFailed(String),

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),
}

/// Coarse classification of a failure, exposed to the UI collaborator.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RetrievalUnavailable,
    GenerationUnavailable,
    UnsupportedAction,
    InvalidActionParameters,
    GroundingFailure,
    Cancelled,
    Internal,
}

impl OrchestrationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RetrievalUnavailable(_) => FailureKind::RetrievalUnavailable,
            Self::GenerationUnavailable(_) => FailureKind::GenerationUnavailable,
            Self::UnsupportedAction(_) => FailureKind::UnsupportedAction,
            Self::InvalidActionParameters(_) => FailureKind::InvalidActionParameters,
            Self::GroundingFailure(_) => FailureKind::GroundingFailure,
            Self::Cancelled(_) => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        }
    }

    /// Index or generation unreachable. These halt the pipeline.
    pub fn is_service_failure(&self) -> bool {
        matches!(
            self,
            Self::RetrievalUnavailable(_) | Self::GenerationUnavailable(_)
        )
    }

    /// The single message shown to the user when a stage halts the pipeline.
    pub fn user_message(&self) -> String {
        match self {
            Self::RetrievalUnavailable(_) => {
                "The document index is currently unavailable. Please try again shortly."
                    .to_string()
            }
            Self::GenerationUnavailable(_) => {
                "The answer service is currently unavailable. Please try again shortly."
                    .to_string()
            }
            Self::UnsupportedAction(verb) => format!(
                "'{}' is not a supported action. Supported actions: pause, unpause, update hours.",
                verb
            ),
            Self::InvalidActionParameters(detail) => {
                format!("The action could not be prepared: {}", detail)
            }
            other => format!("The request could not be completed: {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_failures_are_classified() {
        assert!(OrchestrationError::RetrievalUnavailable("down".into()).is_service_failure());
        assert!(OrchestrationError::GenerationUnavailable("down".into()).is_service_failure());
        assert!(!OrchestrationError::UnsupportedAction("delete".into()).is_service_failure());
        assert!(!OrchestrationError::GroundingFailure("low".into()).is_service_failure());
    }

    #[test]
    fn test_user_message_hides_internal_detail() {
        let err = OrchestrationError::RetrievalUnavailable("connection refused 10.0.0.3".into());
        let msg = err.user_message();
        assert!(!msg.contains("10.0.0.3"));
        assert_eq!(err.kind(), FailureKind::RetrievalUnavailable);
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = OrchestrationError::InvalidTransition {
            from: ActionState::Pending,
            to: ActionState::Dispatched,
        };
        assert_eq!(err.to_string(), "Invalid action transition: pending -> dispatched");
    }
}
