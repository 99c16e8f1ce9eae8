use thiserror::Error;

use crate::context::Step;
use crate::workflow::WorkflowState;

/// Errors surfaced by the screening workflow and its collaborators.
///
/// Local validation variants never reach the network. Service and transport
/// variants are recoverable by retrying the same step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScreeningError {
    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Question source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("All questions must be answered before submitting")]
    IncompleteAnswers { missing: Vec<String> },

    #[error("Unknown question: {0}")]
    UnknownQuestion(String),

    #[error("Questionnaire submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("No analysis result to select from")]
    NoActiveResult,

    #[error("Select at least one similar case")]
    EmptySelection,

    #[error("No image provided")]
    MissingImage,

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("{message}")]
    ServiceError { status: u16, message: String },

    #[error("Request failed: {0}")]
    TransportError(String),

    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        state: WorkflowState,
        action: &'static str,
    },

    #[error("{0} already in progress")]
    StepInProgress(Step),

    #[error("Request cancelled by session change")]
    Cancelled,

    #[error("Credential storage error: {0}")]
    CredentialStore(String),
}

impl ScreeningError {
    /// Stable machine-readable name, used by the HTTP surface.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::SourceUnavailable(_) => "source_unavailable",
            Self::IncompleteAnswers { .. } => "incomplete_answers",
            Self::UnknownQuestion(_) => "unknown_question",
            Self::SubmissionRejected(_) => "submission_rejected",
            Self::NoActiveResult => "no_active_result",
            Self::EmptySelection => "empty_selection",
            Self::MissingImage => "missing_image",
            Self::InvalidRegistration(_) => "invalid_registration",
            Self::ServiceError { .. } => "service_error",
            Self::TransportError(_) => "transport_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::StepInProgress(_) => "step_in_progress",
            Self::Cancelled => "cancelled",
            Self::CredentialStore(_) => "credential_store",
        }
    }

    /// True for failures detected before any request was sent.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::Unauthenticated
                | Self::IncompleteAnswers { .. }
                | Self::UnknownQuestion(_)
                | Self::NoActiveResult
                | Self::EmptySelection
                | Self::MissingImage
                | Self::InvalidRegistration(_)
                | Self::InvalidTransition { .. }
                | Self::StepInProgress(_)
        )
    }

    /// True when sending the same step again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceError { .. } | Self::TransportError(_))
    }
}

pub type Result<T> = std::result::Result<T, ScreeningError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_remote_failures_are_retryable() {
        assert!(ScreeningError::TransportError("timed out".into()).is_retryable());
        assert!(
            ScreeningError::ServiceError {
                status: 500,
                message: "Model not loaded".into()
            }
            .is_retryable()
        );
        assert!(!ScreeningError::EmptySelection.is_retryable());
        assert!(!ScreeningError::Cancelled.is_retryable());
        assert!(!ScreeningError::Unauthenticated.is_retryable());
    }
}
