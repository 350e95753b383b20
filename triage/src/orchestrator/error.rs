//! Orchestrator error types
//!
//! Everything the triage engine surfaces to callers. Rejected proofs are
//! not errors; they come back as a [`ProofOutcome`](super::ProofOutcome).

use thiserror::Error;

use crate::config::ConfigError;
use crate::dedup::DedupError;
use crate::feedback::FeedbackError;
use crate::model::{Category, ImageRejection, IssueId, ReportId};
use crate::registry::{IssueState, RegistryError, SnapshotError};
use crate::verifier::VerifierError;

/// Result type alias for orchestrator operations
pub type TriageResult<T> = Result<T, TriageError>;

#[derive(Error, Debug)]
pub enum TriageError {
    #[error("Issue not found: {0}")]
    NotFound(IssueId),

    #[error("Issue {issue_id} is {state}; expected {expected}")]
    WrongState {
        issue_id: IssueId,
        state: IssueState,
        expected: String,
    },

    #[error("Issue {issue_id} is already terminal ({state})")]
    AlreadyTerminal { issue_id: IssueId, state: IssueState },

    #[error("Invalid transition for issue {issue_id}: {from} -> {to}")]
    InvalidTransition {
        issue_id: IssueId,
        from: IssueState,
        to: IssueState,
    },

    #[error("Issue {0} cannot close without an accepted resolution proof")]
    ClosureWithoutProof(IssueId),

    #[error("Report {report_id} was already accepted into issue {issue_id}")]
    ReportAlreadyAccepted {
        report_id: ReportId,
        issue_id: IssueId,
    },

    #[error("Invalid proof image: {0}")]
    InvalidProofImage(ImageRejection),

    #[error("Visual comparison unavailable: {0}")]
    ComparisonUnavailable(String),

    #[error("Unknown category: {0}")]
    UnknownCategory(Category),

    #[error("Invalid feedback: {0}")]
    InvalidFeedback(#[from] FeedbackError),

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Dedup index error: {0}")]
    Index(#[from] DedupError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TriageError {
    /// Create a validation error (for invalid input parameters)
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::WrongState { .. } => "WRONG_STATE",
            Self::AlreadyTerminal { .. } => "ALREADY_TERMINAL",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ClosureWithoutProof(_) => "CLOSURE_WITHOUT_PROOF",
            Self::ReportAlreadyAccepted { .. } => "REPORT_ALREADY_ACCEPTED",
            Self::InvalidProofImage(_) => "INVALID_PROOF_IMAGE",
            Self::ComparisonUnavailable(_) => "COMPARISON_UNAVAILABLE",
            Self::UnknownCategory(_) => "UNKNOWN_CATEGORY",
            Self::InvalidFeedback(_) => "INVALID_FEEDBACK",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Index(_) => "INDEX_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Snapshot(_) => "SNAPSHOT_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether resubmitting the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ComparisonUnavailable(_))
    }
}

impl From<RegistryError> for TriageError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => Self::NotFound(id),
            RegistryError::WrongState {
                issue_id,
                state,
                expected,
            } => Self::WrongState {
                issue_id,
                state,
                expected,
            },
            RegistryError::AlreadyTerminal { issue_id, state } => {
                Self::AlreadyTerminal { issue_id, state }
            }
            RegistryError::InvalidTransition { issue_id, from, to } => {
                Self::InvalidTransition { issue_id, from, to }
            }
            RegistryError::ClosureWithoutProof(id) => Self::ClosureWithoutProof(id),
            RegistryError::ReportAlreadyAssigned {
                report_id,
                issue_id,
            } => Self::ReportAlreadyAccepted {
                report_id,
                issue_id,
            },
            other @ (RegistryError::DuplicateIssue(_)
            | RegistryError::NoContributors(_)
            | RegistryError::LockPoisoned) => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<VerifierError> for TriageError {
    fn from(err: VerifierError) -> Self {
        match err {
            VerifierError::InvalidImage(rejection) => Self::InvalidProofImage(rejection),
            other => Self::ComparisonUnavailable(other.to_string()),
        }
    }
}
