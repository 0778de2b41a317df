//! Application-wide error types.

use thiserror::Error;

use crate::steps::{CurrentStep, Step};

#[derive(Debug, Error)]
pub enum OriginationError {
    #[error("Invalid step identifier: {0}")]
    InvalidStep(String),

    #[error("Invalid contract reference: {0}")]
    InvalidContractReference(i64),

    #[error("Contract not found: {0}")]
    ContractNotFound(String),

    #[error("Application progress not found: {0}")]
    ProgressNotFound(i64),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Vendor error ({vendor}): {message}")]
    Vendor {
        vendor: &'static str,
        message: String,
    },

    #[error("Step {step} was only partially committed (rolled back: {rolled_back}): {reason}")]
    PartialStepCommit {
        step: Step,
        rolled_back: bool,
        reason: String,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The user must correct the input.
    Validation,
    /// A third-party service failed; the step did not advance.
    Vendor,
    /// Contract and progress may disagree.
    Consistency,
    /// The contract or row does not exist.
    NotFound,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Vendor => "vendor",
            Self::Consistency => "consistency",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

impl OriginationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStep(_)
            | Self::InvalidContractReference(_)
            | Self::Validation(_)
            | Self::IllegalTransition { .. }
            | Self::Unauthorized(_) => ErrorKind::Validation,
            Self::Vendor { .. } | Self::Http(_) => ErrorKind::Vendor,
            Self::PartialStepCommit { .. } => ErrorKind::Consistency,
            Self::ContractNotFound(_) | Self::ProgressNotFound(_) => ErrorKind::NotFound,
            Self::Database(_) | Self::Migrate(_) | Self::Json(_) | Self::Config(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// `true` when repeating the same request may succeed; `false` when the
    /// caller must correct input or reload the application first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Vendor { .. } | Self::Http(_) | Self::Database(_) => true,
            // A rolled-back saga left both records untouched.
            Self::PartialStepCommit { rolled_back, .. } => *rolled_back,
            _ => false,
        }
    }

    pub(crate) fn vendor(vendor: &'static str, message: impl Into<String>) -> Self {
        Self::Vendor {
            vendor,
            message: message.into(),
        }
    }

    pub(crate) fn illegal(from: CurrentStep, to: impl ToString) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OriginationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_commit_is_retryable_only_after_rollback() {
        let rolled_back = OriginationError::PartialStepCommit {
            step: Step::Kyc,
            rolled_back: true,
            reason: "timeout".into(),
        };
        let diverged = OriginationError::PartialStepCommit {
            step: Step::Kyc,
            rolled_back: false,
            reason: "timeout".into(),
        };
        assert_eq!(rolled_back.kind(), ErrorKind::Consistency);
        assert!(rolled_back.is_retryable());
        assert!(!diverged.is_retryable());
    }

    #[test]
    fn vendor_errors_are_retryable() {
        let err = OriginationError::vendor("kyc", "503");
        assert_eq!(err.kind(), ErrorKind::Vendor);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Vendor error (kyc): 503");
    }

    #[test]
    fn invalid_step_is_a_validation_error() {
        let err = OriginationError::InvalidStep("shipping".into());
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!err.is_retryable());
    }
}
