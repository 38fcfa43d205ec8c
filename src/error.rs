//! Error types for apply-forge operations.
//!
//! Defines the error taxonomy shared by every pipeline stage:
//! - The four failure categories used for recovery decisions
//! - Errors raised by external collaborators (search, matching, submission, auth)
//! - Contract violations detected at stage boundaries
//! - The `StageFailure` value handed to the recovery manager

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::Stage;

/// Failure category driving retry policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network or storage infrastructure failure.
    System,
    /// Malformed or contract-violating data.
    Business,
    /// Collaborator failure or timeout.
    ExternalService,
    /// Memory, disk or quota exhaustion.
    Resource,
}

impl ErrorCategory {
    /// Every category, in declaration order.
    pub const ALL: [ErrorCategory; 4] = [
        ErrorCategory::System,
        ErrorCategory::Business,
        ErrorCategory::ExternalService,
        ErrorCategory::Resource,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::System => "system",
            ErrorCategory::Business => "business",
            ErrorCategory::ExternalService => "external_service",
            ErrorCategory::Resource => "resource",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by external collaborators.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{operation} timed out after {seconds} seconds")]
    Timeout { operation: String, seconds: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Collaborator returned status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid collaborator response: {0}")]
    InvalidResponse(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl CollaboratorError {
    /// Category implied by the error itself, if any.
    ///
    /// Errors without an implied category are left to the configured
    /// classification rules.
    pub fn category_hint(&self) -> Option<ErrorCategory> {
        match self {
            CollaboratorError::Timeout { .. } => Some(ErrorCategory::System),
            CollaboratorError::Transport(_) => Some(ErrorCategory::System),
            CollaboratorError::ResourceExhausted(_) => Some(ErrorCategory::Resource),
            CollaboratorError::Rejected { status, .. } if *status == 429 || *status >= 500 => {
                Some(ErrorCategory::ExternalService)
            }
            _ => None,
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CollaboratorError::Timeout {
                operation: "HTTP request".to_string(),
                seconds: 0,
            }
        } else if e.is_decode() {
            CollaboratorError::InvalidResponse(e.to_string())
        } else {
            CollaboratorError::Transport(e.to_string())
        }
    }
}

/// Errors raised while validating or normalizing a payload at a stage boundary.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Contract violation entering '{stage}': missing field '{field}'")]
    ContractViolation { stage: Stage, field: String },

    #[error("Criterion '{criterion}' out of range: {value}")]
    OutOfRange { criterion: String, value: f64 },

    #[error("Unknown currency '{0}'")]
    UnknownCurrency(String),

    #[error("Normalization failed: {0}")]
    Normalization(String),
}

/// A failure observed while an item was in a stage.
///
/// `hint` carries the category when the failing layer knows it; otherwise the
/// classifier's rule set decides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
    pub hint: Option<ErrorCategory>,
}

impl StageFailure {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, category: ErrorCategory) -> Self {
        self.hint = Some(category);
        self
    }

    pub fn from_collaborator(stage: Stage, err: &CollaboratorError) -> Self {
        Self {
            stage,
            message: err.to_string(),
            hint: err.category_hint(),
        }
    }

    /// Contract violations always indicate bad input.
    pub fn from_bridge(stage: Stage, err: &BridgeError) -> Self {
        Self::new(stage, err.to_string()).with_hint(ErrorCategory::Business)
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}
