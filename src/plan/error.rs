//! Structured errors for plan construction and reshaping

use thiserror::Error;

/// The plan spec is structurally invalid
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    /// One entry per individual failure
    pub details: Vec<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, details: Vec<String>) -> Self {
        Self {
            message: message.into(),
            details,
        }
    }

    pub fn single(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            message: detail.clone(),
            details: vec![detail],
        }
    }
}

/// A structural edit on a started plan was rejected; the plan is unchanged
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ReshapeError(pub String);
