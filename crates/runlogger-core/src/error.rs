//! Error types for runlogger-core.

use serde_json::Value;
use thiserror::Error;

use crate::models::EntryKind;

/// Failure reported by a backend operation.
///
/// The split decides what the retry loop does: transient failures are
/// retried with backoff, permanent ones surface on the first attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("permanent backend failure: {0}")]
    Permanent(String),
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        BackendError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        BackendError::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum RunLoggerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid sweep state: {0}")]
    InvalidSweepState(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{operation} gave up after {attempts} attempt(s): {last_error}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last_error: BackendError,
    },

    /// The backend refused a batch outright. The rows were taken out of the
    /// buffer so later entries are not held behind them.
    #[error("backend rejected {} {kind} row(s): {error}", .rows.len())]
    BatchRejected {
        kind: EntryKind,
        rows: Vec<Value>,
        error: BackendError,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RunLoggerError {
    /// The backend failure behind this error, if there is one.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            RunLoggerError::Backend(err) => Some(err),
            RunLoggerError::RetryExhausted { last_error, .. } => Some(last_error),
            RunLoggerError::BatchRejected { error, .. } => Some(error),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RunLoggerError>;
