//! Error types for jobs, collaborators and the batch controller.

use crate::domain::jobs::BatchState;
use serde::Serialize;
use thiserror::Error;

/// Result type returned by the batch controller.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned to the caller at the session boundary.
#[derive(Error, Debug)]
pub enum Error {
    #[error("No batch for session {0}")]
    NoBatch(String),

    #[error("Batch is {actual}, expected {expected}")]
    InvalidState {
        expected: BatchState,
        actual: BatchState,
    },

    #[error("A batch is already running for session {0}")]
    BatchBusy(String),

    #[error("Batch has no jobs")]
    EmptyBatch,

    #[error("Invalid encode parameters: {0}")]
    InvalidParameters(#[from] ParameterError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a job ended without producing an output.
///
/// Payloads are plain strings so the error can live inside cloned job
/// records and be shown to the user verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Cancelled")]
    Cancelled,
}

impl JobError {
    /// Cancellation is a forced terminal state, not a failure to report.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

/// Failure reported by the download collaborator.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Unsupported source: {0}")]
    Unsupported(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Transient(_))
    }
}

impl From<DownloadError> for JobError {
    fn from(err: DownloadError) -> Self {
        JobError::Download(err.to_string())
    }
}

/// The notification sink refused a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Unknown message {0}")]
    UnknownMessage(u64),

    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// User parameters that cannot be split into an argument vector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParameterError {
    #[error("unterminated {0} quote")]
    UnterminatedQuote(char),

    #[error("trailing backslash")]
    TrailingEscape,
}
