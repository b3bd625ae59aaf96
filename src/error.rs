use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// How a failure should be handled by whoever receives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input. The caller must fix it; retrying is pointless.
    Validation,
    /// An external job could not be created. Only the unsubmitted remainder is retried.
    Submission,
    /// A collaborator was momentarily unreachable. The next poll tick retries.
    TransientExternal,
    /// The transfer service gave up on a file or job for good.
    TerminalFileFailure,
    /// Local storage or bookkeeping failure.
    Internal,
}

#[derive(Debug, Error, Diagnostic)]
pub enum DatastoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transfer payload for {location} is {bytes} bytes, over the per-job limit of {limit}")]
    PayloadTooLarge {
        location: String,
        bytes: usize,
        limit: usize,
    },

    #[error("cannot accept file of size {size} due to limit of {limit}")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("cannot accept transfer request of total size {size} due to limit of {limit}")]
    TotalSizeExceeded { size: u64, limit: u64 },

    #[error("file not found at {0}")]
    SourceMissing(String),

    #[error("unknown storage endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("invalid storage endpoint {key}: {reason}")]
    InvalidEndpoint { key: String, reason: String },

    #[error("missing config file datastore.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("request not found: {0}")]
    RequestNotFound(String),

    #[error("{0}")]
    RetryNotPossible(String),

    #[error("catalogue unavailable: {0}")]
    CatalogueUnavailable(String),

    #[error("catalogue returned status {status}: {message}")]
    CatalogueStatus { status: u16, message: String },

    #[error("catalogue conflict: {0}")]
    CatalogueConflict(String),

    #[error("catalogue entity not found: {0}")]
    CatalogueNotFound(String),

    #[error("transfer service unavailable: {0}")]
    TransferServiceUnavailable(String),

    #[error("transfer service returned status {status}: {message}")]
    TransferStatus { status: u16, message: String },

    #[error("transfer job not found: {0}")]
    JobNotFound(String),

    #[error("transfer service rejected job submission: {0}")]
    SubmissionRejected(String),

    #[error("transfer service refused a job of {files} files as too large")]
    RequestTooLarge { files: usize },

    #[error("request {request_id} changed concurrently (expected version {expected}, found {found})")]
    VersionConflict {
        request_id: String,
        expected: u64,
        found: u64,
    },

    #[error("transfer jobs {jobs} of request {request_id} were submitted but not recorded: {reason}")]
    JobsNotRecorded {
        request_id: String,
        jobs: String,
        reason: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl DatastoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DatastoreError::InvalidRequest(_)
            | DatastoreError::PayloadTooLarge { .. }
            | DatastoreError::FileTooLarge { .. }
            | DatastoreError::TotalSizeExceeded { .. }
            | DatastoreError::SourceMissing(_)
            | DatastoreError::UnknownEndpoint(_)
            | DatastoreError::InvalidEndpoint { .. }
            | DatastoreError::MissingConfig
            | DatastoreError::ConfigRead(_)
            | DatastoreError::ConfigParse(_)
            | DatastoreError::InvalidConfig(_)
            | DatastoreError::RequestNotFound(_)
            | DatastoreError::RetryNotPossible(_)
            | DatastoreError::CatalogueNotFound(_) => ErrorCategory::Validation,
            DatastoreError::SubmissionRejected(_)
            | DatastoreError::RequestTooLarge { .. }
            | DatastoreError::CatalogueConflict(_) => ErrorCategory::Submission,
            DatastoreError::CatalogueUnavailable(_)
            | DatastoreError::CatalogueStatus { .. }
            | DatastoreError::TransferServiceUnavailable(_)
            | DatastoreError::TransferStatus { .. }
            | DatastoreError::VersionConflict { .. } => ErrorCategory::TransientExternal,
            DatastoreError::JobNotFound(_) => ErrorCategory::TerminalFileFailure,
            DatastoreError::JobsNotRecorded { .. } | DatastoreError::Filesystem(_) => {
                ErrorCategory::Internal
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::TransientExternal
    }
}
