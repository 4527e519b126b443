//! Error types for workitem-rs.
//!
//! Every store and validator call returns a typed [`Error`]. Callers that
//! need to turn an error into a caller-visible failure code classify it
//! with [`Error::kind`] and look the kind up in
//! [`crate::response::FAILURE_CODES`].

use thiserror::Error;

use crate::model::WorkitemState;
use crate::response::FailureCode;

#[derive(Debug, Error)]
pub enum Error {
    #[error("workitem not found: {0}")]
    NotFound(String),

    #[error("workitem already exists: {0}")]
    AlreadyExists(String),

    /// The stored state or transaction UID no longer matches what the
    /// caller read; somebody else won the race.
    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: WorkitemState,
        to: WorkitemState,
    },

    #[error("update not allowed: {0}")]
    UpdateNotAllowed(String),

    #[error("{message}")]
    Validation { code: FailureCode, message: String },

    #[error("unsupported schema version: {0}")]
    UnsupportedSchemaVersion(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("an outcome has already been recorded for this request")]
    OutcomeAlreadyRecorded,

    #[error("no outcome was recorded before building the response")]
    OutcomeNotRecorded,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used to pick a failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Conflict,
    Validation,
    UpdateNotAllowed,
    /// Store unavailable, corrupt data, misconfiguration, programming errors.
    Infrastructure,
}

impl Error {
    /// Shorthand for a payload validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            code: FailureCode::ValidationFailure,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::InvalidTransition { .. } | Error::UpdateNotAllowed(_) => {
                ErrorKind::UpdateNotAllowed
            }
            Error::Validation { .. } | Error::UnsupportedMediaType(_) => ErrorKind::Validation,
            _ => ErrorKind::Infrastructure,
        }
    }

    /// Failure code reported to the caller for this error.
    ///
    /// Validators carry their own code; everything else goes through the
    /// kind lookup table.
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Error::Validation { code, .. } => *code,
            other => crate::response::failure_code_for(other.kind()),
        }
    }
}
