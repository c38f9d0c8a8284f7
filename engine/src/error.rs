//! Error types for the Postsync engine.

use crate::RecordId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All possible errors from the engine and its collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Intent errors, rejected before anything is queued
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    // Local persistence
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    // Remote gateway
    #[error("network error: {0}")]
    Network(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("not found on server: {0}")]
    NotFound(RecordId),

    #[error("rejected by server: {0}")]
    Rejected(String),
}

impl Error {
    /// The observable category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::RecordNotFound(_) => ErrorKind::Validation,
            Error::StoreUnavailable(_) | Error::InvalidSnapshot(_) => ErrorKind::StoreUnavailable,
            Error::Network(_) => ErrorKind::Network,
            Error::Server { .. } => ErrorKind::Server,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Rejected(_) => ErrorKind::Rejected,
        }
    }

    /// Whether the same call may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Server { .. })
    }
}

/// Error categories exposed to the presentation layer through `SyncStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Validation,
    StoreUnavailable,
    Network,
    Server,
    NotFound,
    Rejected,
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
