//! Engine error taxonomy.
//!
//! | variant      | origin                                    | handling                 |
//! |--------------|-------------------------------------------|--------------------------|
//! | `Network`    | transport failure, 5xx, 408, 429          | queue flag, retry later  |
//! | `Validation` | 4xx while online, foreground call         | returned to the caller   |
//! | `Decode`     | server payload fails the type guard       | keep local copy, report  |
//! | `Rejected`   | 4xx for a flag replayed in the background | flag kept, dismissible   |
//! | `StuckFlag`  | flag failed `stuck_after_attempts` times  | dismissible by the user  |

use brewline_core::{EntityKind, Identifier, MergeError, SyncFlag};
use thiserror::Error;

use crate::remote::RemoteError;
use crate::storage::StoreError;

/// How loudly an error should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Log only.
    Low,
    /// Log and show passively.
    Moderate,
    /// Surface to the user.
    High,
}

#[derive(Error, Debug)]
pub enum SyncEngineError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server rejected request ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("Malformed {kind} payload from server: {reason}")]
    Decode { kind: EntityKind, reason: String },

    #[error("Server rejected {flag}: {message}")]
    Rejected { flag: SyncFlag, message: String },

    #[error("Sync flag stuck after {attempts} attempts: {flag}")]
    StuckFlag { flag: SyncFlag, attempts: u32 },

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Image error: {0}")]
    Image(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Identifier },

    #[error("Flush already in progress for {0}")]
    FlushInProgress(EntityKind),

    #[error("Invalid partial update: {0}")]
    InvalidPartial(#[from] MergeError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncEngineError {
    /// Transient errors are retried from the sync queue and never surface
    /// synchronously.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncEngineError::Network(_))
    }

    pub fn severity(&self) -> Severity {
        match self {
            SyncEngineError::Network(_) | SyncEngineError::FlushInProgress(_) => Severity::Low,
            SyncEngineError::Decode { .. } | SyncEngineError::Image(_) => Severity::Moderate,
            SyncEngineError::Validation { .. }
            | SyncEngineError::Rejected { .. }
            | SyncEngineError::StuckFlag { .. }
            | SyncEngineError::Storage(_)
            | SyncEngineError::NotFound { .. }
            | SyncEngineError::InvalidPartial(_)
            | SyncEngineError::Config(_) => Severity::High,
        }
    }
}

impl From<RemoteError> for SyncEngineError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Transport(msg) => SyncEngineError::Network(msg),
            RemoteError::Status { status, body } if is_retryable_status(status) => {
                SyncEngineError::Network(format!("HTTP {status}: {body}"))
            }
            RemoteError::Status { status, body } => SyncEngineError::Validation {
                status,
                message: body,
            },
            RemoteError::Body { kind, reason } => SyncEngineError::Decode { kind, reason },
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

pub type Result<T> = std::result::Result<T, SyncEngineError>;
