//! Error types for dlqueue core

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a transport for a single transfer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("Server error: {status}")]
    Status { status: u16 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    /// Cancellation surfaced by the transport itself
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => TransportError::Status {
                status: status.as_u16(),
            },
            None => TransportError::Network(error.to_string()),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io(error.to_string())
    }
}

/// Errors that can occur in dlqueue core
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Invalid request {id}: missing source locator")]
    InvalidRequest { id: String },

    #[error("Invalid request {id}: {name:?} is not a plain file name")]
    InvalidDestination { id: String, name: String },

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to move download into {path:?}: {source}")]
    Relocation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File system error: {0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Download was cancelled")]
    Cancelled,

    #[error("No async runtime available: {0}")]
    Runtime(String),
}

/// Coarse classification of a [`QueueError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    TransportFailure,
    RelocationFailure,
    FileSystemFailure,
    Cancelled,
    Runtime,
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::InvalidRequest { .. } | QueueError::InvalidDestination { .. } => {
                ErrorKind::InvalidRequest
            }
            QueueError::Transport(_) => ErrorKind::TransportFailure,
            QueueError::Relocation { .. } => ErrorKind::RelocationFailure,
            QueueError::FileSystem(_) => ErrorKind::FileSystemFailure,
            QueueError::Cancelled => ErrorKind::Cancelled,
            QueueError::Runtime(_) => ErrorKind::Runtime,
        }
    }

    /// Errors scoped to one item's lifecycle; these never abort the queue
    pub fn is_item_failure(&self) -> bool {
        matches!(
            self,
            QueueError::Transport(_) | QueueError::Relocation { .. }
        )
    }
}

impl From<QueueError> for String {
    fn from(error: QueueError) -> Self {
        error.to_string()
    }
}
