use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;

/// Errors related to communication with the content store.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no such key: '{0}'")]
    NotFound(String),

    #[error("transfer interrupted at {cursor}/{size} bytes: {reason}")]
    TransferInterrupted {
        cursor: u64,
        size: u64,
        reason: String,
    },

    #[error("transfer stalled at {cursor}/{size} bytes for more than {timeout:?}")]
    TransferTimeout {
        cursor: u64,
        size: u64,
        timeout: Duration,
    },

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("internal storage error: {0}")]
    StorageError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<JoinError> for Error {
    fn from(value: JoinError) -> Self {
        Error::StorageError(value.to_string())
    }
}

impl From<object_store::Error> for Error {
    fn from(value: object_store::Error) -> Self {
        match value {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            e => Error::StorageError(e.to_string()),
        }
    }
}

impl From<async_tempfile::Error> for Error {
    fn from(value: async_tempfile::Error) -> Self {
        match value {
            async_tempfile::Error::Io(io_error) => Error::Io(io_error),
            async_tempfile::Error::InvalidFile => {
                Error::StorageError("invalid or missing temporary file".to_string())
            }
            async_tempfile::Error::InvalidDirectory => {
                Error::StorageError("invalid or missing temporary directory".to_string())
            }
        }
    }
}
