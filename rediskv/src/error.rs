//! Error types for rediskv operations.

use common::StorageError;

/// Error type for rediskv operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A single-key read found no entry. Expected and recoverable.
    NotFound(String),

    /// Bad location, batch size or range options. Raised before any
    /// network call.
    InvalidArgument(String),

    /// A batch contained an operation kind this store does not support.
    /// Nothing from the batch was applied.
    UnsupportedOperation(String),

    /// Transport failure while talking to the backing server.
    Connection(String),

    /// The store or its connection was already closed.
    Closed,

    /// Internal errors indicating bugs or invariant violations.
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::UnsupportedOperation(msg) => write!(f, "Unsupported operation: {}", msg),
            Error::Connection(msg) => write!(f, "Connection error: {}", msg),
            Error::Closed => write!(f, "Store is closed"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Connection(msg) => Error::Connection(msg),
            StorageError::Closed => Error::Closed,
            StorageError::InvalidInput(msg) => Error::InvalidArgument(msg),
            StorageError::Internal(msg) => Error::Internal(msg),
        }
    }
}

/// Result type alias for rediskv operations.
pub type Result<T> = std::result::Result<T, Error>;
