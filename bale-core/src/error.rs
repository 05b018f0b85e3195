//! Error types for the bale storage engine

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Engine-wide error type
///
/// The taxonomy is deliberately small:
///
/// - [`Error::Storage`] / [`Error::NotFound`] are transport errors from the
///   collaborator blob store, propagated unchanged — this layer never retries
///   implicitly.
/// - [`Error::Decode`] is corruption: an unexpected type-id byte, a truncated
///   header, a reference index out of range. Not recoverable locally.
/// - [`Error::Usage`] indicates a programming error (appending to a finalized
///   tree, a file/directory name collision, writing through a closed writer).
#[derive(Error, Debug)]
pub enum Error {
    /// Transport error from the collaborator blob store
    #[error("storage error: {0}")]
    Storage(String),

    /// Blob or ref does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Corrupt or truncated wire data
    #[error("decode error: {0}")]
    Decode(String),

    /// Caller misuse; indicates a bug, not a runtime condition
    #[error("usage error: {0}")]
    Usage(String),

    /// I/O failure: zstd (de)compression or a caller-supplied output stream
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// Results are broadcast to coalesced waiters on the single-flight read path,
// so errors must be duplicable. io::Error is not Clone; reproduce it from its
// kind and message.
impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Storage(msg) => Error::Storage(msg.clone()),
            Error::NotFound(msg) => Error::NotFound(msg.clone()),
            Error::Decode(msg) => Error::Decode(msg.clone()),
            Error::Usage(msg) => Error::Usage(msg.clone()),
            Error::Io(err) => Error::Io(std::io::Error::new(err.kind(), err.to_string())),
        }
    }
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Create a usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }
}
