//! Store error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File the operation touched.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },

    /// A stored file does not parse.
    #[error("corrupt store file {path}: {reason}")]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// Parse failure description.
        reason: String,
    },

    /// A channel file name is not a valid peer public key.
    #[error("bad channel file name: {0}")]
    BadFileName(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
