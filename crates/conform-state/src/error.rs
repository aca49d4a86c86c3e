//! Error types for conform-state

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the ledger layer
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Filesystem error while reading or appending
    #[error("ledger I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Entry could not be serialized
    #[error("ledger serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted line is not a valid entry
    #[error("corrupt ledger entry at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },

    /// Digest string is not 64 lowercase hex chars
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },
}

/// Result type for ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;
