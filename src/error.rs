//! Error types for span-zip

use std::io;
use std::path::PathBuf;

/// Result type for span-zip operations
pub type Result<T> = std::result::Result<T, SpanZipError>;

/// Error types that can occur while writing an archive
///
/// Nothing is retried internally. After an `Io` error the archive on disk is in
/// an undefined state and the writer must be abandoned.
#[derive(Debug, thiserror::Error)]
pub enum SpanZipError {
    /// I/O error from the file system (write, rotate, rename, close)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid entry or archive configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Declared source file is missing or unreadable
    #[error("Source unavailable: {}: {source}", path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Cipher operation called outside the mode that supports it
    #[error("Encryption mode error: {0}")]
    EncryptionMode(String),

    /// Key setup or random number generation failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Deflate engine failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Writer API called out of order
    #[error("Invalid writer state: {0}")]
    InvalidState(String),
}

impl SpanZipError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SpanZipError::Config(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        SpanZipError::InvalidState(msg.into())
    }
}
