//! Error types for segue-engine
//!
//! Defines engine error types using thiserror for clear error propagation.

use thiserror::Error;

/// Main error type for the segue engine
#[derive(Error, Debug)]
pub enum Error {
    /// A clip could not be made decode-ready
    #[error("Preload failed for clip {index}: {source}")]
    Preload {
        index: usize,
        #[source]
        source: PreloadError,
    },

    /// A host-owned facility failed (surface, decoder, mixing graph, ...)
    #[error("Host error: {0}")]
    Host(String),

    /// Recording sink failure (unsupported format, encoder fault, ...)
    #[error("Recording sink error: {0}")]
    Sink(String),

    /// Clip payload could not be fetched
    #[error("Fetch failed for {location}: {reason}")]
    Fetch { location: String, reason: String },

    /// Segmented buffer rejected an append after recovery
    #[error("Append failed: {0}")]
    Append(#[from] AppendError),

    /// Session was cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// Finalize was called without any output fragments
    #[error("Nothing to finalize: no output fragments were produced")]
    NothingToFinalize,

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the shared library
    #[error(transparent)]
    Common(#[from] segue_common::Error),
}

impl Error {
    /// Cancellation is a terminal outcome, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Rejection of a preload request
///
/// Cloneable so every waiter deduplicated onto the same clip observes the
/// same outcome.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreloadError {
    /// Decode-ready signal did not arrive within the bound
    #[error("decode-ready wait exceeded {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Host decoder reported a failure (after retries)
    #[error("decode failed after {attempts} attempt(s): {reason}")]
    Decode { attempts: u32, reason: String },

    /// The manager was disposed while the preload was in flight
    #[error("preload abandoned")]
    Abandoned,
}

/// Typed failures of a segmented-buffer append
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppendError {
    /// Buffer is over its memory quota
    #[error("buffer quota exceeded")]
    QuotaExceeded,

    /// Buffer is in a state that cannot accept the operation
    #[error("invalid buffer state: {0}")]
    InvalidState(String),

    /// Segment payload could not be parsed
    #[error("segment decode error: {0}")]
    Decode(String),

    /// Buffer was detached from its playback sink
    #[error("buffer detached")]
    Detached,
}

impl AppendError {
    /// Failures that can be recovered by evicting played data
    pub fn is_recoverable(&self) -> bool {
        matches!(self, AppendError::QuotaExceeded | AppendError::InvalidState(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preload_error_display() {
        let err = Error::Preload {
            index: 2,
            source: PreloadError::Timeout { timeout_ms: 30_000 },
        };
        assert_eq!(
            err.to_string(),
            "Preload failed for clip 2: decode-ready wait exceeded 30000 ms"
        );
    }

    #[test]
    fn test_recoverable_append_errors() {
        assert!(AppendError::QuotaExceeded.is_recoverable());
        assert!(AppendError::InvalidState("updating".into()).is_recoverable());
        assert!(!AppendError::Detached.is_recoverable());
        assert!(!AppendError::Decode("bad header".into()).is_recoverable());
    }

    #[test]
    fn test_common_errors_convert() {
        let err: Error = segue_common::Error::InvalidInput("empty".into()).into();
        assert!(matches!(err, Error::Common(_)));
        assert!(Error::Cancelled.is_cancelled());
    }
}
