//! Stream error types
//!
//! Usage errors are reported at the call site and never stored. Every other
//! variant can become a stream's stored error, which is why the type is
//! `Clone`: one stored error settles many promises.

use thiserror::Error;

/// Errors produced by streams, readers, writers and pipes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Stream is locked to a reader or writer")]
    Locked,

    #[error("Lock was released")]
    Released,

    #[error("Stream is closed")]
    Closed,

    #[error("Stream is closing")]
    CloseRequested,

    #[error("Stream is not in a writable state")]
    NotWritable,

    #[error("Invalid highWaterMark: {0}")]
    InvalidHighWaterMark(String),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("TransformStream terminated")]
    TransformTerminated,

    #[error("Closing is propagated backward")]
    ClosingPropagatedBackward,

    #[error("The operation was aborted")]
    Aborted,

    #[error("Stream was dropped")]
    Detached,

    #[error("Multiple errors: {0:?}")]
    Multiple(Vec<StreamError>),

    #[error("{0}")]
    Custom(String),
}

impl StreamError {
    /// Build an error from a caller-supplied reason
    pub fn custom(reason: impl Into<String>) -> Self {
        StreamError::Custom(reason.into())
    }

    /// Whether this error reports API misuse rather than a stream failure
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            StreamError::Locked
                | StreamError::Released
                | StreamError::Closed
                | StreamError::CloseRequested
                | StreamError::NotWritable
                | StreamError::InvalidHighWaterMark(_)
                | StreamError::InvalidState(_)
        )
    }
}

impl From<&str> for StreamError {
    fn from(reason: &str) -> Self {
        StreamError::Custom(reason.to_string())
    }
}

impl From<String> for StreamError {
    fn from(reason: String) -> Self {
        StreamError::Custom(reason)
    }
}

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_errors() {
        assert!(StreamError::Locked.is_usage_error());
        assert!(StreamError::Closed.is_usage_error());
        assert!(!StreamError::custom("boom").is_usage_error());
        assert!(!StreamError::Aborted.is_usage_error());
    }

    #[test]
    fn test_display() {
        assert_eq!(StreamError::custom("boom").to_string(), "boom");
        assert_eq!(
            StreamError::InvalidChunkSize("-1".into()).to_string(),
            "Invalid chunk size: -1"
        );
    }
}
