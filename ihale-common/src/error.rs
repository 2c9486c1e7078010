//! Common error types for the analysis services
//!
//! The first six variants are the pipeline taxonomy. Per-document failures
//! (`DocumentFailed`) are recovered by the worker and never escalate to the
//! stream; `StreamClosed` is an expected terminal condition.

use thiserror::Error;

/// Common result type for analysis operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the analysis services
#[derive(Error, Debug)]
pub enum Error {
    /// Bad enqueue input (e.g. empty document list)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Queue or extraction backend unreachable
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// One document's extraction failed; the batch continues
    #[error("Document {document_id} failed: {message}")]
    DocumentFailed { document_id: i64, message: String },

    /// Fatal condition that stopped the remaining documents of a batch
    #[error("Batch aborted: {0}")]
    BatchAborted(String),

    /// Client received a frame it could not decode
    #[error("Stream desync: {0}")]
    StreamDesync(String),

    /// The event stream ended
    #[error("Stream closed")]
    StreamClosed,

    /// A deadline expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Cancelled before any document was processed
    #[error("Cancelled: no work done")]
    NoWorkDone,

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database operation error (wraps sqlx::Error)
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// True for conditions that end a batch rather than a single document
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::BatchAborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Unavailable("backend down".into()).is_fatal());
        assert!(Error::BatchAborted("stop".into()).is_fatal());
        assert!(!Error::DocumentFailed {
            document_id: 7,
            message: "bad pdf".into()
        }
        .is_fatal());
        assert!(!Error::StreamDesync("garbage".into()).is_fatal());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::DocumentFailed {
            document_id: 42,
            message: "unreadable".into(),
        };
        assert_eq!(err.to_string(), "Document 42 failed: unreadable");
        assert_eq!(Error::StreamClosed.to_string(), "Stream closed");
    }
}
