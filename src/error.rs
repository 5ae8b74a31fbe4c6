//! Error types for volume transfer and segmentation operations
//!
//! This module defines every error that can occur while moving an artifact
//! across the chunked transfer protocol, decoding a volume, running the
//! segmentation engine, and repacking its output.

use thiserror::Error;

/// Volume transfer and segmentation error types
///
/// All operations in this library return `Result<T, SegError>` to provide
/// explicit error handling.
#[derive(Error, Debug)]
pub enum SegError {
    /// Handshake or sequencing violation
    ///
    /// This error occurs when:
    /// - The handshake declares no artifacts, or an artifact is missing a field
    /// - `total_chunks` does not equal `ceil(size / chunk_size)`
    /// - A chunk arrives out of order, duplicated, or for the wrong artifact
    /// - A message arrives in a state that does not accept it
    /// - The message type is not recognized
    ///
    /// A protocol error is fatal to the session: it moves to `ERROR` and an
    /// `error` terminal message is sent to the peer.
    ///
    /// # Example
    /// ```no_run
    /// # use seglink::error::SegError;
    /// let err = SegError::Protocol("expected chunk 3, got 5".to_string());
    /// ```
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Reassembled artifact length differs from the declared size
    ///
    /// # Example
    /// ```no_run
    /// # use seglink::error::SegError;
    /// let err = SegError::ArtifactSizeMismatch {
    ///     artifact: "volume".to_string(),
    ///     expected: 1024,
    ///     actual: 1000,
    /// };
    /// ```
    #[error("Artifact '{artifact}' size mismatch: expected {expected} bytes, got {actual}")]
    ArtifactSizeMismatch {
        /// Artifact name from the handshake
        artifact: String,
        /// Size declared in the handshake
        expected: usize,
        /// Bytes actually received
        actual: usize,
    },

    /// Decoded element count does not match the declared dimensions
    ///
    /// Reports expected-vs-actual voxel counts. Also raised when an array
    /// shape does not match the reference it is being mapped back onto.
    #[error("Element count mismatch: expected {expected}, got {actual}")]
    ElementCountMismatch {
        /// Product of the declared dimensions
        expected: usize,
        /// Elements present in the buffer
        actual: usize,
    },

    /// The engine did not produce a declared output
    ///
    /// Declared sub-volumes are never silently skipped.
    #[error("Artifact missing: {0}")]
    ArtifactMissing(String),

    /// Opaque failure inside the segmentation or feature engine
    #[error("Engine failure: {0}")]
    EngineFailure(String),

    /// No message from the peer within the inactivity timeout
    #[error("Timed out after {secs}s of inactivity")]
    Timeout {
        /// Configured inactivity timeout in seconds
        secs: u64,
    },

    /// Best-effort persistence failed
    ///
    /// Non-fatal: degrades the terminal status to `warning` and never
    /// invalidates an already computed result.
    #[error("Downstream sink failure: {0}")]
    SinkFailure(String),

    /// Malformed request or missing required field
    ///
    /// # Example
    /// ```no_run
    /// # use seglink::error::SegError;
    /// let err = SegError::InvalidRequest("JSON body must include dimensions and data".to_string());
    /// ```
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Frame body exceeds the channel's message-size ceiling
    #[error("Message body too large: {size} bytes (max: {max})")]
    BodyTooLarge {
        /// Actual body size in bytes
        size: usize,
        /// Maximum allowed size in bytes
        max: usize,
    },

    /// I/O error occurred during network communication or persistence
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary payload was not valid base64
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl SegError {
    /// HTTP-style status code for error replies
    ///
    /// 400 for malformed input, 404 for a referenced artifact that does not
    /// exist, 500 for internal and engine failures.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Protocol(_)
            | Self::InvalidRequest(_)
            | Self::ArtifactSizeMismatch { .. }
            | Self::ElementCountMismatch { .. }
            | Self::BodyTooLarge { .. }
            | Self::Json(_)
            | Self::Base64(_) => 400,
            Self::ArtifactMissing(_) => 404,
            Self::EngineFailure(_)
            | Self::Timeout { .. }
            | Self::SinkFailure(_)
            | Self::Io(_) => 500,
        }
    }

    /// Whether the error leaves an already computed result valid
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::SinkFailure(_))
    }
}

/// Result type alias for volume transfer operations
pub type Result<T> = std::result::Result<T, SegError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(SegError::InvalidRequest("x".into()).status_code(), 400);
        assert_eq!(
            SegError::ElementCountMismatch {
                expected: 8,
                actual: 7
            }
            .status_code(),
            400
        );
        assert_eq!(SegError::ArtifactMissing("heart".into()).status_code(), 404);
        assert_eq!(SegError::EngineFailure("oom".into()).status_code(), 500);
    }

    #[test]
    fn test_sink_failure_is_not_fatal() {
        assert!(!SegError::SinkFailure("disk full".into()).is_fatal());
        assert!(SegError::Timeout { secs: 300 }.is_fatal());
    }

    #[test]
    fn test_size_mismatch_message() {
        let err = SegError::ArtifactSizeMismatch {
            artifact: "volume".into(),
            expected: 10,
            actual: 9,
        };
        assert_eq!(
            err.to_string(),
            "Artifact 'volume' size mismatch: expected 10 bytes, got 9"
        );
    }
}
