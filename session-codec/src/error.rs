//! Error types for encoding and decoding device messages

use thiserror::Error;

/// Errors that can occur while encoding requests or decoding inbound frames
#[derive(Error, Debug)]
pub enum CodecError {
    /// The request could not be serialized
    #[error("Failed to encode request: {0}")]
    Encode(String),

    /// The frame is not valid for this protocol
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// The frame is well formed but is neither a response nor a notification
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// JSON (de)serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for codec operations
pub type CodecResult<T> = Result<T, CodecError>;
