//! Error types for the transport layer

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while opening or using a link to a device
#[derive(Debug, Error)]
pub enum TransportError {
    /// The address could not be interpreted by the transport
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The device could not be reached
    #[error("Device {address} unreachable: {reason}")]
    Unreachable {
        /// Address that was dialed
        address: String,
        /// Underlying cause
        reason: String,
    },

    /// Opening the link took longer than allowed
    #[error("Timed out after {timeout:?} connecting to {address}")]
    ConnectTimeout {
        /// Address that was dialed
        address: String,
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// An inbound frame exceeded the configured maximum length
    #[error("Frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// The link has been closed (locally or by the peer)
    #[error("Link closed")]
    Closed,

    /// Low level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether a new connection attempt may succeed later.
    ///
    /// Address errors require a configuration change and are never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidAddress(_))
    }
}
