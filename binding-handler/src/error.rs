//! Error types for the binding-handler crate.

use device_session::{CallError, ConnectError, SessionError};

/// Errors surfaced by a [`DeviceHandler`](crate::DeviceHandler).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Session setup failed: {0}")]
    Session(#[from] SessionError),

    #[error("Device connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Device call failed: {0}")]
    Call(#[from] CallError),

    /// The variant has no mapping for this channel/command pair
    #[error("Unsupported command {command} for channel {channel}")]
    UnsupportedCommand { channel: String, command: String },

    /// The device answered with something the variant cannot interpret
    #[error("Unexpected device response: {0}")]
    UnexpectedResponse(String),

    /// The handler was used after `dispose()`
    #[error("Handler for {0} has been disposed")]
    Disposed(String),
}

impl HandlerError {
    /// Whether the failure is a device communication problem, as opposed to
    /// a bad command or configuration
    pub fn is_communication_error(&self) -> bool {
        match self {
            HandlerError::Connect(error) => error.is_retryable(),
            HandlerError::Call(error) => !matches!(error, CallError::Remote(_)),
            _ => false,
        }
    }
}

/// Convenience type alias for Results using HandlerError.
pub type Result<T> = std::result::Result<T, HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_communication_error_classification() {
        assert!(HandlerError::Call(CallError::NotConnected).is_communication_error());
        assert!(HandlerError::Connect(ConnectError::Timeout(Duration::from_secs(1))).is_communication_error());
        assert!(!HandlerError::Connect(ConnectError::Auth("denied".into())).is_communication_error());
        assert!(!HandlerError::UnsupportedCommand {
            channel: "volume".into(),
            command: "ON".into()
        }
        .is_communication_error());
    }

    #[test]
    fn test_display() {
        let error = HandlerError::UnsupportedCommand {
            channel: "mute".into(),
            command: "Percent(3)".into(),
        };
        assert_eq!(error.to_string(), "Unsupported command Percent(3) for channel mute");
    }
}
