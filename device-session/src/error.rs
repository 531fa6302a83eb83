//! Error types for the device-session crate.

use std::time::Duration;

use session_codec::{CallId, CodecError, RemoteError};
use session_transport::TransportError;

/// Errors from establishing a session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectError {
    /// The device rejected the credentials. Requires operator action.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The device could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// The handshake produced an unexpected answer
    #[error("Protocol error during handshake: {0}")]
    Protocol(String),

    /// Transport and handshake did not finish in time
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// Another connect attempt is running
    #[error("A connect attempt is already in progress")]
    AlreadyConnecting,

    /// `disconnect()` was called while connecting
    #[error("Connect attempt cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Whether the reconnect cycle should try again after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectError::Network(_) | ConnectError::Timeout(_))
    }
}

impl From<TransportError> for ConnectError {
    fn from(error: TransportError) -> Self {
        if error.is_retryable() {
            ConnectError::Network(error.to_string())
        } else {
            ConnectError::Protocol(error.to_string())
        }
    }
}

/// Errors returned to the invoker of a single call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// No response within the call timeout. The device may still have
    /// executed the request.
    #[error("Call {id} timed out after {timeout:?}")]
    Timeout { id: CallId, timeout: Duration },

    /// The session was not connected; nothing was sent
    #[error("Session is not connected")]
    NotConnected,

    /// The session went down while the call was pending
    #[error("Session disconnected while call was pending")]
    Disconnected,

    /// The request could not be encoded or the answer made no sense
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered with an error
    #[error("Device error: {0}")]
    Remote(RemoteError),

    /// Sending the request failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The id is already in use by a pending call
    #[error("Duplicate call id {0}")]
    DuplicateId(CallId),
}

impl CallError {
    /// Whether re-issuing the same command may help
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Timeout { .. } | CallError::Transport(_))
    }
}

impl From<CodecError> for CallError {
    fn from(error: CodecError) -> Self {
        CallError::Protocol(error.to_string())
    }
}

impl From<RemoteError> for CallError {
    fn from(error: RemoteError) -> Self {
        CallError::Remote(error)
    }
}

/// Errors from building or operating a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A required component was not supplied to the builder
    #[error("Missing session component: {0}")]
    MissingComponent(&'static str),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Call(#[from] CallError),
}

/// Convenience type alias for Results using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_display() {
        let error = ConnectError::Auth("bad password".to_string());
        assert_eq!(error.to_string(), "Authentication failed: bad password");

        let error = ConnectError::Timeout(Duration::from_secs(5));
        assert_eq!(error.to_string(), "Connect timed out after 5s");
    }

    #[test]
    fn test_connect_error_retry_classification() {
        assert!(ConnectError::Network("refused".into()).is_retryable());
        assert!(ConnectError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ConnectError::Auth("denied".into()).is_retryable());
        assert!(!ConnectError::Protocol("garbage".into()).is_retryable());
        assert!(!ConnectError::Cancelled.is_retryable());
    }

    #[test]
    fn test_transport_error_conversion() {
        let error: ConnectError = TransportError::Closed.into();
        assert!(matches!(error, ConnectError::Network(_)));

        let error: ConnectError = TransportError::InvalidAddress("nope".into()).into();
        assert!(matches!(error, ConnectError::Protocol(_)));
    }

    #[test]
    fn test_call_error_display() {
        let error = CallError::Timeout {
            id: CallId::new(9),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(error.to_string(), "Call #9 timed out after 250ms");

        let error = CallError::Remote(RemoteError::new(-32601, "Method not found"));
        assert_eq!(error.to_string(), "Device error: Method not found (code -32601)");

        assert_eq!(CallError::NotConnected.to_string(), "Session is not connected");
    }

    #[test]
    fn test_call_error_retry_classification() {
        assert!(CallError::Transport("broken pipe".into()).is_retryable());
        assert!(!CallError::NotConnected.is_retryable());
        assert!(!CallError::Disconnected.is_retryable());
        assert!(!CallError::Remote(RemoteError::new(1, "x")).is_retryable());
    }

    #[test]
    fn test_session_error_wraps() {
        let error: SessionError = CallError::NotConnected.into();
        assert_eq!(error.to_string(), "Session is not connected");

        let error = SessionError::Configuration("poll interval is zero".into());
        assert_eq!(error.to_string(), "Configuration error: poll interval is zero");
    }
}
