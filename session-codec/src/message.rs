//! Protocol-independent message types
//!
//! These are the typed values the session works with. Codecs translate them
//! to and from the bytes a specific device family understands.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Correlation identifier for one request/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for CallId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// An outgoing command or query
///
/// Requests without an id are one-way notifications: the device is not
/// expected to answer them.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<CallId>,
    pub method: String,
    pub params: Value,
}

impl Request {
    /// Create a request without parameters
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            id: None,
            method: method.into(),
            params: Value::Null,
        }
    }

    /// Create a request with parameters
    pub fn with_params(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Assign the correlation id
    pub fn with_id(mut self, id: CallId) -> Self {
        self.id = Some(id);
        self
    }

    /// Whether the device is expected to answer
    pub fn expects_response(&self) -> bool {
        self.id.is_some()
    }
}

/// Error reported by the device in place of a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for RemoteError {}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Answer to an earlier request
    Response {
        id: CallId,
        result: Result<Value, RemoteError>,
    },
    /// Unsolicited, device-initiated message
    Notification { topic: String, payload: Value },
}

impl InboundMessage {
    pub fn is_response(&self) -> bool {
        matches!(self, InboundMessage::Response { .. })
    }

    /// Topic for notifications, `None` for responses
    pub fn topic(&self) -> Option<&str> {
        match self {
            InboundMessage::Notification { topic, .. } => Some(topic),
            InboundMessage::Response { .. } => None,
        }
    }
}
