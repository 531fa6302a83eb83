//! Host-facing session callbacks
//!
//! A [`SessionListener`] hears about everything one session does: state
//! transitions, every inbound notification (routed or not) and fatal
//! errors that end the reconnect cycle. Hosts that prefer a stream can use
//! [`ChannelSessionListener`], which forwards [`SessionEvent`]s over an mpsc
//! channel.

use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ConnectError;
use crate::state::ConnectionState;

/// Callbacks invoked by a session. All methods default to doing nothing.
///
/// Callbacks run on the session's tasks and must not block.
pub trait SessionListener: Send + Sync {
    fn on_connection_state_changed(&self, _previous: ConnectionState, _current: ConnectionState) {}

    fn on_notification(&self, _topic: &str, _payload: &Value) {}

    /// The session gave up reconnecting. Operator action is required.
    fn on_fatal_error(&self, _error: &ConnectError) {}
}

/// Event form of the [`SessionListener`] callbacks
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    Notification {
        topic: String,
        payload: Value,
    },
    FatalError {
        message: String,
        #[serde(skip)]
        error: ConnectError,
    },
}

/// Forwards session callbacks as [`SessionEvent`]s
#[derive(Debug, Clone)]
pub struct ChannelSessionListener {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSessionListener {
    /// Create a listener and the receiver its events arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn forward(&self, event: SessionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Session event receiver dropped");
        }
    }
}

impl SessionListener for ChannelSessionListener {
    fn on_connection_state_changed(&self, previous: ConnectionState, current: ConnectionState) {
        self.forward(SessionEvent::StateChanged { previous, current });
    }

    fn on_notification(&self, topic: &str, payload: &Value) {
        self.forward(SessionEvent::Notification {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
    }

    fn on_fatal_error(&self, error: &ConnectError) {
        self.forward(SessionEvent::FatalError {
            message: error.to_string(),
            error: error.clone(),
        });
    }
}

/// Invoke `callback` on every listener, isolating panics
pub(crate) fn notify_all<F>(listeners: &[Arc<dyn SessionListener>], what: &str, callback: F)
where
    F: Fn(&dyn SessionListener),
{
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(|| callback(listener.as_ref()))).is_err() {
            tracing::error!("Session listener panicked during {}", what);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_listener_forwards_events() {
        let (listener, mut events) = ChannelSessionListener::new();

        listener.on_connection_state_changed(ConnectionState::Connecting, ConnectionState::Connected);
        listener.on_notification("Player.OnPlay", &json!({"item": 1}));
        listener.on_fatal_error(&ConnectError::Auth("denied".into()));

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StateChanged {
                previous: ConnectionState::Connecting,
                current: ConnectionState::Connected,
            }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Notification { topic, .. } if topic == "Player.OnPlay"
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::FatalError { error: ConnectError::Auth(_), .. }
        ));
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::StateChanged {
            previous: ConnectionState::Connected,
            current: ConnectionState::Disconnected,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["current"], "Disconnected");
    }

    struct Panicky;

    impl SessionListener for Panicky {
        fn on_notification(&self, _topic: &str, _payload: &Value) {
            panic!("host bug");
        }
    }

    #[tokio::test]
    async fn test_notify_all_isolates_panics() {
        let (channel, mut events) = ChannelSessionListener::new();
        let listeners: Vec<Arc<dyn SessionListener>> = vec![Arc::new(Panicky), Arc::new(channel)];

        notify_all(&listeners, "notification", |l| l.on_notification("t", &Value::Null));

        assert!(matches!(events.recv().await, Some(SessionEvent::Notification { .. })));
    }
}
