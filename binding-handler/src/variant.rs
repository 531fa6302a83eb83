//! Device-specific capabilities plugged into a [`DeviceHandler`](crate::DeviceHandler)

use async_trait::async_trait;
use serde_json::Value;

use device_session::{CallError, Handshake, HealthCheck, SessionManager};

use crate::error::HandlerError;
use crate::status::{ChannelUpdate, Command};

/// Everything a handler needs to know about one kind of device.
///
/// A variant is stateless with respect to the connection: the handler owns
/// the session and passes it in. Variants may keep a small cache of device
/// state (for example the last known volume) to resolve relative commands.
#[async_trait]
pub trait DeviceVariant: Send + Sync + 'static {
    /// Handshake run on every (re)connect
    type Handshake: Handshake;
    /// Liveness probe run by the session scheduler
    type HealthCheck: HealthCheck;

    /// Short name used in logs, e.g. "kodi"
    fn name(&self) -> &str;

    /// Notification topics the handler subscribes to
    fn topics(&self) -> Vec<String>;

    /// Turn one notification into channel updates. Unknown payloads yield
    /// no updates.
    fn decode_notification(&self, topic: &str, payload: &Value) -> Vec<ChannelUpdate>;

    /// Whether the session should refresh this device on every poll tick.
    /// Devices that push all their state can return false.
    fn should_poll(&self) -> bool {
        true
    }

    /// Read the current state of every channel
    async fn refresh(&self, session: &SessionManager) -> Result<Vec<ChannelUpdate>, CallError>;

    /// Execute a host command and return the channel states it produced
    async fn command(
        &self,
        session: &SessionManager,
        command: &Command,
    ) -> Result<Vec<ChannelUpdate>, HandlerError>;

    fn handshake(&self) -> Self::Handshake;

    /// `None` disables health checks and staleness detection
    fn health_check(&self) -> Option<Self::HealthCheck>;
}
