//! Host-visible status, channel states and commands

use serde::Serialize;
use std::fmt;

use device_session::ConnectionState;

/// Why a device is offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    /// Link lost or device not answering; the session keeps retrying
    CommunicationError,
    /// Credentials or protocol rejected; needs operator action
    ConfigurationError,
}

/// Status of one device as presented to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ThingStatus {
    Unknown,
    Online,
    Offline { reason: OfflineReason, message: String },
}

impl ThingStatus {
    pub fn communication_error(message: impl Into<String>) -> Self {
        ThingStatus::Offline {
            reason: OfflineReason::CommunicationError,
            message: message.into(),
        }
    }

    pub fn configuration_error(message: impl Into<String>) -> Self {
        ThingStatus::Offline {
            reason: OfflineReason::ConfigurationError,
            message: message.into(),
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, ThingStatus::Online)
    }

    /// Status implied by a session state. `Connecting` keeps the current
    /// status so a reconnect does not flap the host.
    pub fn from_connection_state(state: ConnectionState, current: &ThingStatus) -> ThingStatus {
        match state {
            ConnectionState::Connected => ThingStatus::Online,
            ConnectionState::Connecting => current.clone(),
            ConnectionState::Disconnected => ThingStatus::communication_error("connection lost"),
            ConnectionState::Failed => ThingStatus::communication_error("cannot reach device"),
        }
    }
}

impl fmt::Display for ThingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThingStatus::Unknown => write!(f, "UNKNOWN"),
            ThingStatus::Online => write!(f, "ONLINE"),
            ThingStatus::Offline { reason, message } => {
                let reason = match reason {
                    OfflineReason::CommunicationError => "COMMUNICATION_ERROR",
                    OfflineReason::ConfigurationError => "CONFIGURATION_ERROR",
                };
                write!(f, "OFFLINE ({}): {}", reason, message)
            }
        }
    }
}

/// Value of a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ChannelState {
    Percent(u8),
    Switch(bool),
    Number(f64),
    Text(String),
    Undefined,
}

/// New state for one channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelUpdate {
    pub channel: String,
    pub state: ChannelState,
}

impl ChannelUpdate {
    pub fn new(channel: impl Into<String>, state: ChannelState) -> Self {
        Self {
            channel: channel.into(),
            state,
        }
    }
}

/// Command sent by the host to a channel
#[derive(Debug, Clone, PartialEq)]
pub enum CommandValue {
    /// Re-read the channel from the device
    Refresh,
    OnOff(bool),
    Percent(u8),
    Increase,
    Decrease,
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub channel: String,
    pub value: CommandValue,
}

impl Command {
    pub fn new(channel: impl Into<String>, value: CommandValue) -> Self {
        Self {
            channel: channel.into(),
            value,
        }
    }
}

/// Events a handler reports to its host
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HandlerEvent {
    StatusChanged { thing_id: String, status: ThingStatus },
    ChannelUpdated { thing_id: String, update: ChannelUpdate },
}
