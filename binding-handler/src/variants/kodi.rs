//! Kodi media center over its JSON-RPC socket (port 9090)

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU8, Ordering};

use device_session::{CallError, MethodHealthCheck, ProbeHandshake, SessionManager};

use crate::error::HandlerError;
use crate::status::{ChannelState, ChannelUpdate, Command, CommandValue};
use crate::variant::DeviceVariant;

pub const CHANNEL_VOLUME: &str = "volume";
pub const CHANNEL_MUTE: &str = "mute";
pub const CHANNEL_CONTROL: &str = "control";
pub const CHANNEL_SCREENSAVER: &str = "screensaver";
pub const CHANNEL_NOTIFICATION: &str = "notification";

/// Player states reported on the control channel
pub const STATE_PLAY: &str = "PLAY";
pub const STATE_PAUSE: &str = "PAUSE";
pub const STATE_STOP: &str = "STOP";
pub const STATE_END: &str = "END";
pub const STATE_REWIND: &str = "REWIND";
pub const STATE_FASTFORWARD: &str = "FASTFORWARD";

const TOPICS: &[&str] = &[
    "Application.OnVolumeChanged",
    "Player.OnPlay",
    "Player.OnAVStart",
    "Player.OnPause",
    "Player.OnResume",
    "Player.OnStop",
    "Player.OnSpeedChanged",
    "GUI.OnScreensaverActivated",
    "GUI.OnScreensaverDeactivated",
];

const DEFAULT_VOLUME_STEP: u8 = 10;

/// Kodi: volume and mute, player control, screensaver and on-screen
/// notifications
#[derive(Debug)]
pub struct KodiVariant {
    volume_step: u8,
    notification_time_ms: u64,
    /// Last volume seen, used for relative volume commands
    volume: AtomicU8,
}

impl Default for KodiVariant {
    fn default() -> Self {
        Self {
            volume_step: DEFAULT_VOLUME_STEP,
            notification_time_ms: 5000,
            volume: AtomicU8::new(0),
        }
    }
}

impl KodiVariant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_volume_step(mut self, step: u8) -> Self {
        self.volume_step = step.clamp(1, 100);
        self
    }

    pub fn with_notification_time(mut self, millis: u64) -> Self {
        self.notification_time_ms = millis;
        self
    }

    pub fn last_volume(&self) -> u8 {
        self.volume.load(Ordering::Relaxed)
    }

    fn remember_volume(&self, volume: u8) -> ChannelUpdate {
        self.volume.store(volume, Ordering::Relaxed);
        ChannelUpdate::new(CHANNEL_VOLUME, ChannelState::Percent(volume))
    }

    fn volume_from(&self, value: &Value) -> Option<ChannelUpdate> {
        let volume = value.as_f64()?.round().clamp(0.0, 100.0) as u8;
        Some(self.remember_volume(volume))
    }

    async fn set_volume(&self, session: &SessionManager, volume: u8) -> Result<Vec<ChannelUpdate>, HandlerError> {
        session
            .invoke("Application.SetVolume", json!({ "volume": volume }))
            .await?;
        Ok(vec![self.remember_volume(volume)])
    }

    async fn set_mute(&self, session: &SessionManager, mute: bool) -> Result<Vec<ChannelUpdate>, HandlerError> {
        session
            .invoke("Application.SetMute", json!({ "mute": mute }))
            .await?;
        Ok(vec![ChannelUpdate::new(CHANNEL_MUTE, ChannelState::Switch(mute))])
    }

    /// First active player, if anything is playing
    async fn active_player(&self, session: &SessionManager) -> Result<Option<i64>, HandlerError> {
        let players = session.invoke("Player.GetActivePlayers", Value::Null).await?;
        let players = players
            .as_array()
            .ok_or_else(|| HandlerError::UnexpectedResponse(format!("active players: {}", players)))?;
        Ok(players
            .first()
            .and_then(|player| player.get("playerid"))
            .and_then(Value::as_i64))
    }

    async fn player_command(&self, session: &SessionManager, method: &str) -> Result<Vec<ChannelUpdate>, HandlerError> {
        match self.active_player(session).await? {
            Some(player) => {
                session.invoke(method, json!({ "playerid": player })).await?;
            }
            None => tracing::debug!("Kodi has no active player for {}", method),
        }
        // The player notification reports the resulting state
        Ok(Vec::new())
    }

    async fn show_notification(
        &self,
        session: &SessionManager,
        message: &str,
    ) -> Result<Vec<ChannelUpdate>, HandlerError> {
        let params = json!({
            "title": "",
            "message": message,
            "displaytime": self.notification_time_ms,
        });
        session.invoke("GUI.ShowNotification", params).await?;
        Ok(Vec::new())
    }
}

fn unsupported(command: &Command) -> HandlerError {
    HandlerError::UnsupportedCommand {
        channel: command.channel.clone(),
        command: format!("{:?}", command.value),
    }
}

fn control(state: &str) -> ChannelUpdate {
    ChannelUpdate::new(CHANNEL_CONTROL, ChannelState::Text(state.to_string()))
}

#[async_trait]
impl DeviceVariant for KodiVariant {
    type Handshake = ProbeHandshake;
    type HealthCheck = MethodHealthCheck;

    fn name(&self) -> &str {
        "kodi"
    }

    fn topics(&self) -> Vec<String> {
        TOPICS.iter().map(|topic| topic.to_string()).collect()
    }

    fn decode_notification(&self, topic: &str, payload: &Value) -> Vec<ChannelUpdate> {
        let data = &payload["data"];
        match topic {
            "Application.OnVolumeChanged" => {
                let mut updates = Vec::new();
                updates.extend(self.volume_from(&data["volume"]));
                if let Some(muted) = data["muted"].as_bool() {
                    updates.push(ChannelUpdate::new(CHANNEL_MUTE, ChannelState::Switch(muted)));
                }
                updates
            }
            "Player.OnPlay" | "Player.OnAVStart" | "Player.OnResume" => vec![control(STATE_PLAY)],
            "Player.OnPause" => vec![control(STATE_PAUSE)],
            "Player.OnStop" => {
                if data["end"].as_bool() == Some(true) {
                    vec![control(STATE_END), control(STATE_STOP)]
                } else {
                    vec![control(STATE_STOP)]
                }
            }
            "Player.OnSpeedChanged" => match data["player"]["speed"].as_i64() {
                Some(0) => vec![control(STATE_PAUSE)],
                Some(1) => vec![control(STATE_PLAY)],
                Some(speed) if speed < 0 => vec![control(STATE_REWIND)],
                Some(_) => vec![control(STATE_FASTFORWARD)],
                None => Vec::new(),
            },
            "GUI.OnScreensaverActivated" => {
                vec![ChannelUpdate::new(CHANNEL_SCREENSAVER, ChannelState::Switch(true))]
            }
            "GUI.OnScreensaverDeactivated" => {
                vec![ChannelUpdate::new(CHANNEL_SCREENSAVER, ChannelState::Switch(false))]
            }
            _ => Vec::new(),
        }
    }

    async fn refresh(&self, session: &SessionManager) -> Result<Vec<ChannelUpdate>, CallError> {
        let properties = session
            .invoke(
                "Application.GetProperties",
                json!({ "properties": ["volume", "muted"] }),
            )
            .await?;

        let mut updates = Vec::new();
        updates.extend(self.volume_from(&properties["volume"]));
        if let Some(muted) = properties["muted"].as_bool() {
            updates.push(ChannelUpdate::new(CHANNEL_MUTE, ChannelState::Switch(muted)));
        }
        Ok(updates)
    }

    async fn command(
        &self,
        session: &SessionManager,
        command: &Command,
    ) -> Result<Vec<ChannelUpdate>, HandlerError> {
        match (command.channel.as_str(), &command.value) {
            (CHANNEL_VOLUME, CommandValue::Percent(volume)) => self.set_volume(session, (*volume).min(100)).await,
            (CHANNEL_VOLUME, CommandValue::Increase) => {
                let volume = self.last_volume().saturating_add(self.volume_step).min(100);
                self.set_volume(session, volume).await
            }
            (CHANNEL_VOLUME, CommandValue::Decrease) => {
                let volume = self.last_volume().saturating_sub(self.volume_step);
                self.set_volume(session, volume).await
            }
            (CHANNEL_MUTE, CommandValue::OnOff(mute)) => self.set_mute(session, *mute).await,
            (CHANNEL_CONTROL, CommandValue::Text(action)) => match action.to_ascii_uppercase().as_str() {
                STATE_PLAY | STATE_PAUSE => self.player_command(session, "Player.PlayPause").await,
                STATE_STOP => self.player_command(session, "Player.Stop").await,
                _ => Err(unsupported(command)),
            },
            (CHANNEL_NOTIFICATION, CommandValue::Text(message)) => self.show_notification(session, message).await,
            _ => Err(unsupported(command)),
        }
    }

    fn handshake(&self) -> ProbeHandshake {
        ProbeHandshake::new("JSONRPC.Version")
    }

    fn health_check(&self) -> Option<MethodHealthCheck> {
        Some(MethodHealthCheck::new("JSONRPC.Ping"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Player.OnPlay", json!({"data": {"player": {"playerid": 1}}}), vec![control(STATE_PLAY)])]
    #[case("Player.OnResume", json!({"data": {}}), vec![control(STATE_PLAY)])]
    #[case("Player.OnPause", json!({"data": {}}), vec![control(STATE_PAUSE)])]
    #[case("Player.OnStop", json!({"data": {"end": false}}), vec![control(STATE_STOP)])]
    #[case("Player.OnStop", json!({"data": {"end": true}}), vec![control(STATE_END), control(STATE_STOP)])]
    #[case("Player.OnSpeedChanged", json!({"data": {"player": {"speed": -2}}}), vec![control(STATE_REWIND)])]
    #[case("Player.OnSpeedChanged", json!({"data": {"player": {"speed": 4}}}), vec![control(STATE_FASTFORWARD)])]
    #[case(
        "GUI.OnScreensaverActivated",
        json!({"data": null}),
        vec![ChannelUpdate::new(CHANNEL_SCREENSAVER, ChannelState::Switch(true))]
    )]
    #[case("System.OnQuit", json!({"data": null}), vec![])]
    fn test_decode_player_and_gui(#[case] topic: &str, #[case] payload: Value, #[case] expected: Vec<ChannelUpdate>) {
        let kodi = KodiVariant::new();
        assert_eq!(kodi.decode_notification(topic, &payload), expected);
    }

    #[test]
    fn test_decode_volume_change_remembers_volume() {
        let kodi = KodiVariant::new();
        let updates = kodi.decode_notification(
            "Application.OnVolumeChanged",
            &json!({"data": {"volume": 57.0, "muted": true}, "sender": "xbmc"}),
        );

        assert_eq!(
            updates,
            vec![
                ChannelUpdate::new(CHANNEL_VOLUME, ChannelState::Percent(57)),
                ChannelUpdate::new(CHANNEL_MUTE, ChannelState::Switch(true)),
            ]
        );
        assert_eq!(kodi.last_volume(), 57);
    }

    #[test]
    fn test_decode_volume_without_data() {
        let kodi = KodiVariant::new();
        assert!(kodi
            .decode_notification("Application.OnVolumeChanged", &Value::Null)
            .is_empty());
    }

    #[test]
    fn test_topics_cover_decoded_notifications() {
        let kodi = KodiVariant::new();
        let topics = kodi.topics();
        assert!(topics.contains(&"Application.OnVolumeChanged".to_string()));
        assert!(topics.contains(&"Player.OnStop".to_string()));
        assert!(!topics.contains(&"System.OnQuit".to_string()));
    }

    #[test]
    fn test_builders() {
        let kodi = KodiVariant::new().with_volume_step(0).with_notification_time(1500);
        assert_eq!(kodi.volume_step, 1);
        assert_eq!(kodi.notification_time_ms, 1500);
        assert_eq!(kodi.name(), "kodi");
        assert_eq!(kodi.health_check().map(|check| check.method().to_string()), Some("JSONRPC.Ping".into()));
    }
}
