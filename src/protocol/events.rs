use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    common::types::{ChannelId, GuildId, UserId},
    protocol::opcodes,
};

/// The slice of the primary gateway's dispatch stream this crate consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    VoiceStateUpdate(VoiceState),
    VoiceServerUpdate(VoiceServerUpdate),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VoiceState {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub user_id: UserId,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VoiceServerUpdate {
    pub token: String,
    pub guild_id: GuildId,
    /// `None` while the old voice server is going away and no new one is allocated yet.
    pub endpoint: Option<String>,
}

/// Join, move or leave (`channel_id: None`) a voice channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateVoiceStatus {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl UpdateVoiceStatus {
    /// Full primary gateway frame (op 4).
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "op": opcodes::GATEWAY_VOICE_STATE_UPDATE,
            "d": self,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leave_payload_has_null_channel() {
        let leave = UpdateVoiceStatus {
            guild_id: GuildId(41771983423143937),
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        };
        assert_eq!(
            leave.to_payload(),
            serde_json::json!({
                "op": 4,
                "d": {
                    "guild_id": "41771983423143937",
                    "channel_id": null,
                    "self_mute": false,
                    "self_deaf": false
                }
            })
        );
    }

    #[test]
    fn test_parse_voice_server_update() {
        let update: VoiceServerUpdate = serde_json::from_str(
            r#"{"token":"my_token","guild_id":"41771983423143937","endpoint":"sweetwater-12345.discord.media:2048"}"#,
        )
        .unwrap();
        assert_eq!(update.guild_id, GuildId(41771983423143937));
        assert_eq!(update.endpoint.as_deref(), Some("sweetwater-12345.discord.media:2048"));
    }
}
