use serde::{Deserialize, Serialize};

use crate::{
    common::types::{ChannelId, GuildId, UserId},
    gateway::constants::{
        CONNECT_TIMEOUT_MS, FRAME_DURATION_MS, IP_DISCOVERY_TIMEOUT_MS, TRAILING_SILENCE_FRAMES,
    },
};

/// `[voice]`: which channel to join and how the connection behaves.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VoiceConfig {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    #[serde(default)]
    pub self_mute: bool,
    #[serde(default)]
    pub self_deaf: bool,
    /// How long to wait for the voice state and voice server updates after joining.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ip_discovery_timeout_ms")]
    pub ip_discovery_timeout_ms: u64,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_trailing_silence_frames")]
    pub trailing_silence_frames: u32,
    /// Credentials normally delivered by the primary gateway. The demo binary
    /// replays them into its local gateway.
    #[serde(default)]
    pub server: Option<VoiceServerConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VoiceServerConfig {
    pub session_id: String,
    pub token: String,
    pub endpoint: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            guild_id: GuildId(0),
            channel_id: ChannelId(0),
            user_id: UserId(0),
            self_mute: false,
            self_deaf: false,
            connect_timeout_ms: default_connect_timeout_ms(),
            ip_discovery_timeout_ms: default_ip_discovery_timeout_ms(),
            frame_interval_ms: default_frame_interval_ms(),
            trailing_silence_frames: default_trailing_silence_frames(),
            server: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    CONNECT_TIMEOUT_MS
}

fn default_ip_discovery_timeout_ms() -> u64 {
    IP_DISCOVERY_TIMEOUT_MS
}

fn default_frame_interval_ms() -> u64 {
    FRAME_DURATION_MS
}

fn default_trailing_silence_frames() -> u32 {
    TRAILING_SILENCE_FRAMES
}
