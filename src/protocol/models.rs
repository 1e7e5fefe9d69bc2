use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    common::types::{AnyResult, GuildId, UserId},
    protocol::opcodes,
};

/// Envelope for every voice gateway text frame.
#[derive(Serialize, Deserialize, Debug)]
pub struct VoiceGatewayMessage {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    /// Sequence number used for `seq_ack`; only present on server frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl VoiceGatewayMessage {
    pub fn new<T: Serialize>(op: u8, d: &T) -> AnyResult<Self> {
        Ok(Self {
            op,
            d: serde_json::to_value(d)?,
            seq: None,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Identify {
    pub server_id: GuildId,
    pub user_id: UserId,
    pub session_id: String,
    pub token: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resume {
    pub server_id: GuildId,
    pub session_id: String,
    pub token: String,
    pub seq_ack: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub t: u64,
    pub seq_ack: i64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Hello {
    pub heartbeat_interval: f64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub modes: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDescriptionPayload {
    pub mode: String,
    pub secret_key: Vec<u8>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ClientDisconnect {
    pub user_id: UserId,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SelectProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SelectProtocol {
    pub protocol: &'static str,
    pub data: SelectProtocolData,
}

impl SelectProtocol {
    pub fn udp(address: String, port: u16, mode: &str) -> Self {
        Self {
            protocol: "udp",
            data: SelectProtocolData {
                address,
                port,
                mode: mode.to_string(),
            },
        }
    }
}

/// Speaking flag for regular microphone audio.
pub const SPEAKING_MICROPHONE: u8 = 1 << 0;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Speaking {
    pub speaking: u8,
    pub delay: u32,
    pub ssrc: u32,
}

/// Commands the rest of the crate may push through an established session.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceCommand {
    SelectProtocol(SelectProtocol),
    Speaking(Speaking),
}

impl VoiceCommand {
    pub fn into_message(self) -> AnyResult<VoiceGatewayMessage> {
        match self {
            Self::SelectProtocol(p) => VoiceGatewayMessage::new(opcodes::SELECT_PROTOCOL, &p),
            Self::Speaking(s) => VoiceGatewayMessage::new(opcodes::SPEAKING, &s),
        }
    }
}
