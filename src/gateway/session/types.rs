use std::sync::Arc;

use crate::{
    common::types::{AnyResult, GuildId, SessionId, UserId, map_boxed_err},
    gateway::constants::SECRET_KEY_LEN,
    protocol::{models::Ready, opcodes::close},
};

/// Everything needed to identify (or resume) against a voice server.
///
/// Replaced as a whole whenever a voice state or voice server update arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceGatewayConfiguration {
    pub token: String,
    pub endpoint: String,
    pub session_id: SessionId,
    pub server_id: GuildId,
    pub self_id: UserId,
}

impl VoiceGatewayConfiguration {
    pub fn validate(&self) -> AnyResult<()> {
        if self.token.is_empty() {
            return Err(map_boxed_err("voice gateway token is empty"));
        }
        if self.endpoint.is_empty() {
            return Err(map_boxed_err("voice gateway endpoint is empty"));
        }
        if self.session_id.is_empty() {
            return Err(map_boxed_err("voice session id is empty"));
        }
        Ok(())
    }

    /// `wss://` is assumed unless the endpoint names its own scheme.
    pub fn url(&self, version: u8) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            format!("{}/?v={}", endpoint, version)
        } else {
            format!("wss://{}/?v={}", endpoint, version)
        }
    }
}

/// Negotiated once per identify; survives a resume.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub ssrc: u32,
    pub mode: String,
    pub secret_key: [u8; SECRET_KEY_LEN],
}

impl std::fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDescription")
            .field("ssrc", &self.ssrc)
            .field("mode", &self.mode)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Why a signaling session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Close {
    /// Closed locally through `VoiceGateway::stop`.
    UserClose,
    /// A heartbeat went unacknowledged for a whole interval.
    Timeout,
    /// The transport dropped without a usable close frame.
    Reconnecting,
    /// The server ended the session; `resumable` says whether Resume may follow.
    InvalidSession { resumable: bool },
    /// The session was torn down on purpose; only a new `start` brings it back.
    SessionReset,
    /// Server close code that rules out any retry.
    Discord { code: u16, reason: String },
    RetryLimitReached,
}

/// How the run loop continues after a [`Close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    /// Reconnect and send Resume (op 7) with the current session.
    Resume,
    /// Drop the session and Identify (op 0) from scratch.
    Identify,
}

/// Close codes that allow Op-7 resume.
///
/// `1006` is a local abnormal-close marker from the WebSocket library; it
/// shows up as a read error and is handled as [`Close::Reconnecting`].
pub fn is_reconnectable_close(code: u16) -> bool {
    matches!(code, close::SESSION_TIMEOUT | close::VOICE_SERVER_CRASHED)
}

/// Close codes that require a fresh Identify instead of Resume.
pub fn is_reidentify_close(code: u16) -> bool {
    matches!(code, close::SESSION_NO_LONGER_VALID)
}

/// Close codes that mean the session is dead and must not be retried.
pub fn is_fatal_close(code: u16) -> bool {
    matches!(
        code,
        close::AUTHENTICATION_FAILED | close::DISCONNECTED | close::UNKNOWN_ENCRYPTION_MODE
    )
}

impl Close {
    pub fn from_close_frame(code: u16, reason: String) -> Self {
        if is_reconnectable_close(code) {
            Self::InvalidSession { resumable: true }
        } else if is_reidentify_close(code) {
            Self::InvalidSession { resumable: false }
        } else {
            Self::Discord { code, reason }
        }
    }

    /// Whether the server may still hold our session after this close.
    pub fn keeps_session(&self) -> bool {
        let mut keeps = false;
        on_close(self, |r| keeps = r == Restart::Resume);
        keeps
    }
}

/// Decides whether and how to restart after `close`.
///
/// `restart` runs at most once, with the resume or re-identify instruction.
/// User closes, explicit resets, fatal codes and exhausted retries never
/// restart.
pub fn on_close(close: &Close, restart: impl FnOnce(Restart)) {
    match close {
        Close::Reconnecting | Close::Timeout | Close::InvalidSession { resumable: true } => {
            restart(Restart::Resume)
        }
        Close::InvalidSession { resumable: false } => restart(Restart::Identify),
        Close::Discord { code, .. } if !is_fatal_close(*code) => restart(Restart::Resume),
        Close::Discord { .. } | Close::UserClose | Close::SessionReset | Close::RetryLimitReached => {}
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Disconnected,
    Connecting,
    Identifying,
    Resuming,
    Ready,
    Reconnecting,
    Closed,
}

/// Lifecycle events published by the voice gateway.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    Hello { heartbeat_interval_ms: u64 },
    Ready(Ready),
    SessionDescription(Arc<SessionDescription>),
    Resumed,
    HeartbeatAck { latency_ms: u64 },
    ClientDisconnect { user_id: UserId },
    Close(Close),
}
