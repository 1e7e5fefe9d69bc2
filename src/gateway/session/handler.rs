use std::sync::{Arc, atomic::Ordering};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use super::{
    GatewayShared,
    heartbeat::{HeartbeatState, spawn_heartbeat, unix_millis},
};
use crate::{
    gateway::{
        constants::{DEFAULT_HEARTBEAT_INTERVAL_MS, SECRET_KEY_LEN},
        session::types::{Close, GatewayStatus, SessionDescription, VoiceEvent},
    },
    protocol::{
        models::{ClientDisconnect, Hello, Ready, SessionDescriptionPayload, VoiceGatewayMessage},
        opcodes,
    },
};

/// Per-connection protocol state: one instance per websocket.
pub(super) struct SessionState<'a> {
    shared: &'a GatewayShared,
    tx: UnboundedSender<Message>,
    control: UnboundedSender<Close>,
    heartbeat: Arc<HeartbeatState>,
    heartbeat_handle: Option<tokio::task::JoinHandle<()>>,
    ssrc: u32,
    established: bool,
}

impl<'a> SessionState<'a> {
    pub(super) fn new(
        shared: &'a GatewayShared,
        tx: UnboundedSender<Message>,
        control: UnboundedSender<Close>,
        heartbeat: Arc<HeartbeatState>,
    ) -> Self {
        Self {
            shared,
            tx,
            control,
            heartbeat,
            heartbeat_handle: None,
            ssrc: 0,
            established: false,
        }
    }

    /// True once this connection reached Ready (via session description or resume).
    pub(super) fn established(&self) -> bool {
        self.established
    }

    /// Returns `Some` when the frame ends the session.
    pub(super) fn handle_text(&mut self, text: &str) -> Option<Close> {
        let msg: VoiceGatewayMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "[{}] Failed to parse voice gateway message: {} - Text: {}",
                    self.shared.guild_id, e, text
                );
                return None;
            }
        };

        if let Some(seq) = msg.seq {
            self.heartbeat.seq_ack.store(seq, Ordering::Relaxed);
        }

        match msg.op {
            opcodes::HELLO => self.handle_hello(msg.d),
            opcodes::READY => self.handle_ready(msg.d),
            opcodes::SESSION_DESCRIPTION => self.handle_session_description(msg.d),
            opcodes::HEARTBEAT_ACK => self.handle_heartbeat_ack(),
            opcodes::RESUMED => self.handle_resumed(),
            opcodes::CLIENT_DISCONNECT => self.handle_client_disconnect(msg.d),
            _ => {
                debug!(
                    "[{}] Received voice op {}: {:?}",
                    self.shared.guild_id, msg.op, msg.d
                );
                None
            }
        }
    }

    fn parse<T: DeserializeOwned>(&self, op: u8, d: Value) -> Option<T> {
        match serde_json::from_value(d) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(
                    "[{}] Malformed payload for voice op {}: {}",
                    self.shared.guild_id, op, e
                );
                None
            }
        }
    }

    fn handle_hello(&mut self, d: Value) -> Option<Close> {
        let interval = self
            .parse::<Hello>(opcodes::HELLO, d)
            .map(|h| h.heartbeat_interval as u64)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);

        if let Some(h) = self.heartbeat_handle.take() {
            h.abort();
        }
        self.heartbeat.ack_pending.store(false, Ordering::Release);

        debug!(
            "[{}] Heartbeat interval set to {}ms",
            self.shared.guild_id, interval
        );
        self.heartbeat_handle = Some(spawn_heartbeat(
            self.tx.clone(),
            self.control.clone(),
            self.heartbeat.clone(),
            interval,
        ));
        self.shared.emit(VoiceEvent::Hello {
            heartbeat_interval_ms: interval,
        });
        None
    }

    fn handle_ready(&mut self, d: Value) -> Option<Close> {
        let Some(ready) = self.parse::<Ready>(opcodes::READY, d) else {
            return Some(Close::InvalidSession { resumable: false });
        };
        self.ssrc = ready.ssrc;

        debug!(
            "[{}] Ready! IP: {}, Port: {}, SSRC: {}, Modes: {:?}",
            self.shared.guild_id, ready.ip, ready.port, ready.ssrc, ready.modes
        );
        self.shared.emit(VoiceEvent::Ready(ready));
        None
    }

    fn handle_session_description(&mut self, d: Value) -> Option<Close> {
        let payload = self.parse::<SessionDescriptionPayload>(opcodes::SESSION_DESCRIPTION, d)?;

        let Ok(secret_key) = <[u8; SECRET_KEY_LEN]>::try_from(payload.secret_key.as_slice()) else {
            error!(
                "[{}] Invalid secret_key length {} in session_description",
                self.shared.guild_id,
                payload.secret_key.len()
            );
            return Some(Close::InvalidSession { resumable: false });
        };

        let description = Arc::new(SessionDescription {
            ssrc: self.ssrc,
            mode: payload.mode,
            secret_key,
        });
        debug!(
            "[{}] Session description received (mode {})",
            self.shared.guild_id, description.mode
        );

        *self.shared.session.write() = Some(description.clone());
        self.established = true;
        self.shared.set_status(GatewayStatus::Ready);
        self.shared.emit(VoiceEvent::SessionDescription(description));
        None
    }

    fn handle_heartbeat_ack(&self) -> Option<Close> {
        self.heartbeat.ack_pending.store(false, Ordering::Release);

        let sent_ms = self.heartbeat.last_sent_ms.load(Ordering::Relaxed);
        if sent_ms > 0 {
            let latency = unix_millis().saturating_sub(sent_ms);
            self.shared.ping.store(latency as i64, Ordering::Relaxed);
            self.shared.emit(VoiceEvent::HeartbeatAck {
                latency_ms: latency,
            });
        }
        None
    }

    fn handle_resumed(&mut self) -> Option<Close> {
        info!(
            "[{}] Voice session resumed successfully",
            self.shared.guild_id
        );
        self.established = true;
        self.shared.set_status(GatewayStatus::Ready);
        self.shared.emit(VoiceEvent::Resumed);
        None
    }

    fn handle_client_disconnect(&self, d: Value) -> Option<Close> {
        let ClientDisconnect { user_id } = self.parse(opcodes::CLIENT_DISCONNECT, d)?;
        self.shared.emit(VoiceEvent::ClientDisconnect { user_id });
        None
    }
}

impl<'a> Drop for SessionState<'a> {
    fn drop(&mut self) {
        if let Some(h) = self.heartbeat_handle.take() {
            h.abort();
        }
    }
}
