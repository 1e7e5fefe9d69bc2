use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
};

use tokio::sync::mpsc::UnboundedSender;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{trace, warn};

use crate::{
    gateway::session::types::Close,
    protocol::{models::Heartbeat, models::VoiceGatewayMessage, opcodes},
};

pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Shared between the heartbeat task and the session that reads acks.
#[derive(Default)]
pub(crate) struct HeartbeatState {
    pub seq_ack: Arc<AtomicI64>,
    pub last_sent_ms: AtomicU64,
    pub ack_pending: AtomicBool,
}

/// Sends op 3 every `interval_ms`. If the previous beat is still unacknowledged
/// when the next one is due, asks the session to end with [`Close::Timeout`].
pub(crate) fn spawn_heartbeat(
    tx_hb: UnboundedSender<Message>,
    control: UnboundedSender<Close>,
    state: Arc<HeartbeatState>,
    interval_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = tokio::time::Duration::from_millis(interval_ms.max(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;

            if state.ack_pending.swap(true, Ordering::AcqRel) {
                warn!("Voice heartbeat not acknowledged within {}ms", interval_ms);
                let _ = control.send(Close::Timeout);
                break;
            }

            let now_ms = unix_millis();
            state.last_sent_ms.store(now_ms, Ordering::Relaxed);

            let hb = Heartbeat {
                t: now_ms,
                seq_ack: state.seq_ack.load(Ordering::Relaxed),
            };
            let Ok(msg) = VoiceGatewayMessage::new(opcodes::HEARTBEAT, &hb) else {
                continue;
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                trace!("Sending voice heartbeat (seq_ack {})", hb.seq_ack);
                if tx_hb.send(Message::Text(json.into())).is_err() {
                    break; // session ending
                }
            }
        }
    })
}
