use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::{
    common::types::{AnyResult, map_boxed_err},
    protocol::events::{GatewayEvent, UpdateVoiceStatus},
};

/// What a voice connection needs from the primary gateway.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// A fresh subscription to voice-related dispatches.
    fn events(&self) -> broadcast::Receiver<GatewayEvent>;

    async fn send(&self, command: UpdateVoiceStatus) -> AnyResult<()>;
}

/// In-process gateway: events are injected with [`dispatch`](Self::dispatch)
/// and outgoing status updates land on the receiver returned by [`new`](Self::new).
pub struct LocalGateway {
    events: broadcast::Sender<GatewayEvent>,
    commands: mpsc::UnboundedSender<UpdateVoiceStatus>,
}

impl LocalGateway {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<UpdateVoiceStatus>) {
        let (events, _) = broadcast::channel(capacity);
        let (commands, rx) = mpsc::unbounded_channel();
        (Self { events, commands }, rx)
    }

    /// Returns how many subscribers saw the event.
    pub fn dispatch(&self, event: GatewayEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl Gateway for LocalGateway {
    fn events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: UpdateVoiceStatus) -> AnyResult<()> {
        debug!(
            "Voice status update for guild {}: channel={:?}",
            command.guild_id, command.channel_id
        );
        self.commands.send(command).map_err(map_boxed_err)
    }
}
