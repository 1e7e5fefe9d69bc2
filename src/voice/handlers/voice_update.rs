use std::sync::Arc;

use parking_lot::RwLock;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    common::types::AnyResult,
    gateway::session::{VoiceGateway, VoiceGatewayConfiguration},
    protocol::events::{GatewayEvent, VoiceServerUpdate, VoiceState},
    voice::connection::VoiceConnectionData,
};

/// Follows the primary gateway's voice dispatches for one guild and keeps the
/// voice gateway pointed at the right server.
pub struct VoiceUpdateEventHandler {
    data: VoiceConnectionData,
    configuration: Arc<RwLock<Arc<VoiceGatewayConfiguration>>>,
    voice_gateway: Arc<VoiceGateway>,
}

impl VoiceUpdateEventHandler {
    pub fn new(
        data: VoiceConnectionData,
        configuration: Arc<RwLock<Arc<VoiceGatewayConfiguration>>>,
        voice_gateway: Arc<VoiceGateway>,
    ) -> Self {
        Self {
            data,
            configuration,
            voice_gateway,
        }
    }

    pub fn spawn(
        self,
        mut events: broadcast::Receiver<GatewayEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(event) => {
                        if let Err(e) = self.handle(event).await {
                            warn!("[{}] Voice update handling failed: {}", self.data.guild_id, e);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("[{}] Missed {} primary gateway events", self.data.guild_id, n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("[{}] Voice update handler exited", self.data.guild_id);
        })
    }

    pub async fn handle(&self, event: GatewayEvent) -> AnyResult<()> {
        match event {
            GatewayEvent::VoiceStateUpdate(state) => self.on_voice_state(state).await,
            GatewayEvent::VoiceServerUpdate(update) => self.on_voice_server(update).await,
        }
    }

    async fn on_voice_state(&self, state: VoiceState) -> AnyResult<()> {
        if state.guild_id != self.data.guild_id || state.user_id != self.data.self_id {
            return Ok(());
        }

        if state.channel_id.is_none() {
            info!("[{}] Left voice channel, closing voice gateway", self.data.guild_id);
            self.voice_gateway.stop().await;
            return Ok(());
        }

        let current = self.configuration.read().clone();
        if *current.session_id != *state.session_id {
            debug!("[{}] Voice session id changed", self.data.guild_id);
            self.replace(VoiceGatewayConfiguration {
                session_id: state.session_id.into(),
                ..(*current).clone()
            });
        }
        Ok(())
    }

    async fn on_voice_server(&self, update: VoiceServerUpdate) -> AnyResult<()> {
        if update.guild_id != self.data.guild_id {
            return Ok(());
        }

        let current = self.configuration.read().clone();

        let Some(endpoint) = update.endpoint else {
            info!(
                "[{}] Voice server is going away, waiting for a new one",
                self.data.guild_id
            );
            self.voice_gateway.stop().await;
            self.replace(VoiceGatewayConfiguration {
                endpoint: String::new(),
                ..(*current).clone()
            });
            return Ok(());
        };

        if current.token == update.token && current.endpoint == endpoint {
            return Ok(());
        }

        info!("[{}] Voice server changed to {}", self.data.guild_id, endpoint);
        let next = Arc::new(VoiceGatewayConfiguration {
            token: update.token,
            endpoint,
            ..(*current).clone()
        });
        *self.configuration.write() = next.clone();

        self.voice_gateway.stop().await;
        self.voice_gateway.start(next).await
    }

    fn replace(&self, configuration: VoiceGatewayConfiguration) {
        *self.configuration.write() = Arc::new(configuration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::types::{ChannelId, GuildId, UserId},
        gateway::session::GatewayStatus,
    };

    const GUILD: GuildId = GuildId(41771983423143937);
    const ME: UserId = UserId(104694319306248192);

    fn handler() -> VoiceUpdateEventHandler {
        let configuration = Arc::new(RwLock::new(Arc::new(VoiceGatewayConfiguration {
            token: "old_token".into(),
            endpoint: "ws://127.0.0.1:1".into(),
            session_id: "old_session".into(),
            server_id: GUILD,
            self_id: ME,
        })));
        VoiceUpdateEventHandler::new(
            VoiceConnectionData {
                self_id: ME,
                guild_id: GUILD,
            },
            configuration,
            Arc::new(VoiceGateway::new(GUILD)),
        )
    }

    fn state(guild_id: GuildId, user_id: UserId, channel: Option<u64>, session: &str) -> GatewayEvent {
        GatewayEvent::VoiceStateUpdate(VoiceState {
            guild_id,
            channel_id: channel.map(ChannelId),
            user_id,
            session_id: session.into(),
        })
    }

    #[tokio::test]
    async fn test_new_session_id_replaces_configuration() {
        let handler = handler();
        handler
            .handle(state(GUILD, ME, Some(1), "new_session"))
            .await
            .unwrap();
        assert_eq!(&*handler.configuration.read().session_id, "new_session");
        assert_eq!(handler.configuration.read().token, "old_token");
    }

    #[tokio::test]
    async fn test_updates_for_others_are_ignored() {
        let handler = handler();
        handler
            .handle(state(GUILD, UserId(1), Some(1), "theirs"))
            .await
            .unwrap();
        handler
            .handle(state(GuildId(2), ME, Some(1), "elsewhere"))
            .await
            .unwrap();
        handler
            .handle(GatewayEvent::VoiceServerUpdate(VoiceServerUpdate {
                token: "other".into(),
                guild_id: GuildId(2),
                endpoint: Some("other.example".into()),
            }))
            .await
            .unwrap();

        let config = handler.configuration.read().clone();
        assert_eq!(&*config.session_id, "old_session");
        assert_eq!(config.token, "old_token");
        assert_eq!(handler.voice_gateway.status(), GatewayStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_changed_server_restarts_gateway() {
        let handler = handler();
        handler
            .handle(GatewayEvent::VoiceServerUpdate(VoiceServerUpdate {
                token: "new_token".into(),
                guild_id: GUILD,
                endpoint: Some("ws://127.0.0.1:9".into()),
            }))
            .await
            .unwrap();

        let config = handler.configuration.read().clone();
        assert_eq!(config.token, "new_token");
        assert_eq!(config.endpoint, "ws://127.0.0.1:9");
        assert_ne!(handler.voice_gateway.status(), GatewayStatus::Disconnected);
        handler.voice_gateway.stop().await;
    }

    #[tokio::test]
    async fn test_null_endpoint_stops_and_forgets_server() {
        let handler = handler();
        handler
            .handle(GatewayEvent::VoiceServerUpdate(VoiceServerUpdate {
                token: "old_token".into(),
                guild_id: GUILD,
                endpoint: None,
            }))
            .await
            .unwrap();
        assert!(handler.configuration.read().endpoint.is_empty());

        // The same server coming back counts as a change.
        handler
            .handle(GatewayEvent::VoiceServerUpdate(VoiceServerUpdate {
                token: "old_token".into(),
                guild_id: GUILD,
                endpoint: Some("ws://127.0.0.1:1".into()),
            }))
            .await
            .unwrap();
        assert_eq!(handler.configuration.read().endpoint, "ws://127.0.0.1:1");
        handler.voice_gateway.stop().await;
    }

    #[tokio::test]
    async fn test_leaving_channel_closes_gateway() {
        let handler = handler();
        handler
            .handle(GatewayEvent::VoiceServerUpdate(VoiceServerUpdate {
                token: "new_token".into(),
                guild_id: GUILD,
                endpoint: Some("ws://127.0.0.1:9".into()),
            }))
            .await
            .unwrap();
        handler.handle(state(GUILD, ME, None, "old_session")).await.unwrap();
        assert_eq!(handler.voice_gateway.status(), GatewayStatus::Closed);
    }
}
