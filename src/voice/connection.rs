//! The public face of the crate: one [`VoiceConnection`] per guild.

use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    common::types::{AnyResult, ChannelId, GuildId, UserId, map_boxed_err},
    configs::voice::VoiceConfig,
    gateway::{
        constants::{
            CONNECT_TIMEOUT_MS, FRAME_DURATION_MS, IP_DISCOVERY_TIMEOUT_MS,
            TRAILING_SILENCE_FRAMES, UDP_BROADCAST_CAPACITY,
        },
        packet::DecryptedPacket,
        poller::AudioFramePoller,
        session::{VoiceGateway, VoiceGatewayConfiguration},
        udp_link::VoiceUdpConnection,
    },
    protocol::{
        events::{GatewayEvent, UpdateVoiceStatus, VoiceServerUpdate, VoiceState},
        gateway::Gateway,
    },
    voice::{
        audio::{AudioProvider, SwappableAudioProvider, silence},
        handlers::{UdpLifeCycleHandler, VoiceUpdateEventHandler},
        interceptor::{FrameInterceptorFactory, default_interceptor_factory},
    },
};

/// Who we are and where; fixed for the life of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceConnectionData {
    pub self_id: UserId,
    pub guild_id: GuildId,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    self_mute: bool,
    self_deaf: bool,
    frame_interval: Duration,
    ip_discovery_timeout: Duration,
}

pub struct VoiceConnectionBuilder {
    gateway: Arc<dyn Gateway>,
    data: VoiceConnectionData,
    channel_id: ChannelId,
    options: ConnectionOptions,
    timeout: Duration,
    trailing_silence_frames: u32,
    provider: Option<Arc<dyn AudioProvider>>,
    interceptor_factory: Option<FrameInterceptorFactory>,
}

impl VoiceConnectionBuilder {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        guild_id: GuildId,
        channel_id: ChannelId,
        self_id: UserId,
    ) -> Self {
        Self {
            gateway,
            data: VoiceConnectionData { self_id, guild_id },
            channel_id,
            options: ConnectionOptions {
                self_mute: false,
                self_deaf: false,
                frame_interval: Duration::from_millis(FRAME_DURATION_MS),
                ip_discovery_timeout: Duration::from_millis(IP_DISCOVERY_TIMEOUT_MS),
            },
            timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            trailing_silence_frames: TRAILING_SILENCE_FRAMES,
            provider: None,
            interceptor_factory: None,
        }
    }

    pub fn from_config(gateway: Arc<dyn Gateway>, config: &VoiceConfig) -> Self {
        Self::new(gateway, config.guild_id, config.channel_id, config.user_id)
            .self_mute(config.self_mute)
            .self_deaf(config.self_deaf)
            .timeout(Duration::from_millis(config.connect_timeout_ms))
            .ip_discovery_timeout(Duration::from_millis(config.ip_discovery_timeout_ms))
            .frame_interval(Duration::from_millis(config.frame_interval_ms))
            .trailing_silence_frames(config.trailing_silence_frames)
    }

    pub fn self_mute(mut self, mute: bool) -> Self {
        self.options.self_mute = mute;
        self
    }

    pub fn self_deaf(mut self, deaf: bool) -> Self {
        self.options.self_deaf = deaf;
        self
    }

    /// How long [`build`](Self::build) waits for the voice state and server updates.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ip_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.options.ip_discovery_timeout = timeout;
        self
    }

    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.options.frame_interval = interval;
        self
    }

    pub fn trailing_silence_frames(mut self, frames: u32) -> Self {
        self.trailing_silence_frames = frames;
        self
    }

    pub fn audio_provider(mut self, provider: Arc<dyn AudioProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn interceptor_factory(mut self, factory: FrameInterceptorFactory) -> Self {
        self.interceptor_factory = Some(factory);
        self
    }

    /// Joins the channel and waits until the primary gateway has told us our
    /// voice session id and which voice server to use.
    ///
    /// The returned connection is not yet connected; call
    /// [`VoiceConnection::connect`].
    pub async fn build(self) -> AnyResult<VoiceConnection> {
        let mut events = self.gateway.events();
        self.gateway
            .send(UpdateVoiceStatus {
                guild_id: self.data.guild_id,
                channel_id: Some(self.channel_id),
                self_mute: self.options.self_mute,
                self_deaf: self.options.self_deaf,
            })
            .await?;

        let (state, server) = tokio::time::timeout(
            self.timeout,
            await_voice_updates(&mut events, self.data),
        )
        .await
        .map_err(|_| {
            map_boxed_err(format!(
                "[{}] timed out waiting for voice state and server updates",
                self.data.guild_id
            ))
        })??;

        let configuration = VoiceGatewayConfiguration {
            token: server.token,
            endpoint: server.endpoint.unwrap_or_default(),
            session_id: state.session_id.into(),
            server_id: self.data.guild_id,
            self_id: self.data.self_id,
        };
        debug!(
            "[{}] Voice server assigned: {}",
            self.data.guild_id, configuration.endpoint
        );

        Ok(VoiceConnection::new(
            self.gateway,
            self.data,
            configuration,
            self.options,
            self.provider.unwrap_or_else(silence),
            self.interceptor_factory
                .unwrap_or_else(|| default_interceptor_factory(self.trailing_silence_frames)),
        ))
    }
}

async fn await_voice_updates(
    events: &mut broadcast::Receiver<GatewayEvent>,
    data: VoiceConnectionData,
) -> AnyResult<(VoiceState, VoiceServerUpdate)> {
    let mut state: Option<VoiceState> = None;
    let mut server: Option<VoiceServerUpdate> = None;

    loop {
        match events.recv().await {
            Ok(GatewayEvent::VoiceStateUpdate(s))
                if s.guild_id == data.guild_id && s.user_id == data.self_id =>
            {
                state = Some(s);
            }
            Ok(GatewayEvent::VoiceServerUpdate(s))
                if s.guild_id == data.guild_id && s.endpoint.is_some() =>
            {
                server = Some(s);
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => {
                return Err(map_boxed_err("primary gateway event stream closed"));
            }
        }

        if let Some(pair) = state.clone().zip(server.clone()) {
            return Ok(pair);
        }
    }
}

/// A voice connection to one guild.
///
/// Owns the UDP session, the frame poller and the handler tasks; shares the
/// primary gateway and the voice gateway.
pub struct VoiceConnection {
    data: VoiceConnectionData,
    gateway: Arc<dyn Gateway>,
    voice_gateway: Arc<VoiceGateway>,
    udp: Arc<VoiceUdpConnection>,
    poller: Arc<AudioFramePoller>,
    configuration: Arc<RwLock<Arc<VoiceGatewayConfiguration>>>,
    provider: Arc<SwappableAudioProvider>,
    incoming: broadcast::Sender<DecryptedPacket>,
    options: ConnectionOptions,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceConnection {
    fn new(
        gateway: Arc<dyn Gateway>,
        data: VoiceConnectionData,
        configuration: VoiceGatewayConfiguration,
        options: ConnectionOptions,
        provider: Arc<dyn AudioProvider>,
        interceptor_factory: FrameInterceptorFactory,
    ) -> Self {
        let voice_gateway = Arc::new(VoiceGateway::new(data.guild_id));
        let udp = Arc::new(VoiceUdpConnection::new());
        let poller = Arc::new(AudioFramePoller::new());
        let configuration = Arc::new(RwLock::new(Arc::new(configuration)));
        let provider = Arc::new(SwappableAudioProvider::new(provider));
        let (incoming, _) = broadcast::channel(UDP_BROADCAST_CAPACITY);
        let cancel = CancellationToken::new();

        let voice_updates = VoiceUpdateEventHandler::new(
            data,
            configuration.clone(),
            voice_gateway.clone(),
        )
        .spawn(gateway.events(), cancel.child_token());

        let lifecycle = UdpLifeCycleHandler::new(
            gateway.clone(),
            voice_gateway.clone(),
            udp.clone(),
            poller.clone(),
            provider.clone(),
            interceptor_factory,
            incoming.clone(),
            options.frame_interval,
            options.ip_discovery_timeout,
        )
        .spawn(voice_gateway.events(), cancel.child_token());

        Self {
            data,
            gateway,
            voice_gateway,
            udp,
            poller,
            configuration,
            provider,
            incoming,
            options,
            cancel,
            tasks: Mutex::new(vec![voice_updates, lifecycle]),
        }
    }

    pub fn data(&self) -> VoiceConnectionData {
        self.data
    }

    pub fn voice_gateway(&self) -> &Arc<VoiceGateway> {
        &self.voice_gateway
    }

    pub fn udp(&self) -> &Arc<VoiceUdpConnection> {
        &self.udp
    }

    /// Snapshot of the credentials the next (re)connect will use.
    pub fn configuration(&self) -> Arc<VoiceGatewayConfiguration> {
        self.configuration.read().clone()
    }

    /// Connects (or reconnects) the voice gateway with the current configuration.
    pub async fn connect(&self) -> AnyResult<()> {
        let configuration = self.configuration();
        info!(
            "[{}] Connecting to voice server {}",
            self.data.guild_id, configuration.endpoint
        );
        self.voice_gateway.start(configuration).await
    }

    /// Closes the voice gateway and the media path but stays in the channel.
    pub async fn disconnect(&self) {
        self.voice_gateway.stop().await;
        self.poller.stop().await;
        self.udp.stop().await;
    }

    /// Disconnects and asks the primary gateway to leave the channel.
    pub async fn leave(&self) -> AnyResult<()> {
        self.disconnect().await;
        self.send_status(None).await
    }

    /// Asks the primary gateway to move us; the resulting voice updates are
    /// picked up by the connection's handlers. `None` leaves.
    pub async fn move_to(&self, channel_id: Option<ChannelId>) -> AnyResult<()> {
        match channel_id {
            Some(channel_id) => self.send_status(Some(channel_id)).await,
            None => self.leave().await,
        }
    }

    /// Takes effect on the next frame tick.
    pub fn set_audio_provider(&self, provider: Arc<dyn AudioProvider>) {
        self.provider.replace(provider);
    }

    /// Decrypted audio from every speaker in the channel.
    pub fn incoming_audio(&self) -> broadcast::Receiver<DecryptedPacket> {
        self.incoming.subscribe()
    }

    /// Stops every task owned by this connection. The channel is not left.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.disconnect().await;
        debug!("[{}] Voice connection shut down", self.data.guild_id);
    }

    async fn send_status(&self, channel_id: Option<ChannelId>) -> AnyResult<()> {
        self.gateway
            .send(UpdateVoiceStatus {
                guild_id: self.data.guild_id,
                channel_id,
                self_mute: self.options.self_mute,
                self_deaf: self.options.self_deaf,
            })
            .await
    }
}

impl Drop for VoiceConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
