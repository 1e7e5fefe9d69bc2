use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    common::types::{AnyResult, map_boxed_err},
    gateway::{
        constants::DEFAULT_VOICE_MODE,
        encryption::XSalsa20Poly1305Codec,
        packet::{DecryptedPacket, EncryptedPacket, RtpPacket},
        poller::{AudioFramePoller, AudioFramePollerConfiguration},
        session::{Close, SessionDescription, VoiceEvent, VoiceGateway},
        udp_link::{UdpConnectionConfig, VoiceUdpConnection},
    },
    protocol::{
        gateway::Gateway,
        models::{Ready, SelectProtocol, VoiceCommand},
    },
    voice::{
        audio::AudioProvider,
        interceptor::{FrameInterceptorContext, FrameInterceptorFactory},
    },
};

/// Brings the media path up and down as the voice gateway moves through its
/// lifecycle: UDP and IP discovery on Ready, the poller and inbound decryption
/// once a key is known, teardown on close.
pub struct UdpLifeCycleHandler {
    gateway: Arc<dyn Gateway>,
    voice_gateway: Arc<VoiceGateway>,
    udp: Arc<VoiceUdpConnection>,
    poller: Arc<AudioFramePoller>,
    provider: Arc<dyn AudioProvider>,
    interceptor_factory: FrameInterceptorFactory,
    incoming: broadcast::Sender<DecryptedPacket>,
    frame_interval: Duration,
    ip_discovery_timeout: Duration,
    receiver: Option<(CancellationToken, JoinHandle<()>)>,
}

impl UdpLifeCycleHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<dyn Gateway>,
        voice_gateway: Arc<VoiceGateway>,
        udp: Arc<VoiceUdpConnection>,
        poller: Arc<AudioFramePoller>,
        provider: Arc<dyn AudioProvider>,
        interceptor_factory: FrameInterceptorFactory,
        incoming: broadcast::Sender<DecryptedPacket>,
        frame_interval: Duration,
        ip_discovery_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            voice_gateway,
            udp,
            poller,
            provider,
            interceptor_factory,
            incoming,
            frame_interval,
            ip_discovery_timeout,
            receiver: None,
        }
    }

    pub fn spawn(
        mut self,
        mut events: broadcast::Receiver<VoiceEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };

                match event {
                    Ok(event) => self.handle(event).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("[{}] Missed {} voice events", self.guild(), n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            self.stop_media().await;
            self.udp.stop().await;
            debug!("[{}] UDP lifecycle handler exited", self.guild());
        })
    }

    fn guild(&self) -> crate::common::types::GuildId {
        self.voice_gateway.guild_id()
    }

    pub async fn handle(&mut self, event: VoiceEvent) {
        match event {
            VoiceEvent::Ready(ready) => {
                if let Err(e) = self.on_ready(&ready).await {
                    error!("[{}] UDP setup failed: {}", self.guild(), e);
                    if let Err(e) = self
                        .voice_gateway
                        .request_restart(Close::InvalidSession { resumable: false })
                    {
                        warn!("[{}] Could not request re-identify: {}", self.guild(), e);
                    }
                }
            }
            VoiceEvent::SessionDescription(description) => {
                if let Err(e) = self.start_media(description).await {
                    error!("[{}] Media start failed: {}", self.guild(), e);
                }
            }
            VoiceEvent::Resumed => {
                let Some(description) = self.voice_gateway.session_description() else {
                    return;
                };
                if !self.udp.is_started() {
                    return;
                }
                if let Err(e) = self.start_media(description).await {
                    error!("[{}] Media restart after resume failed: {}", self.guild(), e);
                }
            }
            VoiceEvent::Close(close) => {
                self.stop_media().await;
                if !close.keeps_session() {
                    self.udp.stop().await;
                }
            }
            _ => {}
        }
    }

    async fn on_ready(&mut self, ready: &Ready) -> AnyResult<()> {
        self.stop_media().await;

        if !ready.modes.is_empty() && !ready.modes.iter().any(|m| m == DEFAULT_VOICE_MODE) {
            warn!(
                "[{}] Server does not advertise {} (offers {:?})",
                self.guild(),
                DEFAULT_VOICE_MODE,
                ready.modes
            );
        }

        let server = resolve(&ready.ip, ready.port).await?;
        self.udp
            .start(UdpConnectionConfig {
                server,
                ssrc: ready.ssrc,
            })
            .await?;

        let discovered = tokio::time::timeout(self.ip_discovery_timeout, self.udp.discover_ip())
            .await
            .map_err(|_| map_boxed_err("IP discovery timed out"))??;
        info!(
            "[{}] Discovered external address {}:{}",
            self.guild(),
            discovered.ip,
            discovered.port
        );

        self.voice_gateway
            .send(VoiceCommand::SelectProtocol(SelectProtocol::udp(
                discovered.ip,
                discovered.port,
                DEFAULT_VOICE_MODE,
            )))
    }

    async fn start_media(&mut self, description: Arc<SessionDescription>) -> AnyResult<()> {
        if description.mode != DEFAULT_VOICE_MODE {
            return Err(map_boxed_err(format!(
                "unsupported encryption mode {}",
                description.mode
            )));
        }
        let codec = XSalsa20Poly1305Codec::new(&description.secret_key)?;

        self.stop_receiver().await;
        self.receiver = Some(spawn_receiver(
            self.udp.incoming(),
            codec,
            self.incoming.clone(),
        ));

        self.poller
            .start(AudioFramePollerConfiguration {
                provider: self.provider.clone(),
                interceptor_factory: self.interceptor_factory.clone(),
                interceptor_context: FrameInterceptorContext {
                    gateway: self.gateway.clone(),
                    voice_gateway: self.voice_gateway.clone(),
                    ssrc: description.ssrc,
                },
                udp: self.udp.clone(),
                description,
                frame_interval: self.frame_interval,
            })
            .await;
        Ok(())
    }

    async fn stop_media(&mut self) {
        self.poller.stop().await;
        self.stop_receiver().await;
    }

    async fn stop_receiver(&mut self) {
        if let Some((cancel, task)) = self.receiver.take() {
            cancel.cancel();
            let _ = task.await;
        }
    }
}

async fn resolve(host: &str, port: u16) -> AnyResult<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(map_boxed_err)?
        .next()
        .ok_or_else(|| map_boxed_err(format!("voice server {}:{} did not resolve", host, port)))
}

/// Decrypts every RTP datagram from `datagrams` and republishes it on `out`.
///
/// Datagrams that are not voice RTP (discovery replies, RTCP) or fail
/// authentication are dropped.
pub fn spawn_receiver(
    mut datagrams: broadcast::Receiver<Bytes>,
    codec: XSalsa20Poly1305Codec,
    out: broadcast::Sender<DecryptedPacket>,
) -> (CancellationToken, JoinHandle<()>) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        loop {
            let datagram = tokio::select! {
                _ = token.cancelled() => break,
                datagram = datagrams.recv() => datagram,
            };

            let datagram = match datagram {
                Ok(d) => d,
                Err(RecvError::Lagged(n)) => {
                    warn!("Inbound audio lagged, dropped {} datagrams", n);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let packet = match EncryptedPacket::parse(&datagram) {
                Ok(p) => p,
                Err(e) => {
                    trace!("Ignoring non-voice datagram: {}", e);
                    continue;
                }
            };

            match packet.decrypt(&codec) {
                Ok(decrypted) => {
                    let _ = out.send(decrypted);
                }
                Err(e) => debug!(
                    "Dropping packet seq={} from SSRC {}: {}",
                    packet.sequence(),
                    packet.ssrc(),
                    e
                ),
            }
        }
    });

    (cancel, task)
}

#[cfg(test)]
mod tests {
    use tokio::net::UdpSocket;

    use super::*;
    use crate::{
        common::types::GuildId,
        gateway::{constants::RTP_HEADER_LEN, session::GatewayStatus},
        protocol::gateway::LocalGateway,
        voice::{audio::silence, interceptor::default_interceptor_factory},
    };

    const KEY: [u8; 32] = [3u8; 32];

    #[tokio::test]
    async fn test_receiver_decrypts_and_skips_garbage() {
        let (tx, rx) = broadcast::channel(16);
        let (out, mut decoded) = broadcast::channel(16);
        let codec = XSalsa20Poly1305Codec::new(&KEY).unwrap();
        let (cancel, task) = spawn_receiver(rx, codec.clone(), out);

        let sealed = DecryptedPacket::new(9, 960, 1234, vec![0xAA, 0xBB])
            .encrypt(&codec)
            .unwrap();
        let mut tampered = sealed.to_bytes().to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;

        tx.send(Bytes::from_static(&[0u8; 74])).unwrap();
        tx.send(Bytes::from(tampered)).unwrap();
        tx.send(sealed.to_bytes()).unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(5), decoded.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.sequence(), 9);
        assert_eq!(packet.ssrc(), 1234);
        assert_eq!(packet.payload().as_ref(), &[0xAA, 0xBB]);
        assert!(sealed.to_bytes().len() > RTP_HEADER_LEN);

        cancel.cancel();
        task.await.unwrap();
        assert!(decoded.try_recv().is_err());
    }

    fn handler(udp: Arc<VoiceUdpConnection>, poller: Arc<AudioFramePoller>) -> UdpLifeCycleHandler {
        let (gateway, _commands) = LocalGateway::new(8);
        let (incoming, _) = broadcast::channel(16);
        UdpLifeCycleHandler::new(
            Arc::new(gateway),
            Arc::new(VoiceGateway::new(GuildId(1))),
            udp,
            poller,
            silence(),
            default_interceptor_factory(0),
            incoming,
            Duration::from_millis(20),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_ready_without_discovery_reply_fails() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();

        let udp = Arc::new(VoiceUdpConnection::new());
        let mut handler = handler(udp.clone(), Arc::new(AudioFramePoller::new()));
        let ready = Ready {
            ssrc: 42,
            ip: addr.ip().to_string(),
            port: addr.port(),
            modes: vec![DEFAULT_VOICE_MODE.into()],
        };

        let err = handler.on_ready(&ready).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(udp.config().map(|c| c.ssrc), Some(42));
        assert_eq!(handler.voice_gateway.status(), GatewayStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_session_description_starts_and_close_stops_media() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp = Arc::new(VoiceUdpConnection::new());
        udp.start(UdpConnectionConfig {
            server: server.local_addr().unwrap(),
            ssrc: 42,
        })
        .await
        .unwrap();

        let poller = Arc::new(AudioFramePoller::new());
        let mut handler = handler(udp.clone(), poller.clone());

        handler
            .handle(VoiceEvent::SessionDescription(Arc::new(SessionDescription {
                ssrc: 42,
                mode: DEFAULT_VOICE_MODE.into(),
                secret_key: KEY,
            })))
            .await;
        assert!(poller.is_running().await);
        assert!(handler.receiver.is_some());

        handler.handle(VoiceEvent::Close(Close::Reconnecting)).await;
        assert!(!poller.is_running().await);
        assert!(handler.receiver.is_none());
        assert!(udp.is_started(), "a resumable close keeps the UDP link");

        handler.handle(VoiceEvent::Close(Close::UserClose)).await;
        assert!(!udp.is_started());
    }

    #[tokio::test]
    async fn test_unsupported_mode_is_rejected() {
        let poller = Arc::new(AudioFramePoller::new());
        let mut handler = handler(Arc::new(VoiceUdpConnection::new()), poller.clone());
        let result = handler
            .start_media(Arc::new(SessionDescription {
                ssrc: 42,
                mode: "aead_aes256_gcm_rtpsize".into(),
                secret_key: KEY,
            }))
            .await;
        assert!(result.is_err());
        assert!(!poller.is_running().await);
    }
}
