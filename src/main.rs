use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use voxlink::{
    common::{logger, types::AnyResult},
    configs::Config,
    gateway::RtpPacket,
    protocol::{GatewayEvent, LocalGateway, VoiceServerUpdate, VoiceState},
    voice::{AudioFrame, ChannelAudioProvider, VoiceConnectionBuilder},
};

const FRAME_QUEUE: usize = 64;

/// Frames queued on startup so the server sees us speak once.
const GREETING_FRAMES: usize = 50;

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load()?;
    logger::init(&config);

    let voice = config.voice.clone();
    let Some(server) = voice.server.clone() else {
        return Err("[voice.server] must be set to run without a primary gateway".into());
    };

    let (gateway, mut commands) = LocalGateway::new(16);
    let gateway = Arc::new(gateway);

    // Answers every status update the way the primary gateway would, using
    // the configured credentials.
    let replay = {
        let gateway = gateway.clone();
        let user_id = voice.user_id;
        tokio::spawn(async move {
            while let Some(status) = commands.recv().await {
                info!(
                    "[{}] Voice status update: channel={:?}",
                    status.guild_id, status.channel_id
                );
                gateway.dispatch(GatewayEvent::VoiceStateUpdate(VoiceState {
                    guild_id: status.guild_id,
                    channel_id: status.channel_id,
                    user_id,
                    session_id: server.session_id.clone(),
                }));
                if status.channel_id.is_some() {
                    gateway.dispatch(GatewayEvent::VoiceServerUpdate(VoiceServerUpdate {
                        token: server.token.clone(),
                        guild_id: status.guild_id,
                        endpoint: Some(server.endpoint.clone()),
                    }));
                }
            }
        })
    };

    let (provider, frames) = ChannelAudioProvider::new(FRAME_QUEUE);
    let connection = VoiceConnectionBuilder::from_config(gateway.clone(), &voice)
        .audio_provider(Arc::new(provider))
        .build()
        .await?;
    connection.connect().await?;

    let mut incoming = connection.incoming_audio();
    let monitor = tokio::spawn(async move {
        let mut received: u64 = 0;
        loop {
            match incoming.recv().await {
                Ok(packet) => {
                    received += 1;
                    if received % 250 == 0 {
                        info!(
                            "Received {} voice packets (latest from SSRC {})",
                            received,
                            packet.ssrc()
                        );
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Inbound monitor skipped {} packets", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    for _ in 0..GREETING_FRAMES {
        if frames.try_send(AudioFrame::SILENCE).is_err() {
            break;
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down voice connection");

    if let Err(e) = connection.leave().await {
        warn!("Failed to leave voice channel: {}", e);
    }
    connection.shutdown().await;
    monitor.abort();
    replay.abort();

    Ok(())
}
