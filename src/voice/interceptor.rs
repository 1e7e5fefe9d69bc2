use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    gateway::{constants::TRAILING_SILENCE_FRAMES, session::VoiceGateway},
    protocol::{
        gateway::Gateway,
        models::{SPEAKING_MICROPHONE, Speaking, VoiceCommand},
    },
    voice::audio::AudioFrame,
};

/// What an interceptor gets to work with. Built fresh for every poller start.
#[derive(Clone)]
pub struct FrameInterceptorContext {
    pub gateway: Arc<dyn Gateway>,
    pub voice_gateway: Arc<VoiceGateway>,
    pub ssrc: u32,
}

/// Sits between the provider and the encryptor. Sees every tick, including
/// the ones where the provider had nothing.
#[async_trait]
pub trait FrameInterceptor: Send {
    async fn intercept(&mut self, frame: Option<AudioFrame>) -> Option<AudioFrame>;
}

pub type FrameInterceptorFactory =
    Arc<dyn Fn(FrameInterceptorContext) -> Box<dyn FrameInterceptor> + Send + Sync>;

pub fn default_interceptor_factory(trailing_silence_frames: u32) -> FrameInterceptorFactory {
    Arc::new(
        move |context: FrameInterceptorContext| -> Box<dyn FrameInterceptor> {
            Box::new(DefaultFrameInterceptor::new(context, trailing_silence_frames))
        },
    )
}

/// Toggles the speaking flag around bursts of audio and pads each burst with
/// a few silence frames so the receiver's decoder does not interpolate.
pub struct DefaultFrameInterceptor {
    context: FrameInterceptorContext,
    trailing_silence: u32,
    silence_left: u32,
    speaking: bool,
}

impl DefaultFrameInterceptor {
    pub fn new(context: FrameInterceptorContext, trailing_silence: u32) -> Self {
        Self {
            context,
            trailing_silence,
            silence_left: 0,
            speaking: false,
        }
    }

    pub fn with_defaults(context: FrameInterceptorContext) -> Self {
        Self::new(context, TRAILING_SILENCE_FRAMES)
    }

    /// The flag only changes once the update was handed to the gateway, so a
    /// failed Speaking(on) is retried on the next audio frame.
    fn set_speaking(&mut self, speaking: bool) {
        let command = VoiceCommand::Speaking(Speaking {
            speaking: if speaking { SPEAKING_MICROPHONE } else { 0 },
            delay: 0,
            ssrc: self.context.ssrc,
        });

        match self.context.voice_gateway.send(command) {
            Ok(()) => {
                debug!(
                    "[{}] Speaking {}",
                    self.context.voice_gateway.guild_id(),
                    if speaking { "on" } else { "off" }
                );
                self.speaking = speaking;
            }
            Err(e) => warn!(
                "[{}] Failed to send speaking update: {}",
                self.context.voice_gateway.guild_id(),
                e
            ),
        }
    }
}

#[async_trait]
impl FrameInterceptor for DefaultFrameInterceptor {
    async fn intercept(&mut self, frame: Option<AudioFrame>) -> Option<AudioFrame> {
        match frame {
            Some(frame) => {
                if !self.speaking {
                    self.set_speaking(true);
                }
                self.silence_left = self.trailing_silence;
                Some(frame)
            }
            None if self.silence_left > 0 => {
                self.silence_left -= 1;
                Some(AudioFrame::SILENCE)
            }
            None => {
                if self.speaking {
                    self.set_speaking(false);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::types::GuildId, protocol::gateway::LocalGateway};

    fn context() -> FrameInterceptorContext {
        let (gateway, _commands) = LocalGateway::new(8);
        FrameInterceptorContext {
            gateway: Arc::new(gateway),
            voice_gateway: Arc::new(VoiceGateway::new(GuildId(1))),
            ssrc: 42,
        }
    }

    #[tokio::test]
    async fn test_trailing_silence_after_audio() {
        let mut interceptor = DefaultFrameInterceptor::new(context(), 2);
        let audio = AudioFrame::from(vec![1, 2, 3]);

        assert_eq!(interceptor.intercept(None).await, None);
        assert_eq!(interceptor.intercept(Some(audio.clone())).await, Some(audio));
        assert_eq!(interceptor.intercept(None).await, Some(AudioFrame::SILENCE));
        assert_eq!(interceptor.intercept(None).await, Some(AudioFrame::SILENCE));
        assert_eq!(interceptor.intercept(None).await, None);
        assert_eq!(interceptor.intercept(None).await, None);
    }

    #[tokio::test]
    async fn test_new_audio_refills_silence_budget() {
        let mut interceptor = DefaultFrameInterceptor::with_defaults(context());
        let audio = AudioFrame::from(vec![9]);

        interceptor.intercept(Some(audio.clone())).await;
        interceptor.intercept(None).await;
        interceptor.intercept(Some(audio)).await;

        for _ in 0..TRAILING_SILENCE_FRAMES {
            assert_eq!(interceptor.intercept(None).await, Some(AudioFrame::SILENCE));
        }
        assert_eq!(interceptor.intercept(None).await, None);
    }

    #[tokio::test]
    async fn test_failed_speaking_update_is_retried() {
        // The voice gateway is not connected, so every send fails.
        let mut interceptor = DefaultFrameInterceptor::new(context(), 0);
        let audio = AudioFrame::from(vec![5]);

        assert_eq!(interceptor.intercept(Some(audio.clone())).await, Some(audio.clone()));
        assert!(!interceptor.speaking);

        // Still not speaking, so the next frame tries again and audio keeps flowing.
        assert_eq!(interceptor.intercept(Some(audio.clone())).await, Some(audio));
        assert!(!interceptor.speaking);
        assert_eq!(interceptor.intercept(None).await, None);
    }
}
