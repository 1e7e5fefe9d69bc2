pub mod audio;
pub mod connection;
pub mod handlers;
pub mod interceptor;

pub use audio::{AudioFrame, AudioProvider, ChannelAudioProvider};
pub use connection::{VoiceConnection, VoiceConnectionBuilder, VoiceConnectionData};
pub use interceptor::{
    DefaultFrameInterceptor, FrameInterceptor, FrameInterceptorContext, FrameInterceptorFactory,
};
