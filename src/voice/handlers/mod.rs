mod udp_lifecycle;
mod voice_update;

pub use udp_lifecycle::{UdpLifeCycleHandler, spawn_receiver};
pub use voice_update::VoiceUpdateEventHandler;
