pub mod constants;
pub mod encryption;
pub mod packet;
pub mod poller;
pub mod session;
pub mod udp_link;

pub use encryption::{CodecError, XSalsa20Poly1305Codec};
pub use packet::{AudioPacket, DecryptedPacket, EncryptedPacket, RtpPacket};
pub use poller::{AudioFramePoller, AudioFramePollerConfiguration};
pub use session::VoiceGateway;
pub use udp_link::VoiceUdpConnection;
