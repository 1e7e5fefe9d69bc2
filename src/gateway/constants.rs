/// Discord Voice Gateway version to use in the WebSocket URL.
pub const VOICE_GATEWAY_VERSION: u8 = 8;

/// The only encryption mode this client negotiates.
pub const DEFAULT_VOICE_MODE: &str = "xsalsa20_poly1305";

/// Maximum reconnect attempts before giving up on a voice session.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay (ms) for the exponential backoff on reconnect.
pub const BACKOFF_BASE_MS: u64 = 1_000;

/// Fixed delay (ms) before a fresh Identify after a session-invalid close.
pub const RECONNECT_DELAY_FRESH_MS: u64 = 500;

/// Timeout (ms) allowed for the WS write task to shut down gracefully.
pub const WRITE_TASK_SHUTDOWN_MS: u64 = 500;

/// Heartbeat interval (ms) assumed when Hello omits one.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 41_250;

/// First byte of every RTP header: version 2, no padding/extension/CSRC.
pub const RTP_TYPE_BYTE: u8 = 0x90;

/// Second byte of every RTP header: payload type 120 (opus).
pub const RTP_VERSION_BYTE: u8 = 0x78;

pub const RTP_HEADER_LEN: usize = 12;

/// XSalsa20 nonces are 24 bytes; the RTP header fills the first 12.
pub const NONCE_LEN: usize = 24;

pub const SECRET_KEY_LEN: usize = 32;

/// 48 kHz * 20 ms.
pub const RTP_TIMESTAMP_STEP: u32 = 960;

pub const FRAME_DURATION_MS: u64 = 20;

/// Silence frames sent after audio stops, before Speaking is cleared.
pub const TRAILING_SILENCE_FRAMES: u32 = 5;

/// Opus encoding of 20 ms of silence.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// 4-byte SSRC followed by 66 bytes of padding.
pub const DISCOVERY_PACKET_SIZE: usize = 70;

pub const DISCOVERY_ADDRESS_LEN: usize = 64;

pub const IP_DISCOVERY_TIMEOUT_MS: u64 = 5_000;

pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Datagrams buffered per subscriber before the oldest are dropped.
pub const UDP_BROADCAST_CAPACITY: usize = 256;

pub const UDP_RECV_BUF_SIZE: usize = 2_048;

/// Capacity of the voice gateway event broadcast.
pub const VOICE_EVENT_CAPACITY: usize = 64;
