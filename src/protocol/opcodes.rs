//! Voice gateway opcodes (v8) and close codes.

pub const IDENTIFY: u8 = 0;
pub const SELECT_PROTOCOL: u8 = 1;
pub const READY: u8 = 2;
pub const HEARTBEAT: u8 = 3;
pub const SESSION_DESCRIPTION: u8 = 4;
pub const SPEAKING: u8 = 5;
pub const HEARTBEAT_ACK: u8 = 6;
pub const RESUME: u8 = 7;
pub const HELLO: u8 = 8;
pub const RESUMED: u8 = 9;
pub const CLIENTS_CONNECT: u8 = 11;
pub const CLIENT_DISCONNECT: u8 = 13;

/// Primary gateway opcode for Voice State Update.
pub const GATEWAY_VOICE_STATE_UPDATE: u8 = 4;

pub mod close {
    pub const UNKNOWN_OPCODE: u16 = 4001;
    pub const DECODE_ERROR: u16 = 4002;
    pub const NOT_AUTHENTICATED: u16 = 4003;
    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const ALREADY_AUTHENTICATED: u16 = 4005;
    pub const SESSION_NO_LONGER_VALID: u16 = 4006;
    pub const SESSION_TIMEOUT: u16 = 4009;
    pub const SERVER_NOT_FOUND: u16 = 4011;
    pub const UNKNOWN_PROTOCOL: u16 = 4012;
    pub const DISCONNECTED: u16 = 4014;
    pub const VOICE_SERVER_CRASHED: u16 = 4015;
    pub const UNKNOWN_ENCRYPTION_MODE: u16 = 4016;
}
