//! RTP framing for voice packets.
//!
//! A packet is either [`EncryptedPacket`] (as it travels over UDP) or
//! [`DecryptedPacket`] (as the poller and receivers see it). Moving between the
//! two always yields a new value; the header is rebuilt from the sequence,
//! timestamp and SSRC each time it is needed and doubles as the nonce source.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use crate::gateway::{
    constants::{RTP_HEADER_LEN, RTP_TYPE_BYTE, RTP_VERSION_BYTE},
    encryption::{CodecError, XSalsa20Poly1305Codec, nonce_from_header},
};

/// Serializes the 12-byte RTP header.
pub fn rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_LEN] {
    let mut header = [0u8; RTP_HEADER_LEN];
    header[0] = RTP_TYPE_BYTE;
    header[1] = RTP_VERSION_BYTE;
    BigEndian::write_u16(&mut header[2..4], sequence);
    BigEndian::write_u32(&mut header[4..8], timestamp);
    BigEndian::write_u32(&mut header[8..12], ssrc);
    header
}

/// Fields shared by both packet variants.
pub trait RtpPacket {
    fn sequence(&self) -> u16;
    fn timestamp(&self) -> u32;
    fn ssrc(&self) -> u32;
    fn payload(&self) -> &Bytes;

    fn header(&self) -> [u8; RTP_HEADER_LEN] {
        rtp_header(self.sequence(), self.timestamp(), self.ssrc())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPacket {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedPacket {
    sequence: u16,
    timestamp: u32,
    ssrc: u32,
    data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioPacket {
    Encrypted(EncryptedPacket),
    Decrypted(DecryptedPacket),
}

macro_rules! impl_rtp_packet {
    ($ty:ty) => {
        impl RtpPacket for $ty {
            fn sequence(&self) -> u16 {
                self.sequence
            }

            fn timestamp(&self) -> u32 {
                self.timestamp
            }

            fn ssrc(&self) -> u32 {
                self.ssrc
            }

            fn payload(&self) -> &Bytes {
                &self.data
            }
        }
    };
}

impl_rtp_packet!(EncryptedPacket);
impl_rtp_packet!(DecryptedPacket);

impl EncryptedPacket {
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            timestamp,
            ssrc,
            data: data.into(),
        }
    }

    /// Parses a received datagram. Anything that is not a voice RTP packet
    /// (RTCP, discovery replies, truncated junk) is an error, never a panic.
    pub fn parse(datagram: &[u8]) -> Result<Self, CodecError> {
        if datagram.len() < RTP_HEADER_LEN {
            return Err(CodecError::TooShort(datagram.len()));
        }
        if datagram[0] != RTP_TYPE_BYTE {
            return Err(CodecError::BadHeader {
                offset: 0,
                found: datagram[0],
            });
        }
        if datagram[1] != RTP_VERSION_BYTE {
            return Err(CodecError::BadHeader {
                offset: 1,
                found: datagram[1],
            });
        }

        Ok(Self {
            sequence: BigEndian::read_u16(&datagram[2..4]),
            timestamp: BigEndian::read_u32(&datagram[4..8]),
            ssrc: BigEndian::read_u32(&datagram[8..12]),
            data: Bytes::copy_from_slice(&datagram[RTP_HEADER_LEN..]),
        })
    }

    pub fn decrypt(&self, codec: &XSalsa20Poly1305Codec) -> Result<DecryptedPacket, CodecError> {
        let plain = codec.decrypt(&self.data, &nonce_from_header(&self.header()))?;
        Ok(DecryptedPacket::new(
            self.sequence,
            self.timestamp,
            self.ssrc,
            plain,
        ))
    }

    /// Header followed by the sealed payload, ready for `send`.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(RTP_HEADER_LEN + self.data.len());
        out.put_slice(&self.header());
        out.put_slice(&self.data);
        out.freeze()
    }
}

impl DecryptedPacket {
    pub fn new(sequence: u16, timestamp: u32, ssrc: u32, data: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            timestamp,
            ssrc,
            data: data.into(),
        }
    }

    pub fn encrypt(&self, codec: &XSalsa20Poly1305Codec) -> Result<EncryptedPacket, CodecError> {
        let sealed = codec.encrypt(&self.data, &nonce_from_header(&self.header()))?;
        Ok(EncryptedPacket::new(
            self.sequence,
            self.timestamp,
            self.ssrc,
            sealed,
        ))
    }
}

impl AudioPacket {
    fn inner(&self) -> (&u16, &u32, &u32, &Bytes) {
        match self {
            Self::Encrypted(p) => (&p.sequence, &p.timestamp, &p.ssrc, &p.data),
            Self::Decrypted(p) => (&p.sequence, &p.timestamp, &p.ssrc, &p.data),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}

impl RtpPacket for AudioPacket {
    fn sequence(&self) -> u16 {
        *self.inner().0
    }

    fn timestamp(&self) -> u32 {
        *self.inner().1
    }

    fn ssrc(&self) -> u32 {
        *self.inner().2
    }

    fn payload(&self) -> &Bytes {
        self.inner().3
    }
}

impl From<EncryptedPacket> for AudioPacket {
    fn from(p: EncryptedPacket) -> Self {
        Self::Encrypted(p)
    }
}

impl From<DecryptedPacket> for AudioPacket {
    fn from(p: DecryptedPacket) -> Self {
        Self::Decrypted(p)
    }
}
