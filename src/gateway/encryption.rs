use xsalsa20poly1305::{KeyInit, Nonce, XSalsa20Poly1305, aead::Aead};

use crate::gateway::constants::{NONCE_LEN, RTP_HEADER_LEN, SECRET_KEY_LEN};

/// Poly1305 tag prepended to every sealed payload.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("secret key must be {SECRET_KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unexpected RTP byte {found:#04x} at offset {offset}")]
    BadHeader { offset: usize, found: u8 },
    #[error("encryption failed")]
    Encrypt,
    #[error("authentication failed")]
    Decrypt,
}

/// Builds the 24-byte nonce for a packet: its RTP header, zero padded.
pub fn nonce_from_header(header: &[u8; RTP_HEADER_LEN]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..RTP_HEADER_LEN].copy_from_slice(header);
    nonce
}

/// Secret-box cipher keyed with the session's secret key.
///
/// Construct once per session description and reuse it for every packet.
#[derive(Clone)]
pub struct XSalsa20Poly1305Codec {
    cipher: XSalsa20Poly1305,
}

impl std::fmt::Debug for XSalsa20Poly1305Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XSalsa20Poly1305Codec").finish_non_exhaustive()
    }
}

impl XSalsa20Poly1305Codec {
    pub fn new(key: &[u8]) -> Result<Self, CodecError> {
        let cipher = XSalsa20Poly1305::new_from_slice(key)
            .map_err(|_| CodecError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, CodecError> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CodecError::Encrypt)
    }

    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8; NONCE_LEN],
    ) -> Result<Vec<u8>, CodecError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CodecError::TooShort(ciphertext.len()));
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Decrypt)
    }
}

pub fn encrypt(plaintext: &[u8], key: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, CodecError> {
    XSalsa20Poly1305Codec::new(key)?.encrypt(plaintext, nonce)
}

pub fn decrypt(ciphertext: &[u8], key: &[u8], nonce: &[u8; NONCE_LEN]) -> Result<Vec<u8>, CodecError> {
    XSalsa20Poly1305Codec::new(key)?.decrypt(ciphertext, nonce)
}
