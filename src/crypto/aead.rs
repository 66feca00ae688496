//! Authenticated Encryption with Associated Data (AEAD).
//!
//! Uses XChaCha20-Poly1305 for symmetric encryption with authentication.
//! The extended 24-byte nonce leaves room for a 16-byte per-direction
//! prefix followed by a 64-bit record sequence number, so nonces never
//! repeat under a key as long as the sequence counter is monotonic.

use chacha20poly1305::{
    aead::{Aead as AeadTrait, KeyInit, Payload},
    XChaCha20Poly1305,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_SIZE, NONCE_SIZE, PREFIX_SIZE, TAG_SIZE};
use crate::error::{Error, ErrorCode, Result};

/// A symmetric key for AEAD operations.
///
/// Automatically zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a new AEAD key from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with care - this is secret key material.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// A record nonce: 16-byte direction prefix followed by the record
/// sequence number in little-endian.
#[derive(Clone, Copy)]
pub struct RecordNonce([u8; NONCE_SIZE]);

impl RecordNonce {
    /// Build the nonce for a given direction prefix and sequence number.
    pub fn new(prefix: &[u8; PREFIX_SIZE], seq: u64) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..PREFIX_SIZE].copy_from_slice(prefix);
        nonce[PREFIX_SIZE..].copy_from_slice(&seq.to_le_bytes());
        Self(nonce)
    }

    /// Get the raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// XChaCha20-Poly1305 AEAD cipher.
pub struct Aead {
    cipher: XChaCha20Poly1305,
}

impl Aead {
    /// Create a new AEAD instance with the given key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt plaintext with associated authenticated data.
    ///
    /// Returns ciphertext || tag (16 bytes appended).
    pub fn seal(&self, nonce: &RecordNonce, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        self.cipher
            .encrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::local(ErrorCode::Protocol, "record encryption failed"))
    }

    /// Decrypt ciphertext with associated authenticated data.
    ///
    /// # Errors
    ///
    /// Returns `auth` if the tag does not verify (wrong key, wrong nonce,
    /// wrong associated data, or tampered bytes).
    pub fn open(&self, nonce: &RecordNonce, ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::local(
                ErrorCode::BadPayload,
                format!("ciphertext shorter than tag: {} bytes", ciphertext.len()),
            ));
        }

        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        self.cipher
            .decrypt(nonce.as_bytes().into(), payload)
            .map_err(|_| Error::local(ErrorCode::Auth, "record authentication failed"))
    }
}
