//! Cryptographic primitives for depot.
//!
//! This module provides:
//! - CRYSTALS-Kyber key encapsulation
//! - CRYSTALS-Dilithium detached signatures
//! - XChaCha20-Poly1305 AEAD encryption
//! - BLAKE2b transcript and file digests
//! - Argon2id session key schedule
//! - Secure random number generation
//!
//! Symmetric key material is zeroized on drop to prevent memory leakage.

mod aead;
mod kdf;
mod keys;
mod random;

pub use aead::{Aead, AeadKey, RecordNonce};
pub use kdf::{
    derive_epoch_keys, derive_envelope_key, transcript_digest, Blake2b256, EpochKeys,
    SessionKeyMaterial, TranscriptInputs,
};
pub use keys::{
    encapsulate, kem_envelope_len, kem_public_key_len, sign_public_key_len, verify_detached,
    KemKeypair, SharedSecret, SigningKeypair,
};
pub use random::SecureRandom;

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (192 bits for XChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 24;

/// Size of the per-direction nonce prefix in bytes
pub const PREFIX_SIZE: usize = 16;

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of BLAKE2b digests used for transcripts and file checksums
pub const DIGEST_SIZE: usize = 32;

/// Bytes of key material derived per direction on rekey (key + prefix)
pub const EPOCH_MATERIAL_SIZE: usize = KEY_SIZE + PREFIX_SIZE;
