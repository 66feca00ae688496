//! Post-quantum key establishment and signatures.
//!
//! Type-safe wrappers around CRYSTALS-Kyber (KEM) and CRYSTALS-Dilithium
//! (detached signatures). Key sizes are fixed by the parameter sets
//! (Kyber-768, Dilithium-3); wire blobs carry the raw byte encodings.

use pqcrypto_dilithium::dilithium3;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _, SecretKey as _};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, ErrorCode, Result};

/// A Kyber shared secret.
///
/// Automatically zeroized when dropped; feed it into the key schedule,
/// never use it directly as a traffic key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

impl SharedSecret {
    fn from_kem(ss: kyber768::SharedSecret) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(ss.as_bytes());
        Self(bytes)
    }

    /// Get the raw shared secret bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// A per-session Kyber encapsulation keypair.
///
/// Generated fresh by the server for every handshake; the secret half
/// never leaves the process.
pub struct KemKeypair {
    pk: kyber768::PublicKey,
    sk: kyber768::SecretKey,
}

impl KemKeypair {
    /// Generate a fresh keypair.
    pub fn generate() -> Self {
        let (pk, sk) = kyber768::keypair();
        Self { pk, sk }
    }

    /// Raw public key bytes for the wire.
    pub fn public_bytes(&self) -> &[u8] {
        self.pk.as_bytes()
    }

    /// Recover the shared secret from a peer's encapsulation envelope.
    pub fn decapsulate(&self, envelope: &[u8]) -> Result<SharedSecret> {
        let ct = kyber768::Ciphertext::from_bytes(envelope)
            .map_err(|_| Error::local(ErrorCode::BadPayload, "malformed KEM envelope"))?;
        Ok(SharedSecret::from_kem(kyber768::decapsulate(&ct, &self.sk)))
    }
}

/// Size of a Kyber public key on the wire.
pub fn kem_public_key_len() -> usize {
    kyber768::public_key_bytes()
}

/// Size of a Kyber encapsulation envelope on the wire.
pub fn kem_envelope_len() -> usize {
    kyber768::ciphertext_bytes()
}

/// Size of a Dilithium public key on the wire.
pub fn sign_public_key_len() -> usize {
    dilithium3::public_key_bytes()
}

/// Encapsulate against a peer's Kyber public key.
///
/// Returns the envelope to send and the locally computed shared secret.
pub fn encapsulate(peer_pk: &[u8]) -> Result<(Vec<u8>, SharedSecret)> {
    let pk = kyber768::PublicKey::from_bytes(peer_pk)
        .map_err(|_| Error::local(ErrorCode::BadPayload, "malformed KEM public key"))?;
    let (ss, ct) = kyber768::encapsulate(&pk);
    Ok((ct.as_bytes().to_vec(), SharedSecret::from_kem(ss)))
}

/// A long-term Dilithium signing identity.
pub struct SigningKeypair {
    pk: dilithium3::PublicKey,
    sk: dilithium3::SecretKey,
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair").finish_non_exhaustive()
    }
}

impl SigningKeypair {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let (pk, sk) = dilithium3::keypair();
        Self { pk, sk }
    }

    /// Reconstruct an identity from stored key bytes.
    pub fn from_bytes(pk: &[u8], sk: &[u8]) -> Result<Self> {
        let pk = dilithium3::PublicKey::from_bytes(pk)
            .map_err(|_| Error::local(ErrorCode::Config, "malformed signing public key"))?;
        let sk = dilithium3::SecretKey::from_bytes(sk)
            .map_err(|_| Error::local(ErrorCode::Config, "malformed signing secret key"))?;
        Ok(Self { pk, sk })
    }

    /// Raw public key bytes for the wire and the pin store.
    pub fn public_bytes(&self) -> &[u8] {
        self.pk.as_bytes()
    }

    /// Raw secret key bytes for persistence.
    ///
    /// # Security
    ///
    /// Only ever store these inside a passphrase envelope.
    pub fn secret_bytes(&self) -> &[u8] {
        self.sk.as_bytes()
    }

    /// Produce a detached signature over a message.
    pub fn sign_detached(&self, message: &[u8]) -> Vec<u8> {
        dilithium3::detached_sign(message, &self.sk)
            .as_bytes()
            .to_vec()
    }
}

/// Verify a detached Dilithium signature.
pub fn verify_detached(signer_pk: &[u8], message: &[u8], signature: &[u8]) -> Result<()> {
    let pk = dilithium3::PublicKey::from_bytes(signer_pk)
        .map_err(|_| Error::local(ErrorCode::Auth, "malformed signer public key"))?;
    let sig = dilithium3::DetachedSignature::from_bytes(signature)
        .map_err(|_| Error::local(ErrorCode::Auth, "malformed signature"))?;
    dilithium3::verify_detached_signature(&sig, message, &pk)
        .map_err(|_| Error::local(ErrorCode::Auth, "signature verification failed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kem_round_trip() {
        let kem = KemKeypair::generate();
        let (envelope, client_secret) = encapsulate(kem.public_bytes()).unwrap();
        let server_secret = kem.decapsulate(&envelope).unwrap();
        assert_eq!(client_secret.as_bytes(), server_secret.as_bytes());
    }

    #[test]
    fn test_kem_rejects_garbage() {
        let kem = KemKeypair::generate();
        assert!(kem.decapsulate(&[0u8; 7]).is_err());
        assert!(encapsulate(&[1u8; 3]).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let identity = SigningKeypair::generate();
        let sig = identity.sign_detached(b"kem public key bytes");

        verify_detached(identity.public_bytes(), b"kem public key bytes", &sig).unwrap();

        let err =
            verify_detached(identity.public_bytes(), b"different message", &sig).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Auth);
    }

    #[test]
    fn test_wrong_signer_fails() {
        let identity = SigningKeypair::generate();
        let impostor = SigningKeypair::generate();
        let sig = identity.sign_detached(b"message");

        assert!(verify_detached(impostor.public_bytes(), b"message", &sig).is_err());
    }

    #[test]
    fn test_identity_persistence_round_trip() {
        let identity = SigningKeypair::generate();
        let restored =
            SigningKeypair::from_bytes(identity.public_bytes(), identity.secret_bytes()).unwrap();

        let sig = restored.sign_detached(b"still me");
        verify_detached(identity.public_bytes(), b"still me", &sig).unwrap();
    }
}
