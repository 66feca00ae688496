//! Key schedule for session establishment and rekeying.
//!
//! The handshake transcript is digested with BLAKE2b-256 and bound as
//! associated data into an Argon2id derivation over the Kyber shared
//! secret, yielding 64 bytes of per-direction traffic key material.
//! Rekeying derives fresh per-epoch keys from a BLAKE2b-256 traffic
//! secret, so post-handshake epochs never touch the Kyber secret again.

use argon2::{Algorithm, Argon2, AssociatedData, ParamsBuilder, Version};
use blake2::digest::consts::{U32, U48};
use blake2::{Blake2b, Digest};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{AeadKey, DIGEST_SIZE, EPOCH_MATERIAL_SIZE, KEY_SIZE, PREFIX_SIZE};
use crate::error::{Error, ErrorCode, Result};

/// BLAKE2b with 256-bit output, used for transcripts and file digests.
pub type Blake2b256 = Blake2b<U32>;

type Blake2b384 = Blake2b<U48>;

/// Argon2id memory cost in KiB.
const ARGON_M_COST: u32 = 65536;
/// Argon2id iteration count.
const ARGON_T_COST: u32 = 2;
/// Argon2id lane count.
const ARGON_P_COST: u32 = 1;

/// Everything the transcript digest covers, in wire order.
pub struct TranscriptInputs<'a> {
    pub version: u32,
    pub server_hello: &'a [u8],
    pub client_hello: &'a [u8],
    pub server_sign_pk: &'a [u8],
    pub kem_pk: &'a [u8],
    pub envelope: &'a [u8],
    pub c2s_prefix: &'a [u8; PREFIX_SIZE],
    pub s2c_prefix: &'a [u8; PREFIX_SIZE],
    pub psk: Option<&'a [u8]>,
}

/// Digest the handshake transcript.
///
/// Both sides must feed byte-identical inputs; any substituted handshake
/// message changes the digest and therefore every derived key.
pub fn transcript_digest(inputs: &TranscriptInputs<'_>) -> [u8; DIGEST_SIZE] {
    let mut hasher = Blake2b256::new();
    hasher.update(inputs.version.to_le_bytes());
    hasher.update(inputs.server_hello);
    hasher.update(inputs.client_hello);
    hasher.update(inputs.server_sign_pk);
    hasher.update(inputs.kem_pk);
    hasher.update(inputs.envelope);
    hasher.update(inputs.c2s_prefix);
    hasher.update(inputs.s2c_prefix);
    if let Some(psk) = inputs.psk {
        hasher.update(psk);
    }
    hasher.finalize().into()
}

/// The 64 bytes of traffic key material produced by the handshake.
///
/// The first half keys the client-to-server direction, the second half
/// server-to-client; each peer picks its tx/rx halves by role.
/// Automatically zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeyMaterial {
    km: [u8; 2 * KEY_SIZE],
}

impl SessionKeyMaterial {
    /// Run the Argon2id key schedule.
    ///
    /// `shared_secret` is the Kyber decapsulation output, the salt is the
    /// concatenated direction prefixes, and the transcript digest is bound
    /// as associated data.
    pub fn derive(
        shared_secret: &[u8],
        c2s_prefix: &[u8; PREFIX_SIZE],
        s2c_prefix: &[u8; PREFIX_SIZE],
        transcript: &[u8; DIGEST_SIZE],
    ) -> Result<Self> {
        let params = ParamsBuilder::new()
            .m_cost(ARGON_M_COST)
            .t_cost(ARGON_T_COST)
            .p_cost(ARGON_P_COST)
            .data(
                AssociatedData::new(transcript)
                    .map_err(|e| Error::local(ErrorCode::Config, format!("argon2 ad: {e}")))?,
            )
            .output_len(2 * KEY_SIZE)
            .build()
            .map_err(|e| Error::local(ErrorCode::Config, format!("argon2 params: {e}")))?;

        let mut salt = [0u8; 2 * PREFIX_SIZE];
        salt[..PREFIX_SIZE].copy_from_slice(c2s_prefix);
        salt[PREFIX_SIZE..].copy_from_slice(s2c_prefix);

        let mut km = [0u8; 2 * KEY_SIZE];
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(shared_secret, &salt, &mut km)
            .map_err(|e| Error::local(ErrorCode::Config, format!("key schedule: {e}")))?;

        Ok(Self { km })
    }

    /// Key for records flowing client → server.
    pub fn client_tx_key(&self) -> AeadKey {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&self.km[..KEY_SIZE]);
        AeadKey::from_bytes(key)
    }

    /// Key for records flowing server → client.
    pub fn server_tx_key(&self) -> AeadKey {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&self.km[KEY_SIZE..]);
        AeadKey::from_bytes(key)
    }

    /// The secret all post-handshake rekey epochs derive from.
    pub fn traffic_secret(&self) -> [u8; DIGEST_SIZE] {
        Blake2b256::digest(self.km).into()
    }
}

/// Traffic key and nonce prefix for one direction of one epoch.
pub struct EpochKeys {
    pub key: AeadKey,
    pub prefix: [u8; PREFIX_SIZE],
}

impl EpochKeys {
    fn from_material(material: &[u8; EPOCH_MATERIAL_SIZE]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&material[..KEY_SIZE]);
        let mut prefix = [0u8; PREFIX_SIZE];
        prefix.copy_from_slice(&material[KEY_SIZE..]);
        Self {
            key: AeadKey::from_bytes(key),
            prefix,
        }
    }
}

/// Derive the per-direction keys for a rekey epoch.
///
/// Returns `(client_to_server, server_to_client)`; both sides compute the
/// same pair and assign tx/rx by role.
pub fn derive_epoch_keys(
    traffic_secret: &[u8; DIGEST_SIZE],
    epoch_bytes: [u8; 4],
) -> (EpochKeys, EpochKeys) {
    let direction = |label: &[u8]| {
        let mut hasher = Blake2b384::new();
        hasher.update(traffic_secret);
        hasher.update(label);
        hasher.update(epoch_bytes);
        let mut material = [0u8; EPOCH_MATERIAL_SIZE];
        material.copy_from_slice(&hasher.finalize());
        let keys = EpochKeys::from_material(&material);
        material.zeroize();
        keys
    };
    (direction(b"c2s"), direction(b"s2c"))
}

/// Derive the AEAD key that seals a passphrase-encrypted secret key
/// envelope.
pub fn derive_envelope_key(passphrase: &[u8], salt: &[u8; PREFIX_SIZE]) -> Result<AeadKey> {
    let params = ParamsBuilder::new()
        .m_cost(ARGON_M_COST)
        .t_cost(ARGON_T_COST)
        .p_cost(ARGON_P_COST)
        .output_len(KEY_SIZE)
        .build()
        .map_err(|e| Error::local(ErrorCode::Config, format!("argon2 params: {e}")))?;

    let mut key = [0u8; KEY_SIZE];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| Error::local(ErrorCode::Config, format!("envelope key: {e}")))?;

    Ok(AeadKey::from_bytes(key))
}
