//! Client side of the handshake.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::channel::{Role, Session, SessionSettings};
use crate::crypto::{
    encapsulate, kem_public_key_len, transcript_digest, verify_detached, SecureRandom,
    SessionKeyMaterial, TranscriptInputs, PREFIX_SIZE,
};
use crate::error::{Error, ErrorCode, Result};
use crate::handshake::{
    expect, read_blob, send_failure, write_blob, ClientHello, ServerHello, CIPHER_KYBER_XCHACHA,
    FEATURE_DL_ACK_V1,
};
use crate::identity::IdentityStore;
use crate::wire::HandshakeType;
use crate::PROTOCOL_VERSION;

/// Everything the client side needs beyond the socket.
pub struct ClientParams<'a> {
    /// Identity the server is pinned under, typically `host:port`.
    pub remote_id: &'a str,
    pub psk: Option<&'a str>,
    pub io_timeout: Duration,
    pub rekey_interval: Duration,
}

/// Run the client handshake and return the established session.
///
/// On failure an ERROR blob with the code is sent best-effort before the
/// error propagates (unless the failure was itself reported by the peer).
pub async fn handshake(
    mut stream: TcpStream,
    store: &IdentityStore,
    params: &ClientParams<'_>,
) -> Result<Session> {
    match negotiate(&mut stream, store, params).await {
        Ok((material, c2s_prefix, s2c_prefix, sandbox)) => Ok(Session::establish(
            stream,
            Role::Client,
            &material,
            c2s_prefix,
            s2c_prefix,
            SessionSettings {
                io_timeout: params.io_timeout,
                rekey_interval: params.rekey_interval,
                server_sandboxed: sandbox,
            },
        )),
        Err(err) => {
            if !matches!(err, Error::Remote { .. }) {
                send_failure(&mut stream, err.code()).await;
            }
            Err(err)
        }
    }
}

type NegotiatedKeys = (
    SessionKeyMaterial,
    [u8; PREFIX_SIZE],
    [u8; PREFIX_SIZE],
    bool,
);

async fn negotiate(
    stream: &mut TcpStream,
    store: &IdentityStore,
    params: &ClientParams<'_>,
) -> Result<NegotiatedKeys> {
    let deadline = params.io_timeout;
    let client_identity = store.load_client()?;

    let hello = ClientHello {
        version: PROTOCOL_VERSION,
        ciphers: vec![CIPHER_KYBER_XCHACHA.to_string()],
        psk: params.psk.is_some(),
        client_auth: client_identity.is_some(),
        features: vec![FEATURE_DL_ACK_V1.to_string()],
    };
    let client_hello_bytes = serde_json::to_vec(&hello)
        .map_err(|e| Error::local(ErrorCode::Config, format!("hello encoding: {e}")))?;
    write_blob(stream, HandshakeType::ClientHello, &client_hello_bytes).await?;

    let (blob_type, server_hello_bytes) = read_blob(stream, deadline).await?;
    let server_hello_bytes = expect(blob_type, HandshakeType::ServerHello, server_hello_bytes)?;
    let server_hello: ServerHello = serde_json::from_slice(&server_hello_bytes)
        .map_err(|_| Error::local(ErrorCode::BadPayload, "malformed server hello"))?;

    if server_hello.version != PROTOCOL_VERSION {
        return Err(Error::local(
            ErrorCode::Compat,
            format!("server speaks protocol version {}", server_hello.version),
        ));
    }
    if server_hello.cipher != CIPHER_KYBER_XCHACHA {
        return Err(Error::local(
            ErrorCode::Compat,
            format!("server chose unsupported cipher {}", server_hello.cipher),
        ));
    }
    if !server_hello.features.iter().any(|f| f == FEATURE_DL_ACK_V1) {
        return Err(Error::local(
            ErrorCode::Compat,
            "server lacks the dlAckV1 feature",
        ));
    }
    if server_hello.require_psk && params.psk.is_none() {
        return Err(Error::local(
            ErrorCode::Auth,
            "server requires a pre-shared key and none is configured",
        ));
    }
    if server_hello.require_client_auth && client_identity.is_none() {
        return Err(Error::local(
            ErrorCode::Auth,
            "server requires client authentication and no client identity exists",
        ));
    }

    let (blob_type, server_sign_pk) = read_blob(stream, deadline).await?;
    let server_sign_pk = expect(blob_type, HandshakeType::ServerId, server_sign_pk)?;
    store.check_or_pin(params.remote_id, &server_sign_pk)?;

    let (blob_type, kem_blob) = read_blob(stream, deadline).await?;
    let kem_blob = expect(blob_type, HandshakeType::KemPk, kem_blob)?;
    let pk_len = kem_public_key_len();
    if kem_blob.len() <= pk_len {
        return Err(Error::local(ErrorCode::BadPayload, "short KEM_PK blob"));
    }
    let (kem_pk, kem_sig) = kem_blob.split_at(pk_len);
    verify_detached(&server_sign_pk, kem_pk, kem_sig)?;

    let (envelope, shared_secret) = encapsulate(kem_pk)?;
    let c2s_prefix: [u8; PREFIX_SIZE] = SecureRandom::bytes();
    let s2c_prefix: [u8; PREFIX_SIZE] = SecureRandom::bytes();

    let mut env_blob = Vec::with_capacity(envelope.len() + 2 * PREFIX_SIZE);
    env_blob.extend_from_slice(&envelope);
    env_blob.extend_from_slice(&c2s_prefix);
    env_blob.extend_from_slice(&s2c_prefix);
    write_blob(stream, HandshakeType::KemEnv, &env_blob).await?;

    // The PSK binds into the transcript only when the server's policy
    // demands one; a client-side PSK against an indifferent server is
    // simply unused.
    let psk = server_hello
        .require_psk
        .then(|| params.psk.map(str::as_bytes))
        .flatten();
    let transcript = transcript_digest(&TranscriptInputs {
        version: PROTOCOL_VERSION,
        server_hello: &server_hello_bytes,
        client_hello: &client_hello_bytes,
        server_sign_pk: &server_sign_pk,
        kem_pk,
        envelope: &envelope,
        c2s_prefix: &c2s_prefix,
        s2c_prefix: &s2c_prefix,
        psk,
    });

    if server_hello.require_client_auth {
        let identity = client_identity.as_ref().ok_or_else(|| {
            Error::local(ErrorCode::Auth, "no client identity to authenticate with")
        })?;
        let signature = identity.sign_detached(&transcript);
        let mut auth_blob =
            Vec::with_capacity(identity.public_bytes().len() + signature.len());
        auth_blob.extend_from_slice(identity.public_bytes());
        auth_blob.extend_from_slice(&signature);
        write_blob(stream, HandshakeType::ClientAuth, &auth_blob).await?;
    }

    let material = SessionKeyMaterial::derive(
        shared_secret.as_bytes(),
        &c2s_prefix,
        &s2c_prefix,
        &transcript,
    )?;

    Ok((material, c2s_prefix, s2c_prefix, server_hello.sandbox))
}
