//! Server side of the handshake.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::channel::{Role, Session, SessionSettings};
use crate::crypto::{
    kem_envelope_len, sign_public_key_len, transcript_digest, verify_detached, KemKeypair,
    SessionKeyMaterial, SigningKeypair, TranscriptInputs, PREFIX_SIZE,
};
use crate::error::{Error, ErrorCode, Result};
use crate::handshake::{
    expect, read_blob, send_failure, write_blob, ClientHello, ServerHello, CIPHER_KYBER_XCHACHA,
    FEATURE_DL_ACK_V1,
};
use crate::identity::{fingerprint, IdentityStore};
use crate::wire::HandshakeType;
use crate::PROTOCOL_VERSION;

/// Server-side handshake policy and key material.
pub struct ServerParams<'a> {
    pub identity: &'a SigningKeypair,
    pub store: &'a IdentityStore,
    pub require_psk: bool,
    pub psk: Option<&'a str>,
    pub require_client_auth: bool,
    pub sandbox: bool,
    pub io_timeout: Duration,
    pub rekey_interval: Duration,
}

/// Run the server handshake and return the established session.
pub async fn handshake(mut stream: TcpStream, params: &ServerParams<'_>) -> Result<Session> {
    match negotiate(&mut stream, params).await {
        Ok((material, c2s_prefix, s2c_prefix)) => Ok(Session::establish(
            stream,
            Role::Server,
            &material,
            c2s_prefix,
            s2c_prefix,
            SessionSettings {
                io_timeout: params.io_timeout,
                rekey_interval: params.rekey_interval,
                server_sandboxed: params.sandbox,
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

type NegotiatedKeys = (SessionKeyMaterial, [u8; PREFIX_SIZE], [u8; PREFIX_SIZE]);

async fn negotiate(
    stream: &mut TcpStream,
    params: &ServerParams<'_>,
) -> Result<NegotiatedKeys> {
    let deadline = params.io_timeout;

    let (blob_type, client_hello_bytes) = read_blob(stream, deadline).await?;
    let client_hello_bytes = expect(blob_type, HandshakeType::ClientHello, client_hello_bytes)?;
    let client_hello: ClientHello = serde_json::from_slice(&client_hello_bytes)
        .map_err(|_| Error::local(ErrorCode::BadPayload, "malformed client hello"))?;

    if client_hello.version != PROTOCOL_VERSION {
        return Err(Error::local(
            ErrorCode::Compat,
            format!("client speaks protocol version {}", client_hello.version),
        ));
    }
    if !client_hello
        .ciphers
        .iter()
        .any(|c| c == CIPHER_KYBER_XCHACHA)
    {
        return Err(Error::local(
            ErrorCode::Compat,
            "client offers no supported cipher",
        ));
    }
    if !client_hello.features.iter().any(|f| f == FEATURE_DL_ACK_V1) {
        return Err(Error::local(
            ErrorCode::Compat,
            "client lacks the dlAckV1 feature",
        ));
    }
    if params.require_psk && !client_hello.psk {
        return Err(Error::local(
            ErrorCode::Auth,
            "client has no pre-shared key configured",
        ));
    }
    if params.require_client_auth && !client_hello.client_auth {
        return Err(Error::local(
            ErrorCode::Auth,
            "client cannot authenticate and authentication is required",
        ));
    }

    let server_hello = ServerHello {
        version: PROTOCOL_VERSION,
        cipher: CIPHER_KYBER_XCHACHA.to_string(),
        require_psk: params.require_psk,
        require_client_auth: params.require_client_auth,
        features: vec![FEATURE_DL_ACK_V1.to_string()],
        sandbox: params.sandbox,
    };
    let server_hello_bytes = serde_json::to_vec(&server_hello)
        .map_err(|e| Error::local(ErrorCode::Config, format!("hello encoding: {e}")))?;
    write_blob(stream, HandshakeType::ServerHello, &server_hello_bytes).await?;

    write_blob(stream, HandshakeType::ServerId, params.identity.public_bytes()).await?;

    let kem = KemKeypair::generate();
    let signature = params.identity.sign_detached(kem.public_bytes());
    let mut kem_blob = Vec::with_capacity(kem.public_bytes().len() + signature.len());
    kem_blob.extend_from_slice(kem.public_bytes());
    kem_blob.extend_from_slice(&signature);
    write_blob(stream, HandshakeType::KemPk, &kem_blob).await?;

    let (blob_type, env_blob) = read_blob(stream, deadline).await?;
    let env_blob = expect(blob_type, HandshakeType::KemEnv, env_blob)?;
    let env_len = kem_envelope_len();
    if env_blob.len() != env_len + 2 * PREFIX_SIZE {
        return Err(Error::local(
            ErrorCode::BadPayload,
            format!("KEM_ENV blob of {} bytes", env_blob.len()),
        ));
    }
    let (envelope, prefixes) = env_blob.split_at(env_len);
    let c2s_prefix: [u8; PREFIX_SIZE] = prefixes[..PREFIX_SIZE].try_into().unwrap();
    let s2c_prefix: [u8; PREFIX_SIZE] = prefixes[PREFIX_SIZE..].try_into().unwrap();

    let shared_secret = kem.decapsulate(envelope)?;

    let psk = params
        .require_psk
        .then(|| params.psk.map(str::as_bytes))
        .flatten();
    let transcript = transcript_digest(&TranscriptInputs {
        version: PROTOCOL_VERSION,
        server_hello: &server_hello_bytes,
        client_hello: &client_hello_bytes,
        server_sign_pk: params.identity.public_bytes(),
        kem_pk: kem.public_bytes(),
        envelope,
        c2s_prefix: &c2s_prefix,
        s2c_prefix: &s2c_prefix,
        psk,
    });

    if params.require_client_auth {
        let (blob_type, auth_blob) = read_blob(stream, deadline).await?;
        let auth_blob = expect(blob_type, HandshakeType::ClientAuth, auth_blob)?;
        let pk_len = sign_public_key_len();
        if auth_blob.len() <= pk_len {
            return Err(Error::local(ErrorCode::BadPayload, "short CLIENT_AUTH blob"));
        }
        let (client_pk, client_sig) = auth_blob.split_at(pk_len);

        if !params.store.is_allowed_client(client_pk)? {
            return Err(Error::local(
                ErrorCode::Auth,
                format!(
                    "client key {} is not on the allowlist",
                    fingerprint(client_pk)
                ),
            ));
        }
        verify_detached(client_pk, &transcript, client_sig)?;
        tracing::debug!(client = %fingerprint(client_pk), "client authenticated");
    }

    let material = SessionKeyMaterial::derive(
        shared_secret.as_bytes(),
        &c2s_prefix,
        &s2c_prefix,
        &transcript,
    )?;

    Ok((material, c2s_prefix, s2c_prefix))
}
