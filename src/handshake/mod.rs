//! The post-quantum authenticated handshake.
//!
//! A connection starts as plaintext length-prefixed blobs:
//!
//! ```text
//! Client                                Server
//!   │ CLIENT_HELLO {features, psk?}  →    │
//!   │ ←  SERVER_HELLO {policy, sandbox}   │
//!   │ ←  SERVER_ID (Dilithium pk)         │
//!   │ ←  KEM_PK (Kyber pk ‖ signature)    │
//!   │ KEM_ENV (envelope ‖ prefixes)  →    │
//!   │ CLIENT_AUTH (pk ‖ sig over T)  →    │  (only if required)
//! ```
//!
//! Either side may answer any step with an ERROR blob carrying a single
//! code byte. The transcript digest T covers every exchanged blob plus the
//! direction prefixes, and is bound into the Argon2id key schedule as
//! associated data, so a substituted message yields unusable keys instead
//! of a controllable downgrade.

pub mod client;
pub mod server;

use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, ErrorCode, Result};
use crate::wire::{self, HandshakeType};

/// Feature tag for the download accept/skip protocol. Mandatory.
pub const FEATURE_DL_ACK_V1: &str = "dlAckV1";

/// The only cipher suite this protocol version speaks.
pub const CIPHER_KYBER_XCHACHA: &str = "kyber-xchacha20";

/// Upper bound on a handshake blob body. The largest legitimate blob is
/// KEM_PK (Kyber pk + Dilithium signature, ~4.5 KiB).
const MAX_BLOB: usize = 64 * 1024;

/// First blob on the wire, client → server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHello {
    pub version: u32,
    pub ciphers: Vec<String>,
    pub psk: bool,
    pub client_auth: bool,
    pub features: Vec<String>,
}

/// Server's reply announcing policy and chosen cipher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHello {
    pub version: u32,
    pub cipher: String,
    pub require_psk: bool,
    pub require_client_auth: bool,
    pub features: Vec<String>,
    pub sandbox: bool,
}

/// Write one plaintext handshake blob: varint(body_len) | type | payload.
pub(crate) async fn write_blob(
    stream: &mut TcpStream,
    blob_type: HandshakeType,
    payload: &[u8],
) -> Result<()> {
    let mut frame = BytesMut::with_capacity(payload.len() + wire::MAX_VARINT_LEN + 1);
    wire::put_varint(&mut frame, (payload.len() + 1) as u64);
    frame.extend_from_slice(&[blob_type as u8]);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

/// Read one plaintext handshake blob within the deadline.
///
/// An ERROR blob is surfaced as `Error::Remote` with the peer's code.
pub(crate) async fn read_blob(
    stream: &mut TcpStream,
    deadline: Duration,
) -> Result<(HandshakeType, Vec<u8>)> {
    let (blob_type, payload) = timeout(deadline, read_blob_inner(stream))
        .await
        .map_err(|_| Error::local(ErrorCode::Timeout, "handshake read timed out"))??;

    if blob_type == HandshakeType::Error {
        let code = payload
            .first()
            .map(|&b| ErrorCode::from_wire(b))
            .unwrap_or(ErrorCode::Unknown);
        return Err(Error::remote(code));
    }
    Ok((blob_type, payload))
}

async fn read_blob_inner(stream: &mut TcpStream) -> Result<(HandshakeType, Vec<u8>)> {
    let body_len = crate::channel::read_stream_varint(stream).await? as usize;
    if body_len == 0 || body_len > MAX_BLOB {
        return Err(Error::local(
            ErrorCode::BadPayload,
            format!("handshake blob of {body_len} bytes"),
        ));
    }

    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await?;

    let blob_type = HandshakeType::try_from(body[0])?;
    body.remove(0);
    Ok((blob_type, body))
}

/// Best-effort ERROR blob before tearing the connection down.
pub(crate) async fn send_failure(stream: &mut TcpStream, code: ErrorCode) {
    let _ = write_blob(stream, HandshakeType::Error, &[code.to_wire()]).await;
    let _ = stream.flush().await;
}

/// Expect a specific blob type, treating anything else as a protocol
/// violation.
pub(crate) fn expect(
    got: HandshakeType,
    want: HandshakeType,
    payload: Vec<u8>,
) -> Result<Vec<u8>> {
    if got == want {
        Ok(payload)
    } else {
        Err(Error::local(
            ErrorCode::Protocol,
            format!("expected {want:?}, got {got:?}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_json_field_names() {
        let hello = ClientHello {
            version: 1,
            ciphers: vec![CIPHER_KYBER_XCHACHA.to_string()],
            psk: false,
            client_auth: true,
            features: vec![FEATURE_DL_ACK_V1.to_string()],
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains("\"clientAuth\":true"));
        assert!(json.contains("\"dlAckV1\""));

        let server = ServerHello {
            version: 1,
            cipher: CIPHER_KYBER_XCHACHA.to_string(),
            require_psk: true,
            require_client_auth: false,
            features: vec![FEATURE_DL_ACK_V1.to_string()],
            sandbox: true,
        };
        let json = serde_json::to_string(&server).unwrap();
        assert!(json.contains("\"requirePsk\":true"));
        assert!(json.contains("\"requireClientAuth\":false"));
        assert!(json.contains("\"sandbox\":true"));
    }

    #[test]
    fn test_hello_round_trip() {
        let hello = ServerHello {
            version: 1,
            cipher: CIPHER_KYBER_XCHACHA.to_string(),
            require_psk: false,
            require_client_auth: true,
            features: vec![FEATURE_DL_ACK_V1.to_string()],
            sandbox: false,
        };
        let bytes = serde_json::to_vec(&hello).unwrap();
        let parsed: ServerHello = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed.cipher, hello.cipher);
        assert!(parsed.require_client_auth);
        assert!(!parsed.sandbox);
    }
}
