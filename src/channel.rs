//! The encrypted record channel.
//!
//! A [`Session`] owns its socket and all key material. Records are framed
//! as `varint(body_len) | type | ciphertext | tag`, sealed with
//! XChaCha20-Poly1305 under a nonce of `direction_prefix ‖ sequence`, and
//! bound to `(type, sequence, epoch)` through the associated data. Each
//! direction advances its sequence by exactly one per record, so replayed,
//! reordered, or cross-epoch frames fail authentication instead of being
//! interpreted.
//!
//! Rekeying swaps both directions to fresh per-epoch keys at a message
//! boundary: the proposer switches immediately after writing RekeyReq and
//! sends nothing else until the ack arrives; the responder switches before
//! writing RekeyAck, which therefore already travels under the new epoch.

use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{
    derive_epoch_keys, Aead, EpochKeys, RecordNonce, SessionKeyMaterial, DIGEST_SIZE, PREFIX_SIZE,
    TAG_SIZE,
};
use crate::error::{Error, ErrorCode, Result};
use crate::wire::{self, RecordType};

/// Implementation limit on a single file data chunk.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Largest acceptable frame body: type byte plus sealed maximum chunk.
const MAX_RECORD_BODY: usize = 1 + MAX_CHUNK_SIZE + TAG_SIZE;

/// One decrypted record.
#[derive(Debug)]
pub struct Record {
    pub rtype: RecordType,
    pub payload: Vec<u8>,
}

/// Which end of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Per-session traffic counters.
#[derive(Debug, Default, Clone)]
pub struct ChannelStats {
    pub records_sent: u64,
    pub records_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rekeys: u64,
}

/// The secret all rekey epochs derive from.
#[derive(Zeroize, ZeroizeOnDrop)]
struct TrafficSecret([u8; DIGEST_SIZE]);

struct Direction {
    aead: Aead,
    prefix: [u8; PREFIX_SIZE],
    seq: u64,
}

impl Direction {
    fn new(keys: &EpochKeys) -> Self {
        Self {
            aead: Aead::new(&keys.key),
            prefix: keys.prefix,
            seq: 0,
        }
    }
}

struct PendingEpoch {
    epoch: u32,
    tx: EpochKeys,
    rx: EpochKeys,
}

/// Session behavior knobs fixed at establishment.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub io_timeout: Duration,
    pub rekey_interval: Duration,
    pub server_sandboxed: bool,
}

/// An established, bidirectional encrypted record channel.
///
/// The session exclusively owns its socket and key material; all record
/// traffic flows through it within the owning task.
pub struct Session {
    stream: TcpStream,
    role: Role,
    tx: Direction,
    rx: Direction,
    epoch: u32,
    traffic_secret: TrafficSecret,
    last_rekey: Instant,
    rekey_interval: Duration,
    pending: Option<PendingEpoch>,
    io_timeout: Duration,
    server_sandboxed: bool,
    stats: ChannelStats,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("epoch", &self.epoch)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn associated_data(type_byte: u8, seq: u64, epoch: u32) -> BytesMut {
    let mut ad = BytesMut::with_capacity(1 + 2 * wire::MAX_VARINT_LEN);
    ad.put_u8(type_byte);
    wire::put_varint(&mut ad, seq);
    wire::put_varint(&mut ad, u64::from(epoch));
    ad
}

/// Read a varint off the socket one byte at a time, capped at 10 bytes.
pub(crate) async fn read_stream_varint(stream: &mut TcpStream) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for i in 0..wire::MAX_VARINT_LEN {
        let byte = stream.read_u8().await?;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if i == wire::MAX_VARINT_LEN - 1 && byte > 0x01 {
                return Err(Error::local(ErrorCode::BadPayload, "varint overflow"));
            }
            return Ok(value);
        }
        shift += 7;
    }
    Err(Error::local(ErrorCode::BadPayload, "varint too long"))
}

impl Session {
    /// Build a session from freshly derived handshake key material.
    ///
    /// The first half of the material keys client→server; each role picks
    /// its tx/rx halves and prefixes accordingly.
    pub(crate) fn establish(
        stream: TcpStream,
        role: Role,
        material: &SessionKeyMaterial,
        c2s_prefix: [u8; PREFIX_SIZE],
        s2c_prefix: [u8; PREFIX_SIZE],
        settings: SessionSettings,
    ) -> Self {
        let c2s = EpochKeys {
            key: material.client_tx_key(),
            prefix: c2s_prefix,
        };
        let s2c = EpochKeys {
            key: material.server_tx_key(),
            prefix: s2c_prefix,
        };
        let (tx, rx) = match role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };

        Self {
            stream,
            role,
            tx: Direction::new(&tx),
            rx: Direction::new(&rx),
            epoch: 0,
            traffic_secret: TrafficSecret(material.traffic_secret()),
            last_rekey: Instant::now(),
            rekey_interval: settings.rekey_interval,
            pending: None,
            io_timeout: settings.io_timeout,
            server_sandboxed: settings.server_sandboxed,
            stats: ChannelStats::default(),
        }
    }

    /// Current epoch, bound into every record's associated data.
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Whether the server side of this session confines paths to its
    /// share root (announced in the server hello).
    pub fn server_sandboxed(&self) -> bool {
        self.server_sandboxed
    }

    /// Traffic counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Seal and send one record as a single transport write.
    pub async fn send(&mut self, rtype: RecordType, payload: &[u8]) -> Result<()> {
        let type_byte = rtype as u8;
        let ad = associated_data(type_byte, self.tx.seq, self.epoch);
        let nonce = RecordNonce::new(&self.tx.prefix, self.tx.seq);
        let sealed = self.tx.aead.seal(&nonce, payload, &ad)?;

        let mut frame = BytesMut::with_capacity(sealed.len() + wire::MAX_VARINT_LEN + 1);
        wire::put_varint(&mut frame, (1 + sealed.len()) as u64);
        frame.put_u8(type_byte);
        frame.extend_from_slice(&sealed);

        self.stream.write_all(&frame).await?;

        self.tx.seq += 1;
        self.stats.records_sent += 1;
        self.stats.bytes_sent += payload.len() as u64;
        Ok(())
    }

    /// Send a coded error record.
    pub async fn send_error(&mut self, code: ErrorCode) -> Result<()> {
        self.send(RecordType::ErrorRec, &[code.to_wire()]).await
    }

    /// Receive and authenticate one record, bounded by the session's
    /// receive deadline.
    ///
    /// A deadline expiry reports `timeout` to the peer (best-effort) and
    /// terminates the session. Authentication or framing failures also
    /// leave the session unusable.
    pub async fn recv(&mut self) -> Result<Record> {
        let (type_byte, sealed) =
            match timeout(self.io_timeout, Self::read_frame(&mut self.stream)).await {
                Ok(read) => read?,
                Err(_) => {
                    let _ = self.send_error(ErrorCode::Timeout).await;
                    return Err(Error::local(ErrorCode::Timeout, "receive deadline expired"));
                }
            };

        let rtype = RecordType::try_from(type_byte)?;
        let ad = associated_data(type_byte, self.rx.seq, self.epoch);
        let nonce = RecordNonce::new(&self.rx.prefix, self.rx.seq);
        let payload = self.rx.aead.open(&nonce, &sealed, &ad)?;

        self.rx.seq += 1;
        self.stats.records_received += 1;
        self.stats.bytes_received += payload.len() as u64;
        Ok(Record { rtype, payload })
    }

    /// Receive, transparently answering rekey proposals from the peer.
    ///
    /// Wait loops use this wherever a control record may interleave with
    /// the reply they are blocked on.
    pub async fn recv_servicing_rekey(&mut self) -> Result<Record> {
        loop {
            let record = self.recv().await?;
            if record.rtype == RecordType::RekeyReq {
                self.respond_rekey(&record.payload).await?;
                continue;
            }
            return Ok(record);
        }
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
        let body_len = read_stream_varint(stream).await? as usize;
        if body_len < 1 + TAG_SIZE || body_len > MAX_RECORD_BODY {
            return Err(Error::local(
                ErrorCode::BadPayload,
                format!("frame body of {body_len} bytes"),
            ));
        }

        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;
        let type_byte = body[0];
        body.remove(0);
        Ok((type_byte, body))
    }

    /// Whether enough time has passed to propose a rekey at the next
    /// file boundary.
    pub fn rekey_due(&self) -> bool {
        self.pending.is_none() && self.last_rekey.elapsed() >= self.rekey_interval
    }

    /// Propose and complete a rekey. Caller must be the current stream's
    /// sender, at a file boundary.
    ///
    /// Sends RekeyReq under the old epoch, activates the new keys, then
    /// blocks for the ack; no other record goes out in between.
    pub async fn propose_rekey(&mut self) -> Result<()> {
        let new_epoch = self.epoch + 1;
        let epoch_bytes = new_epoch.to_le_bytes();

        self.stash_pending(new_epoch);
        self.send(RecordType::RekeyReq, &epoch_bytes).await?;
        self.activate_pending();

        let ack = self.recv().await?;
        if ack.rtype != RecordType::RekeyAck || ack.payload != epoch_bytes {
            return Err(Error::local(ErrorCode::Protocol, "rekey not acknowledged"));
        }
        self.stats.rekeys += 1;
        Ok(())
    }

    /// Answer a peer's rekey proposal: derive, activate, then ack under
    /// the new epoch.
    pub(crate) async fn respond_rekey(&mut self, payload: &[u8]) -> Result<()> {
        let epoch_bytes: [u8; 4] = payload
            .try_into()
            .map_err(|_| Error::local(ErrorCode::BadPayload, "rekey payload must be 4 bytes"))?;
        let proposed = u32::from_le_bytes(epoch_bytes);
        if proposed != self.epoch + 1 || self.pending.is_some() {
            return Err(Error::local(
                ErrorCode::Protocol,
                format!("unexpected rekey to epoch {proposed}"),
            ));
        }

        self.stash_pending(proposed);
        self.activate_pending();
        self.send(RecordType::RekeyAck, &epoch_bytes).await?;
        self.stats.rekeys += 1;
        Ok(())
    }

    fn stash_pending(&mut self, new_epoch: u32) {
        let (c2s, s2c) = derive_epoch_keys(&self.traffic_secret.0, new_epoch.to_le_bytes());
        let (tx, rx) = match self.role {
            Role::Client => (c2s, s2c),
            Role::Server => (s2c, c2s),
        };
        self.pending = Some(PendingEpoch {
            epoch: new_epoch,
            tx,
            rx,
        });
    }

    fn activate_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.tx = Direction::new(&pending.tx);
            self.rx = Direction::new(&pending.rx);
            self.epoch = pending.epoch;
            self.last_rekey = Instant::now();
        }
    }

    /// Flush and close the connection.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn session_pair() -> (Session, Session) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (client_stream, server_stream) =
            tokio::join!(TcpStream::connect(addr), async {
                listener.accept().await.map(|(s, _)| s)
            });

        let c2s = [0x0au8; PREFIX_SIZE];
        let s2c = [0x0bu8; PREFIX_SIZE];
        let material =
            SessionKeyMaterial::derive(&[42u8; 32], &c2s, &s2c, &[7u8; DIGEST_SIZE]).unwrap();

        let settings = SessionSettings {
            io_timeout: Duration::from_secs(5),
            rekey_interval: Duration::from_secs(3600),
            server_sandboxed: true,
        };

        let client = Session::establish(
            client_stream.unwrap(),
            Role::Client,
            &material,
            c2s,
            s2c,
            settings.clone(),
        );
        let server = Session::establish(
            server_stream.unwrap(),
            Role::Server,
            &material,
            c2s,
            s2c,
            settings,
        );
        (client, server)
    }

    #[tokio::test]
    async fn test_bidirectional_records() {
        let (mut client, mut server) = session_pair().await;

        client
            .send(RecordType::FileData, b"chunk one")
            .await
            .unwrap();
        client.send(RecordType::FileData, b"chunk two").await.unwrap();

        let first = server.recv().await.unwrap();
        assert_eq!(first.rtype, RecordType::FileData);
        assert_eq!(first.payload, b"chunk one");
        let second = server.recv().await.unwrap();
        assert_eq!(second.payload, b"chunk two");

        server.send(RecordType::UploadDone, b"").await.unwrap();
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.rtype, RecordType::UploadDone);
        assert!(reply.payload.is_empty());

        assert_eq!(client.stats().records_sent, 2);
        assert_eq!(client.stats().records_received, 1);
    }

    #[tokio::test]
    async fn test_dropped_frame_breaks_the_sequence() {
        let (mut client, mut server) = session_pair().await;

        client.send(RecordType::FileData, b"first").await.unwrap();
        client.send(RecordType::FileData, b"second").await.unwrap();

        // Swallow the first frame raw off the socket; the second frame is
        // genuine but its sequence no longer matches the receiver's
        // counter, so it must fail authentication, not be delivered.
        let varint = read_stream_varint(&mut server.stream).await.unwrap();
        let mut raw = vec![0u8; varint as usize];
        server.stream.read_exact(&mut raw).await.unwrap();

        let err = server.recv().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Auth);
    }

    #[tokio::test]
    async fn test_rekey_round_trip() {
        let (mut client, mut server) = session_pair().await;

        client.send(RecordType::FileClose, &[0u8; 32]).await.unwrap();
        assert_eq!(server.recv().await.unwrap().rtype, RecordType::FileClose);

        // Client proposes; server answers from its wait loop.
        let (proposal, service) = tokio::join!(client.propose_rekey(), async {
            let record = server.recv().await?;
            assert_eq!(record.rtype, RecordType::RekeyReq);
            server.respond_rekey(&record.payload).await
        });
        proposal.unwrap();
        service.unwrap();

        assert_eq!(client.epoch(), 1);
        assert_eq!(server.epoch(), 1);
        assert_eq!(client.stats().rekeys, 1);

        // Sequences reset and traffic continues under the new epoch.
        client.send(RecordType::FileData, b"fresh epoch").await.unwrap();
        let record = server.recv().await.unwrap();
        assert_eq!(record.payload, b"fresh epoch");
        assert_eq!(server.stats().records_received, 3);
    }

    #[tokio::test]
    async fn test_recv_servicing_rekey() {
        let (mut client, mut server) = session_pair().await;

        let (proposal, reply) = tokio::join!(
            async {
                client.propose_rekey().await?;
                client.send(RecordType::UploadOpen, b"next file").await
            },
            async {
                // The wait loop sees the rekey first, services it, and
                // keeps waiting for the record it actually wants.
                let record = server.recv_servicing_rekey().await?;
                assert_eq!(record.rtype, RecordType::UploadOpen);
                Ok::<_, Error>(record)
            }
        );
        proposal.unwrap();
        reply.unwrap();
        assert_eq!(server.epoch(), 1);
    }

    #[tokio::test]
    async fn test_tampered_frame_fails_auth() {
        let (mut client, mut server) = session_pair().await;

        client.send(RecordType::FileData, b"pristine").await.unwrap();
        let record = server.recv().await.unwrap();
        assert_eq!(record.payload, b"pristine");

        // Shove a forged frame down the raw socket: valid framing, garbage
        // ciphertext.
        let mut forged = BytesMut::new();
        wire::put_varint(&mut forged, (1 + 16 + 4) as u64);
        forged.put_u8(RecordType::FileData as u8);
        forged.extend_from_slice(&[0u8; 20]);
        client_raw(&mut client).write_all(&forged).await.unwrap();

        let err = server.recv().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Auth);
    }

    fn client_raw(session: &mut Session) -> &mut TcpStream {
        &mut session.stream
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = session_pair().await;

        let mut forged = BytesMut::new();
        wire::put_varint(&mut forged, (MAX_RECORD_BODY + 1) as u64);
        client_raw(&mut client).write_all(&forged).await.unwrap();

        let err = server.recv().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadPayload);
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_closed() {
        let (mut client, mut server) = session_pair().await;

        let mut forged = BytesMut::new();
        wire::put_varint(&mut forged, 40);
        forged.put_u8(RecordType::FileData as u8);
        forged.extend_from_slice(&[0u8; 10]);
        client_raw(&mut client).write_all(&forged).await.unwrap();
        client_raw(&mut client).shutdown().await.unwrap();

        let err = server.recv().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Closed);
    }
}
