//! Server infrastructure.
//!
//! The accept loop spawns one task per connection; each task runs the
//! handshake and then owns its [`Session`] for the connection's lifetime,
//! dispatching upload, download and listing requests strictly one at a
//! time. No record is processed concurrently with another on the same
//! session, and staged `.part` files are unlinked when a connection dies
//! mid-transfer.

mod config;
mod stats;

pub use config::{ServerConfig, ServerConfigFile};
pub use stats::ServerStats;

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::channel::Session;
use crate::crypto::SigningKeypair;
use crate::error::{ErrorCode, Result};
use crate::handshake::server::{handshake, ServerParams};
use crate::identity::IdentityStore;
use crate::transfer::upload::decode_error_byte;
use crate::transfer::{download, listing, upload};
use crate::wire::RecordType;

/// Main server instance.
pub struct Server {
    config: Arc<ServerConfig>,
    identity: Arc<SigningKeypair>,
    store: Arc<IdentityStore>,
    stats: Arc<ServerStats>,
}

impl Server {
    /// Create a server, loading or generating its identity.
    ///
    /// Fails with `config` when no identity exists and no passphrase is
    /// configured to mint one.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let store = IdentityStore::open(config.config_dir.clone())?;
        let identity = store.load_or_init_server(config.passphrase.as_deref())?;

        Ok(Self {
            config: Arc::new(config),
            identity: Arc::new(identity),
            store: Arc::new(store),
            stats: Arc::new(ServerStats::new()),
        })
    }

    /// Operational counters.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Bind the configured listen address.
    pub async fn listen(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.listen_addr, self.config.listen_port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            share_root = %self.config.share_root.display(),
            sandbox = self.config.sandbox,
            "depot server listening"
        );
        Ok(listener)
    }

    /// Bind and serve forever.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.listen().await?;
        self.serve(listener).await
    }

    /// Accept connections from an existing listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.stats.connection_opened();
                        if let Err(e) = server.handle_connection(stream).await {
                            tracing::debug!(peer = %peer_addr, "connection ended: {e}");
                        }
                        server.stats.connection_closed();
                    });
                }
                Err(e) => {
                    tracing::warn!("accept error: {e}");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true)?;

        let session = handshake(
            stream,
            &ServerParams {
                identity: &self.identity,
                store: &self.store,
                require_psk: self.config.require_psk,
                psk: self.config.psk.as_deref(),
                require_client_auth: self.config.require_client_auth,
                sandbox: self.config.sandbox,
                io_timeout: std::time::Duration::from_millis(self.config.io_timeout_ms),
                rekey_interval: std::time::Duration::from_millis(self.config.rekey_interval_ms),
            },
        )
        .await?;

        self.dispatch(session).await
    }

    /// Serve one session's requests until it closes or fails.
    async fn dispatch(&self, mut session: Session) -> Result<()> {
        let root = &self.config.share_root;
        loop {
            let record = match session.recv_servicing_rekey().await {
                Ok(record) => record,
                Err(e) if e.code() == ErrorCode::Closed => {
                    tracing::debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match record.rtype {
                RecordType::UploadOpen => {
                    upload::handle_upload(
                        &mut session,
                        root,
                        self.config.allow_overwrite,
                        &record.payload,
                    )
                    .await?;
                    self.stats.upload_handled();
                }
                RecordType::DownloadOpen => {
                    download::handle_download(&mut session, root, &record.payload).await?;
                    self.stats.download_handled();
                }
                RecordType::ListOpen => {
                    listing::handle_list(&mut session, root, &record.payload).await?;
                    self.stats.listing_handled();
                }
                RecordType::ErrorRec => {
                    // Late per-item report about an already-finished
                    // exchange; fatal codes end the session.
                    let code = decode_error_byte(&record.payload)?;
                    tracing::debug!(code = %code, "client reported: {}", code.server_text());
                    if code.is_session_fatal() {
                        return Ok(());
                    }
                }
                other => {
                    let _ = session.send_error(ErrorCode::Protocol).await;
                    return Err(crate::error::Error::local(
                        ErrorCode::Protocol,
                        format!("unexpected {other:?} between operations"),
                    ));
                }
            }
        }
    }
}
