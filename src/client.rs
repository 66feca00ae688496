//! Client API: connect, upload, download, list.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::channel::Session;
use crate::error::{Error, ErrorCode, Result};
use crate::handshake::client::{handshake, ClientParams};
use crate::identity::IdentityStore;
use crate::transfer::upload::SendResult;
use crate::transfer::{download, listing, upload};
use crate::wire::ListEntry;
use crate::{DEFAULT_IO_TIMEOUT_MS, DEFAULT_PORT, DEFAULT_REKEY_INTERVAL_MS};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server hostname or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Identity the server's key is pinned under; defaults to `host:port`
    pub remote_id: Option<String>,
    /// Optional pre-shared key
    pub psk: Option<String>,
    /// Count existing destinations as skips instead of failures
    pub skip_existing: bool,
    /// Override the config directory holding keys and pins
    pub config_dir: Option<PathBuf>,
    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
    /// Receive deadline (milliseconds)
    pub io_timeout_ms: u64,
    /// Rekey interval (milliseconds)
    pub rekey_interval_ms: u64,
}

impl ClientConfig {
    /// A configuration with defaults for everything but the host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            remote_id: None,
            psk: None,
            skip_existing: false,
            config_dir: None,
            connect_timeout_ms: 10_000,
            io_timeout_ms: DEFAULT_IO_TIMEOUT_MS,
            rekey_interval_ms: DEFAULT_REKEY_INTERVAL_MS,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::local(ErrorCode::Config, "host cannot be empty"));
        }
        if self.io_timeout_ms == 0 {
            return Err(Error::local(ErrorCode::Config, "io_timeout_ms must be positive"));
        }
        Ok(())
    }

    fn remote_id(&self) -> String {
        self.remote_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

/// Tally of a batch operation, for rendering and exit codes.
#[derive(Debug, Default, Clone)]
pub struct TransferSummary {
    pub files_sent: u64,
    pub files_received: u64,
    pub bytes_moved: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl TransferSummary {
    /// Whether every item succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// A connected depot client.
pub struct Client {
    session: Session,
    skip_existing: bool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("skip_existing", &self.skip_existing)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect and authenticate to a server.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let store = IdentityStore::open(config.config_dir.clone())?;

        let addr = format!("{}:{}", config.host, config.port);
        let stream = timeout(
            Duration::from_millis(config.connect_timeout_ms),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| Error::local(ErrorCode::Connect, format!("{addr}: connect timed out")))?
        .map_err(|e| Error::local(ErrorCode::Connect, format!("{addr}: {e}")))?;
        stream.set_nodelay(true)?;

        let remote_id = config.remote_id();
        let session = handshake(
            stream,
            &store,
            &ClientParams {
                remote_id: &remote_id,
                psk: config.psk.as_deref(),
                io_timeout: Duration::from_millis(config.io_timeout_ms),
                rekey_interval: Duration::from_millis(config.rekey_interval_ms),
            },
        )
        .await?;

        tracing::info!(server = %addr, sandbox = session.server_sandboxed(), "session established");
        Ok(Self {
            session,
            skip_existing: config.skip_existing,
        })
    }

    /// Upload files and directory trees under `remote_dir`.
    ///
    /// Per-item failures are counted and the batch continues; batch- and
    /// session-fatal failures propagate as errors.
    pub async fn send_many(&mut self, paths: &[PathBuf], remote_dir: &str) -> Result<TransferSummary> {
        let mut summary = TransferSummary::default();

        for local in paths {
            let meta = match std::fs::metadata(local) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(path = %local.display(), "cannot read source: {e}");
                    summary.failed += 1;
                    continue;
                }
            };

            if meta.is_dir() {
                let Some(top) = local.file_name().and_then(|n| n.to_str()) else {
                    summary.failed += 1;
                    continue;
                };
                let mut files = Vec::new();
                collect_local_tree(local, &join_wire(remote_dir, top), &mut files)?;
                files.sort_by(|a, b| a.1.cmp(&b.1));
                for (file, wire_path) in files {
                    self.send_one(&file, &wire_path, &mut summary).await?;
                }
            } else {
                let Some(name) = local.file_name().and_then(|n| n.to_str()) else {
                    summary.failed += 1;
                    continue;
                };
                let wire_path = join_wire(remote_dir, name);
                self.send_one(local, &wire_path, &mut summary).await?;
            }
        }
        Ok(summary)
    }

    async fn send_one(
        &mut self,
        local: &Path,
        wire_path: &str,
        summary: &mut TransferSummary,
    ) -> Result<()> {
        // The upload sender proposes rekeys, only between files
        if self.session.rekey_due() {
            self.session.propose_rekey().await?;
        }

        match upload::send_file(&mut self.session, local, wire_path, self.skip_existing).await {
            Ok(SendResult::Sent { bytes }) => {
                summary.files_sent += 1;
                summary.bytes_moved += bytes;
            }
            Ok(SendResult::Skipped) => summary.skipped += 1,
            Err(e) if e.code().is_per_item() && !matches!(e, Error::Network(_)) => {
                tracing::warn!(path = wire_path, code = %e.code(), "{e}");
                summary.failed += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Download remote items (files or trees) into `dest_dir`.
    pub async fn recv_many(&mut self, remote: &[String], dest_dir: &Path) -> Result<TransferSummary> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let mut summary = TransferSummary::default();
        for remote_path in remote {
            let outcome =
                download::recv_item(&mut self.session, remote_path, dest_dir, self.skip_existing)
                    .await?;
            summary.files_received += outcome.files;
            summary.bytes_moved += outcome.bytes;
            summary.skipped += outcome.skipped;
            summary.failed += outcome.failed.len() as u64;
        }
        Ok(summary)
    }

    /// List the immediate children of a remote path.
    pub async fn list(&mut self, remote_path: &str) -> Result<Vec<ListEntry>> {
        listing::list(&mut self.session, remote_path).await
    }

    /// Channel counters for this session.
    pub fn stats(&self) -> &crate::channel::ChannelStats {
        self.session.stats()
    }

    /// Direct access to the session, for protocol-level callers.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Close the connection.
    pub async fn close(mut self) -> Result<()> {
        self.session.shutdown().await
    }
}

fn join_wire(base: &str, name: &str) -> String {
    let base = base.trim_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{base}/{name}")
    }
}

fn collect_local_tree(
    dir: &Path,
    prefix: &str,
    files: &mut Vec<(PathBuf, String)>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
            continue;
        };
        let wire_path = format!("{prefix}/{name}");
        if meta.is_dir() {
            collect_local_tree(&entry.path(), &wire_path, files)?;
        } else if meta.is_file() {
            files.push((entry.path(), wire_path));
        }
    }
    Ok(())
}
