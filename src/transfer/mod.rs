//! Transfer state machines and their shared plumbing.
//!
//! Files stream as chunks into a `<target>.part` staging file that
//! exclusively owns the destination while the transfer is in flight. Only
//! after the rolling BLAKE2b-256 digest matches the sender's FileClose is
//! the staging file renamed into place; every failure path unlinks it, so
//! readers never observe a half-written destination.

pub mod download;
pub mod listing;
pub mod upload;

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use blake2::Digest;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::crypto::Blake2b256;
use crate::wire::FilePermission;

/// Rolling digest over one file's bytes in stream order.
///
/// One hasher per file; a fresh instance is the only way to reset.
pub struct FileHasher(Blake2b256);

impl FileHasher {
    pub fn new() -> Self {
        Self(Blake2b256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

impl Default for FileHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// The staging path for a destination: `<target>.part`.
pub fn part_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}

/// A staging file that owns its destination until committed.
///
/// Dropping an uncommitted `PartFile` unlinks the staging path, which is
/// what cleans up after aborted transfers and severed connections.
pub struct PartFile {
    part: PathBuf,
    file: Option<File>,
    settled: bool,
}

impl PartFile {
    /// Create the staging file, making parent directories as needed.
    pub async fn create(target: &Path) -> std::io::Result<Self> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let part = part_path(target);
        let file = File::create(&part).await?;
        Ok(Self {
            part,
            file: Some(file),
            settled: false,
        })
    }

    /// Append one chunk.
    pub async fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file
            .as_mut()
            .expect("part file open")
            .write_all(data)
            .await
    }

    /// Atomically rename the staging file onto its destination.
    pub async fn commit(mut self, target: &Path) -> std::io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        tokio::fs::rename(&self.part, target).await?;
        self.settled = true;
        Ok(())
    }

    /// Discard the staging file.
    pub async fn abort(mut self) {
        self.file.take();
        let _ = tokio::fs::remove_file(&self.part).await;
        self.settled = true;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.settled {
            let _ = std::fs::remove_file(&self.part);
        }
    }
}

/// Extract the wire metadata of a local file.
pub fn metadata_of(meta: &std::fs::Metadata) -> (i64, Vec<FilePermission>) {
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Some(d.as_secs() as i64),
            Err(_) => None,
        })
        .unwrap_or(0);

    #[cfg(unix)]
    let perms = {
        use std::os::unix::fs::PermissionsExt;
        FilePermission::from_mode(meta.permissions().mode())
    };
    #[cfg(not(unix))]
    let perms = Vec::new();

    (mtime, perms)
}

/// Best-effort application of received metadata to a committed file.
///
/// Failures are logged and swallowed; metadata never fails a transfer.
pub fn apply_metadata(path: &Path, mtime_unix: i64, perms: &[FilePermission]) {
    #[cfg(unix)]
    if !perms.is_empty() {
        use std::os::unix::fs::PermissionsExt;
        let mode = FilePermission::to_mode(perms);
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            tracing::debug!(path = %path.display(), "could not apply permissions: {e}");
        }
    }
    #[cfg(not(unix))]
    let _ = perms;

    if mtime_unix > 0 {
        let mtime = UNIX_EPOCH + std::time::Duration::from_secs(mtime_unix as u64);
        let applied = std::fs::File::options()
            .write(true)
            .open(path)
            .and_then(|file| file.set_modified(mtime));
        if let Err(e) = applied {
            tracing::debug!(path = %path.display(), "could not apply mtime: {e}");
        }
    }
}

/// Current time as Unix seconds, for tests and logging.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
