//! Download state machines: server announces and streams files, client
//! acks, stages, verifies and commits them.
//!
//! Per file the server sends PathOpen and waits for the client's
//! PathAccept or PathSkip before any data flows; files of a tree stream
//! strictly one at a time. The client validates every server-supplied
//! path against its destination directory before touching the
//! filesystem.

use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;

use crate::channel::Session;
use crate::error::{os_error_code, Error, ErrorCode, Result};
use crate::sandbox;
use crate::transfer::upload::decode_error_byte;
use crate::transfer::{apply_metadata, metadata_of, FileHasher, PartFile};
use crate::wire::{self, PathOpen, RecordType};
use crate::CHUNK_SIZE;

/// Client-side tally for one requested item.
#[derive(Debug, Default)]
pub struct ItemOutcome {
    pub files: u64,
    pub bytes: u64,
    pub skipped: u64,
    /// Per-item failures collected while the batch continued.
    pub failed: Vec<ErrorCode>,
}

/// Request one remote item (file or tree) into `dest_dir`.
///
/// Returns `Err` only for conditions that abort the batch; per-item
/// failures land in the outcome.
pub async fn recv_item(
    session: &mut Session,
    remote_path: &str,
    dest_dir: &Path,
    skip_existing: bool,
) -> Result<ItemOutcome> {
    session
        .send(
            RecordType::DownloadOpen,
            &wire::encode_path_payload(remote_path),
        )
        .await?;

    let mut outcome = ItemOutcome::default();
    loop {
        let record = session.recv_servicing_rekey().await?;
        match record.rtype {
            RecordType::PathOpen => {
                let open = PathOpen::decode(&record.payload)?;
                receive_file(session, &open, dest_dir, skip_existing, &mut outcome).await?;
            }
            RecordType::DownloadDone => return Ok(outcome),
            RecordType::ErrorRec => {
                let code = decode_error_byte(&record.payload)?;
                if code.is_per_item() {
                    tracing::warn!(path = remote_path, code = %code, "{}", code.client_text());
                    outcome.failed.push(code);
                    return Ok(outcome);
                }
                return Err(Error::remote(code));
            }
            other => {
                return Err(Error::local(
                    ErrorCode::Protocol,
                    format!("unexpected {other:?} during download"),
                ))
            }
        }
    }
}

async fn receive_file(
    session: &mut Session,
    open: &PathOpen,
    dest_dir: &Path,
    skip_existing: bool,
    outcome: &mut ItemOutcome,
) -> Result<()> {
    // A hostile server must not write outside the destination directory.
    let target = match sandbox::resolve_under_root(dest_dir, &open.path) {
        Ok(target) => target,
        Err(e) => {
            return Err(Error::local(
                ErrorCode::BadRemote,
                format!("server sent refused path {:?}: {e}", open.path),
            ))
        }
    };

    if target.exists() {
        session.send(RecordType::PathSkip, b"").await?;
        if skip_existing {
            tracing::debug!(path = %open.path, "skipping existing local file");
            outcome.skipped += 1;
        } else {
            outcome.failed.push(ErrorCode::Exists);
        }
        return Ok(());
    }

    let mut part = match PartFile::create(&target).await {
        Ok(part) => part,
        Err(e) => {
            let code = os_error_code(&e, ErrorCode::OpenFail);
            session.send_error(code).await?;
            return Err(Error::local(code, target.display().to_string()));
        }
    };
    session.send(RecordType::PathAccept, b"").await?;

    let mut hasher = FileHasher::new();
    let mut bytes = 0u64;
    let received;
    loop {
        let record = session.recv_servicing_rekey().await?;
        match record.rtype {
            RecordType::FileData => {
                hasher.update(&record.payload);
                if let Err(e) = part.write_chunk(&record.payload).await {
                    let code = os_error_code(&e, ErrorCode::WriteFail);
                    part.abort().await;
                    session.send_error(code).await?;
                    return Err(Error::local(code, target.display().to_string()));
                }
                bytes += record.payload.len() as u64;
            }
            RecordType::FileClose => {
                if record.payload.len() != 32 {
                    part.abort().await;
                    return Err(Error::local(
                        ErrorCode::BadPayload,
                        "FileClose digest must be 32 bytes",
                    ));
                }
                received = record.payload;
                break;
            }
            RecordType::ErrorRec => {
                let code = decode_error_byte(&record.payload)?;
                part.abort().await;
                if code.is_per_item() {
                    outcome.failed.push(code);
                    return Ok(());
                }
                return Err(Error::remote(code));
            }
            other => {
                part.abort().await;
                return Err(Error::local(
                    ErrorCode::Protocol,
                    format!("unexpected {other:?} during file stream"),
                ));
            }
        }
    }

    if hasher.finalize() != received[..] {
        tracing::warn!(path = %open.path, "download digest mismatch");
        part.abort().await;
        session.send_error(ErrorCode::Checksum).await?;
        outcome.failed.push(ErrorCode::Checksum);
        return Ok(());
    }

    if target.exists() {
        part.abort().await;
        outcome.failed.push(ErrorCode::Exists);
        return Ok(());
    }

    if let Err(e) = part.commit(&target).await {
        let code = os_error_code(&e, ErrorCode::CommitFail);
        session.send_error(code).await?;
        outcome.failed.push(code);
        return Ok(());
    }
    apply_metadata(&target, open.mtime_unix, &open.perms);

    outcome.files += 1;
    outcome.bytes += bytes;
    tracing::debug!(path = %open.path, bytes, "download committed");
    Ok(())
}

/// Server side: resolve and stream one requested item.
///
/// Per-item failures are reported as coded errors and leave the session
/// usable for the client's next request.
pub async fn handle_download(session: &mut Session, root: &Path, payload: &[u8]) -> Result<()> {
    let requested = match wire::decode_path_payload(payload) {
        Ok(path) => path,
        Err(e) => {
            session.send_error(e.code()).await?;
            return Ok(());
        }
    };

    let resolved = if session.server_sandboxed() {
        sandbox::resolve_under_root(root, &requested)
    } else {
        sandbox::resolve_trusted(root, &requested)
    };
    let base = match resolved {
        Ok(base) => base,
        Err(e) => {
            tracing::warn!(path = %requested, code = %e.code(), "{}", e.code().server_text());
            session.send_error(e.code()).await?;
            return Ok(());
        }
    };

    let meta = match std::fs::symlink_metadata(&base) {
        Ok(meta) => meta,
        Err(e) => {
            session
                .send_error(os_error_code(&e, ErrorCode::NotFound))
                .await?;
            return Ok(());
        }
    };

    // The final wire path component is the requested name itself
    let top = match Path::new(&requested).file_name().and_then(|n| n.to_str()) {
        Some(top) => top.to_string(),
        None => {
            session.send_error(ErrorCode::BadPath).await?;
            return Ok(());
        }
    };

    if meta.is_file() {
        if serve_file(session, &base, &top).await?.is_break() {
            return Ok(());
        }
    } else if meta.is_dir() {
        let mut files = Vec::new();
        if let Err(e) = collect_tree(&base, &top, &mut files) {
            tracing::warn!(path = %requested, "tree walk failed: {e}");
            session.send_error(ErrorCode::ReadFail).await?;
            return Ok(());
        }
        files.sort_by(|a, b| a.1.cmp(&b.1));
        for (local, wire_path) in files {
            if session.rekey_due() {
                session.propose_rekey().await?;
            }
            if serve_file(session, &local, &wire_path).await?.is_break() {
                return Ok(());
            }
        }
    } else {
        session.send_error(ErrorCode::BadPath).await?;
        return Ok(());
    }

    session.send(RecordType::DownloadDone, b"").await?;
    Ok(())
}

/// Whether serving one file ended the whole download.
enum Flow {
    Continue,
    Break,
}

impl Flow {
    fn is_break(&self) -> bool {
        matches!(self, Flow::Break)
    }
}

/// Announce one file, await the ack, stream on accept.
async fn serve_file(session: &mut Session, local: &Path, wire_path: &str) -> Result<Flow> {
    let meta = match sandbox::require_regular_file(local) {
        Ok(meta) => meta,
        Err(e) => {
            session.send_error(e.code()).await?;
            return Ok(Flow::Continue);
        }
    };
    let (mtime_unix, perms) = metadata_of(&meta);

    let open = PathOpen {
        path: wire_path.to_string(),
        size: meta.len(),
        mtime_unix,
        perms,
    };
    session.send(RecordType::PathOpen, &open.encode()).await?;

    // Await the ack; stray per-item error reports about earlier files may
    // arrive first and are only logged.
    loop {
        let record = session.recv_servicing_rekey().await?;
        match record.rtype {
            RecordType::PathAccept => break,
            RecordType::PathSkip => {
                tracing::debug!(path = wire_path, "client skipped file");
                return Ok(Flow::Continue);
            }
            RecordType::ErrorRec => {
                let code = decode_error_byte(&record.payload)?;
                if code.is_per_item() {
                    tracing::debug!(code = %code, "client reported item failure");
                    continue;
                }
                tracing::warn!(code = %code, "client aborted download");
                return Ok(Flow::Break);
            }
            other => {
                return Err(Error::local(
                    ErrorCode::Protocol,
                    format!("expected path ack, got {other:?}"),
                ))
            }
        }
    }

    let mut file = match tokio::fs::File::open(local).await {
        Ok(file) => file,
        Err(e) => {
            session
                .send_error(os_error_code(&e, ErrorCode::ReadFail))
                .await?;
            return Ok(Flow::Break);
        }
    };

    let mut hasher = FileHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match file.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                session
                    .send_error(os_error_code(&e, ErrorCode::ReadFail))
                    .await?;
                return Ok(Flow::Break);
            }
        };
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        session.send(RecordType::FileData, &buf[..n]).await?;
    }
    session
        .send(RecordType::FileClose, &hasher.finalize())
        .await?;
    tracing::debug!(path = wire_path, "file streamed");
    Ok(Flow::Continue)
}

/// Walk a directory tree, collecting regular files as
/// `(local, wire_path)` pairs under the top-level name.
fn collect_tree(dir: &Path, prefix: &str, files: &mut Vec<(PathBuf, String)>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => {
                tracing::warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
                continue;
            }
        };
        let wire_path = format!("{prefix}/{name}");
        if meta.is_dir() {
            collect_tree(&entry.path(), &wire_path, files)?;
        } else if meta.is_file() {
            files.push((entry.path(), wire_path));
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping special file");
        }
    }
    Ok(())
}
