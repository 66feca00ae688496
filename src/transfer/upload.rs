//! Upload state machines: client streams a file, server stages and
//! commits it.
//!
//! Client states: OPEN_WAIT → STREAM → COMMIT_WAIT → DONE | FAILED. Both
//! wait states service rekey proposals arriving from the server without
//! disturbing the reply they are blocked on.

use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::channel::Session;
use crate::error::{os_error_code, Error, ErrorCode, Result};
use crate::sandbox;
use crate::transfer::{apply_metadata, metadata_of, FileHasher, PartFile};
use crate::wire::{RecordType, UploadOpen};
use crate::CHUNK_SIZE;

/// How a single upload ended on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Committed on the server.
    Sent { bytes: u64 },
    /// Destination existed and skip-existing is on.
    Skipped,
}

/// Upload one local file to `wire_path` on the server.
pub async fn send_file(
    session: &mut Session,
    local: &Path,
    wire_path: &str,
    skip_existing: bool,
) -> Result<SendResult> {
    let meta = std::fs::metadata(local)
        .map_err(|e| Error::local(os_error_code(&e, ErrorCode::ReadFail), local.display().to_string()))?;
    let (mtime_unix, perms) = metadata_of(&meta);

    let open = UploadOpen {
        path: wire_path.to_string(),
        mtime_unix,
        perms,
    };
    session.send(RecordType::UploadOpen, &open.encode()).await?;

    // OPEN_WAIT
    loop {
        let record = session.recv_servicing_rekey().await?;
        match record.rtype {
            RecordType::UploadOk => break,
            RecordType::UploadFail => {
                let code = decode_error_byte(&record.payload)?;
                if code == ErrorCode::Exists && skip_existing {
                    tracing::debug!(path = wire_path, "skipping existing remote file");
                    return Ok(SendResult::Skipped);
                }
                return Err(Error::remote(code));
            }
            other => {
                return Err(Error::local(
                    ErrorCode::Protocol,
                    format!("expected UploadOk, got {other:?}"),
                ))
            }
        }
    }

    // STREAM
    let mut file = tokio::fs::File::open(local)
        .await
        .map_err(|e| Error::local(os_error_code(&e, ErrorCode::OpenFail), local.display().to_string()))?;
    let mut hasher = FileHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| Error::local(os_error_code(&e, ErrorCode::ReadFail), local.display().to_string()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        session.send(RecordType::FileData, &buf[..n]).await?;
        bytes += n as u64;
    }
    session
        .send(RecordType::FileClose, &hasher.finalize())
        .await?;

    // COMMIT_WAIT
    loop {
        let record = session.recv_servicing_rekey().await?;
        match record.rtype {
            RecordType::UploadDone => {
                tracing::debug!(path = wire_path, bytes, "upload committed");
                return Ok(SendResult::Sent { bytes });
            }
            RecordType::ErrorRec => {
                let code = decode_error_byte(&record.payload)?;
                if code == ErrorCode::Exists && skip_existing {
                    return Ok(SendResult::Skipped);
                }
                return Err(Error::remote(code));
            }
            other => {
                return Err(Error::local(
                    ErrorCode::Protocol,
                    format!("expected UploadDone, got {other:?}"),
                ))
            }
        }
    }
}

/// Server side: stage, verify and commit one uploaded file.
///
/// Per-item failures are reported to the client and leave the session
/// usable; only session-fatal conditions propagate as errors.
pub async fn handle_upload(
    session: &mut Session,
    root: &Path,
    allow_overwrite: bool,
    payload: &[u8],
) -> Result<()> {
    let open = match UploadOpen::decode(payload) {
        Ok(open) => open,
        Err(e) => {
            session
                .send(RecordType::UploadFail, &[e.code().to_wire()])
                .await?;
            return Ok(());
        }
    };

    let resolved = if session.server_sandboxed() {
        sandbox::resolve_under_root(root, &open.path)
    } else {
        sandbox::resolve_trusted(root, &open.path)
    };
    let dest = match resolved {
        Ok(dest) => dest,
        Err(e) => {
            tracing::warn!(path = %open.path, code = %e.code(), "{}", e.code().server_text());
            session
                .send(RecordType::UploadFail, &[e.code().to_wire()])
                .await?;
            return Ok(());
        }
    };

    if dest.exists() && !allow_overwrite {
        session
            .send(RecordType::UploadFail, &[ErrorCode::Exists.to_wire()])
            .await?;
        return Ok(());
    }

    let mut part = match PartFile::create(&dest).await {
        Ok(part) => part,
        Err(e) => {
            let code = os_error_code(&e, ErrorCode::OpenFail);
            tracing::warn!(path = %open.path, "could not stage upload: {e}");
            session
                .send(RecordType::UploadFail, &[code.to_wire()])
                .await?;
            return Ok(());
        }
    };
    session.send(RecordType::UploadOk, b"").await?;

    let mut hasher = FileHasher::new();
    let received;
    loop {
        let record = session.recv_servicing_rekey().await?;
        match record.rtype {
            RecordType::FileData => {
                hasher.update(&record.payload);
                if let Err(e) = part.write_chunk(&record.payload).await {
                    let code = os_error_code(&e, ErrorCode::WriteFail);
                    tracing::warn!(path = %open.path, "write failed: {e}");
                    part.abort().await;
                    session.send_error(code).await?;
                    return Ok(());
                }
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
                // Client gave up on this file
                let code = decode_error_byte(&record.payload)?;
                tracing::debug!(path = %open.path, code = %code, "client aborted upload");
                part.abort().await;
                return Ok(());
            }
            other => {
                part.abort().await;
                return Err(Error::local(
                    ErrorCode::Protocol,
                    format!("unexpected {other:?} during upload stream"),
                ));
            }
        }
    }

    if hasher.finalize() != received[..] {
        tracing::warn!(path = %open.path, "upload digest mismatch");
        part.abort().await;
        session.send_error(ErrorCode::Checksum).await?;
        return Ok(());
    }

    // The destination may have appeared while we streamed
    if dest.exists() && !allow_overwrite {
        part.abort().await;
        session.send_error(ErrorCode::Exists).await?;
        return Ok(());
    }

    if let Err(e) = part.commit(&dest).await {
        let code = os_error_code(&e, ErrorCode::CommitFail);
        tracing::warn!(path = %open.path, "commit failed: {e}");
        session.send_error(code).await?;
        return Ok(());
    }
    apply_metadata(&dest, open.mtime_unix, &open.perms);

    session.send(RecordType::UploadDone, b"").await?;
    tracing::info!(path = %open.path, "upload committed");
    Ok(())
}

pub(crate) fn decode_error_byte(payload: &[u8]) -> Result<ErrorCode> {
    match payload {
        [byte] => Ok(ErrorCode::from_wire(*byte)),
        _ => Err(Error::local(
            ErrorCode::BadPayload,
            "error record must carry exactly one byte",
        )),
    }
}
