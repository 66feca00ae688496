//! Non-recursive directory listing.
//!
//! A ListOpen naming a directory streams its immediate children as
//! batched ListChunk records; naming a regular file yields a single
//! entry. Chunks flush before exceeding the ~64 KiB target.

use std::path::Path;

use bytes::BytesMut;

use crate::channel::Session;
use crate::error::{os_error_code, Error, ErrorCode, Result};
use crate::sandbox;
use crate::transfer::upload::decode_error_byte;
use crate::wire::{self, EntryKind, ListEntry, RecordType, LIST_CHUNK_TARGET};

/// Request a listing of a remote path.
pub async fn list(session: &mut Session, remote_path: &str) -> Result<Vec<ListEntry>> {
    session
        .send(RecordType::ListOpen, &wire::encode_path_payload(remote_path))
        .await?;

    let mut entries = Vec::new();
    loop {
        let record = session.recv_servicing_rekey().await?;
        match record.rtype {
            RecordType::ListChunk => {
                entries.extend(ListEntry::decode_chunk(&record.payload)?);
            }
            RecordType::ListDone => return Ok(entries),
            RecordType::ErrorRec => {
                return Err(Error::remote(decode_error_byte(&record.payload)?))
            }
            other => {
                return Err(Error::local(
                    ErrorCode::Protocol,
                    format!("unexpected {other:?} during listing"),
                ))
            }
        }
    }
}

/// Server side: resolve the path and stream listing chunks.
pub async fn handle_list(session: &mut Session, root: &Path, payload: &[u8]) -> Result<()> {
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

    let mut chunk = BytesMut::new();

    if meta.is_file() {
        let name = Path::new(&requested)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&requested);
        ListEntry {
            path: name.to_string(),
            size: meta.len(),
            kind: EntryKind::File,
        }
        .encode_into(&mut chunk);
    } else if meta.is_dir() {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&base)? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let meta = entry.metadata()?;
            let kind = if meta.is_dir() {
                EntryKind::Dir
            } else if meta.is_file() {
                EntryKind::File
            } else {
                continue;
            };
            names.push(ListEntry {
                path: name,
                size: if kind == EntryKind::File { meta.len() } else { 0 },
                kind,
            });
        }
        names.sort_by(|a, b| a.path.cmp(&b.path));

        for entry in names {
            let projected = chunk.len() + entry.path.len() + 2 * wire::MAX_VARINT_LEN + 1;
            if !chunk.is_empty() && projected > LIST_CHUNK_TARGET {
                session.send(RecordType::ListChunk, &chunk).await?;
                chunk.clear();
            }
            entry.encode_into(&mut chunk);
        }
    } else {
        session.send_error(ErrorCode::BadPath).await?;
        return Ok(());
    }

    if !chunk.is_empty() {
        session.send(RecordType::ListChunk, &chunk).await?;
    }
    session.send(RecordType::ListDone, b"").await?;
    Ok(())
}
