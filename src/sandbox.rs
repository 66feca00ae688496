//! Share-root path containment.
//!
//! Every wire path is validated here before any filesystem access, on
//! both the server (against the share root) and the client (against the
//! download destination, since a hostile server must not escape it).
//!
//! Checks are purely local and synchronous: lexical rejection of absolute
//! paths and `..` segments, then a walk of the existing prefix that
//! refuses symlinked components, so the joined path cannot resolve
//! outside the canonicalized root.

use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{Error, ErrorCode, Result};

/// Resolve a forward-slash wire path under a root, enforcing containment.
///
/// The trailing components may not exist yet (upload destinations);
/// whatever prefix does exist must be plain directories, no symlinks.
pub fn resolve_under_root(root: &Path, wire_path: &str) -> Result<PathBuf> {
    let relative = reject_traversal(wire_path)?;

    let canon_root = fs::canonicalize(root).map_err(|e| {
        Error::local(
            ErrorCode::Config,
            format!("share root {}: {e}", root.display()),
        )
    })?;

    let mut probe = canon_root.clone();
    let components: Vec<_> = relative.components().collect();
    for (index, component) in components.iter().enumerate() {
        probe.push(component);
        match fs::symlink_metadata(&probe) {
            Ok(meta) => {
                if meta.file_type().is_symlink() {
                    return Err(Error::local(
                        ErrorCode::UnsafePath,
                        format!("{wire_path}: symlink in path"),
                    ));
                }
                if index < components.len() - 1 && !meta.is_dir() {
                    return Err(Error::local(
                        ErrorCode::BadPath,
                        format!("{wire_path}: prefix is not a directory"),
                    ));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(canon_root.join(relative))
}

/// Join a wire path under a root without containment checks.
///
/// Only used when the server runs unsandboxed; traversal segments are
/// still rejected so relative paths stay relative.
pub fn resolve_trusted(root: &Path, wire_path: &str) -> Result<PathBuf> {
    let relative = reject_traversal(wire_path)?;
    Ok(root.join(relative))
}

/// Lexical validation shared by both resolution modes: no absolute
/// paths, no `..` segments, at least one usable component.
fn reject_traversal(wire_path: &str) -> Result<PathBuf> {
    if wire_path.starts_with('/') || Path::new(wire_path).is_absolute() {
        return Err(Error::local(
            ErrorCode::Absolute,
            format!("{wire_path}: absolute path"),
        ));
    }

    let mut relative = PathBuf::new();
    for segment in wire_path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::local(
                    ErrorCode::UnsafePath,
                    format!("{wire_path}: parent traversal"),
                ))
            }
            other => {
                // A segment that smuggles a separator or drive prefix is
                // refused rather than reinterpreted.
                if Path::new(other).components().count() != 1
                    || !matches!(
                        Path::new(other).components().next(),
                        Some(Component::Normal(_))
                    )
                {
                    return Err(Error::local(
                        ErrorCode::BadPath,
                        format!("{wire_path}: unusable segment {other:?}"),
                    ));
                }
                relative.push(other);
            }
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(Error::local(
            ErrorCode::BadPath,
            format!("{wire_path:?}: empty path"),
        ));
    }
    Ok(relative)
}

/// Require an existing regular file (not a symlink, not a device).
pub fn require_regular_file(path: &Path) -> Result<fs::Metadata> {
    let meta = fs::symlink_metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            Error::local(ErrorCode::NotFound, path.display().to_string())
        }
        _ => e.into(),
    })?;
    if !meta.is_file() {
        return Err(Error::local(
            ErrorCode::BadPath,
            format!("{}: not a regular file", path.display()),
        ));
    }
    Ok(meta)
}
