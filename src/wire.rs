//! Wire format primitives.
//!
//! Defines the record type constants, the LEB128 varint used throughout
//! the protocol, and the payload codecs for transfer control records.
//!
//! Frame wire format (after the handshake):
//! ```text
//! ┌──────────────────┬──────────┬────────────────┬──────────┐
//! │ varint(body_len) │ type (1) │ ciphertext (n) │ tag (16) │
//! └──────────────────┴──────────┴────────────────┴──────────┘
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, ErrorCode, Result};

/// Maximum encoded length of a varint (u64, 7 bits per byte).
pub const MAX_VARINT_LEN: usize = 10;

/// Target upper bound for a single listing chunk payload.
pub const LIST_CHUNK_TARGET: usize = 64 * 1024;

/// Record types exchanged on the encrypted channel.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    /// Opaque file content bytes
    FileData = 0x11,
    /// End of file stream, carrying the BLAKE2b-256 digest
    FileClose = 0x12,
    /// Coded error report
    ErrorRec = 0x13,
    /// Announce a file about to be streamed (download direction)
    PathOpen = 0x21,
    /// Receiver wants the announced file
    PathAccept = 0x22,
    /// Receiver declines the announced file
    PathSkip = 0x23,
    /// Open an upload (client → server)
    UploadOpen = 0x30,
    /// Upload destination staged, send data
    UploadOk = 0x31,
    /// Upload rejected, carrying a code byte
    UploadFail = 0x32,
    /// Upload committed
    UploadDone = 0x33,
    /// Request a file or tree (client → server)
    DownloadOpen = 0x40,
    /// All requested items delivered
    DownloadDone = 0x41,
    /// Request a directory listing
    ListOpen = 0x50,
    /// Batch of listing entries
    ListChunk = 0x51,
    /// End of listing
    ListDone = 0x52,
    /// Propose a key rotation, carrying 4 epoch bytes
    RekeyReq = 0x60,
    /// Accept a key rotation, echoing the epoch bytes
    RekeyAck = 0x61,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use RecordType::*;
        match value {
            0x11 => Ok(FileData),
            0x12 => Ok(FileClose),
            0x13 => Ok(ErrorRec),
            0x21 => Ok(PathOpen),
            0x22 => Ok(PathAccept),
            0x23 => Ok(PathSkip),
            0x30 => Ok(UploadOpen),
            0x31 => Ok(UploadOk),
            0x32 => Ok(UploadFail),
            0x33 => Ok(UploadDone),
            0x40 => Ok(DownloadOpen),
            0x41 => Ok(DownloadDone),
            0x50 => Ok(ListOpen),
            0x51 => Ok(ListChunk),
            0x52 => Ok(ListDone),
            0x60 => Ok(RekeyReq),
            0x61 => Ok(RekeyAck),
            _ => Err(Error::local(
                ErrorCode::Protocol,
                format!("unknown record type 0x{value:02x}"),
            )),
        }
    }
}

/// Handshake blob types exchanged before the channel is keyed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    ClientHello = 0x00,
    ServerId = 0x01,
    KemPk = 0x02,
    KemEnv = 0x03,
    ServerHello = 0x04,
    ClientAuth = 0x05,
    Error = 0x06,
}

impl TryFrom<u8> for HandshakeType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use HandshakeType::*;
        match value {
            0x00 => Ok(ClientHello),
            0x01 => Ok(ServerId),
            0x02 => Ok(KemPk),
            0x03 => Ok(KemEnv),
            0x04 => Ok(ServerHello),
            0x05 => Ok(ClientAuth),
            0x06 => Ok(Error),
            _ => Err(crate::error::Error::local(
                ErrorCode::Protocol,
                format!("unknown handshake type 0x{value:02x}"),
            )),
        }
    }
}

/// Append an unsigned LEB128 varint.
pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Decode an unsigned LEB128 varint from a buffer.
///
/// Rejects encodings longer than [`MAX_VARINT_LEN`] bytes and truncated
/// input with `bad-payload`.
pub fn get_varint(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_LEN {
        if !buf.has_remaining() {
            return Err(Error::local(ErrorCode::BadPayload, "truncated varint"));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
                return Err(Error::local(ErrorCode::BadPayload, "varint overflow"));
            }
            return Ok(value);
        }
        shift += 7;
    }
    Err(Error::local(ErrorCode::BadPayload, "varint too long"))
}

fn get_path(buf: &mut impl Buf) -> Result<String> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::local(ErrorCode::BadPayload, "truncated path"));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes)
        .map_err(|_| Error::local(ErrorCode::BadPayload, "path is not valid UTF-8"))
}

fn put_path(buf: &mut BytesMut, path: &str) {
    put_varint(buf, path.len() as u64);
    buf.put_slice(path.as_bytes());
}

/// A portable permission bit, one byte on the wire.
///
/// Absent permissions are simply omitted from the set; platforms without
/// a POSIX permission model carry whatever subset they can express.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilePermission {
    OwnerRead = 0,
    OwnerWrite = 1,
    OwnerExec = 2,
    GroupRead = 3,
    GroupWrite = 4,
    GroupExec = 5,
    OtherRead = 6,
    OtherWrite = 7,
    OtherExec = 8,
}

impl TryFrom<u8> for FilePermission {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use FilePermission::*;
        match value {
            0 => Ok(OwnerRead),
            1 => Ok(OwnerWrite),
            2 => Ok(OwnerExec),
            3 => Ok(GroupRead),
            4 => Ok(GroupWrite),
            5 => Ok(GroupExec),
            6 => Ok(OtherRead),
            7 => Ok(OtherWrite),
            8 => Ok(OtherExec),
            _ => Err(Error::local(
                ErrorCode::BadPayload,
                format!("unknown permission ordinal {value}"),
            )),
        }
    }
}

impl FilePermission {
    const MODE_BITS: [(FilePermission, u32); 9] = [
        (FilePermission::OwnerRead, 0o400),
        (FilePermission::OwnerWrite, 0o200),
        (FilePermission::OwnerExec, 0o100),
        (FilePermission::GroupRead, 0o040),
        (FilePermission::GroupWrite, 0o020),
        (FilePermission::GroupExec, 0o010),
        (FilePermission::OtherRead, 0o004),
        (FilePermission::OtherWrite, 0o002),
        (FilePermission::OtherExec, 0o001),
    ];

    /// Extract the permission set from a Unix mode word.
    pub fn from_mode(mode: u32) -> Vec<FilePermission> {
        Self::MODE_BITS
            .iter()
            .filter(|(_, bit)| mode & bit != 0)
            .map(|(perm, _)| *perm)
            .collect()
    }

    /// Reassemble a Unix mode word from a permission set.
    pub fn to_mode(perms: &[FilePermission]) -> u32 {
        Self::MODE_BITS
            .iter()
            .filter(|(perm, _)| perms.contains(perm))
            .map(|(_, bit)| bit)
            .sum()
    }
}

fn put_perms(buf: &mut BytesMut, perms: &[FilePermission]) {
    put_varint(buf, perms.len() as u64);
    for perm in perms {
        buf.put_u8(*perm as u8);
    }
}

fn get_perms(buf: &mut impl Buf) -> Result<Vec<FilePermission>> {
    let count = get_varint(buf)? as usize;
    if count > 9 || buf.remaining() < count {
        return Err(Error::local(ErrorCode::BadPayload, "bad permission list"));
    }
    let mut perms = Vec::with_capacity(count);
    for _ in 0..count {
        perms.push(FilePermission::try_from(buf.get_u8())?);
    }
    Ok(perms)
}

/// Payload of an `UploadOpen` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOpen {
    /// Forward-slash relative destination path
    pub path: String,
    /// Source modification time, Unix seconds
    pub mtime_unix: i64,
    /// Source permission set
    pub perms: Vec<FilePermission>,
}

impl UploadOpen {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.path.len() + 24);
        put_path(&mut buf, &self.path);
        put_varint(&mut buf, self.mtime_unix as u64);
        put_perms(&mut buf, &self.perms);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let path = get_path(&mut buf)?;
        let mtime_unix = get_varint(&mut buf)? as i64;
        let perms = get_perms(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::local(ErrorCode::BadPayload, "trailing bytes"));
        }
        Ok(Self {
            path,
            mtime_unix,
            perms,
        })
    }
}

/// Payload of a `PathOpen` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathOpen {
    /// Forward-slash relative path under the requested base
    pub path: String,
    /// File size in bytes
    pub size: u64,
    /// Source modification time, Unix seconds
    pub mtime_unix: i64,
    /// Source permission set
    pub perms: Vec<FilePermission>,
}

impl PathOpen {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.path.len() + 32);
        put_path(&mut buf, &self.path);
        put_varint(&mut buf, self.size);
        put_varint(&mut buf, self.mtime_unix as u64);
        put_perms(&mut buf, &self.perms);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let path = get_path(&mut buf)?;
        let size = get_varint(&mut buf)?;
        let mtime_unix = get_varint(&mut buf)? as i64;
        let perms = get_perms(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::local(ErrorCode::BadPayload, "trailing bytes"));
        }
        Ok(Self {
            path,
            size,
            mtime_unix,
            perms,
        })
    }
}

/// Encode the bare-path payload used by `DownloadOpen` and `ListOpen`.
pub fn encode_path_payload(path: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(path.len() + 4);
    put_path(&mut buf, path);
    buf
}

/// Decode the bare-path payload used by `DownloadOpen` and `ListOpen`.
pub fn decode_path_payload(payload: &[u8]) -> Result<String> {
    let mut buf = payload;
    let path = get_path(&mut buf)?;
    if buf.has_remaining() {
        return Err(Error::local(ErrorCode::BadPayload, "trailing bytes"));
    }
    Ok(path)
}

/// Kind discriminant inside a listing entry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File = 0,
    Dir = 1,
}

/// One entry in a listing chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub path: String,
    pub size: u64,
    pub kind: EntryKind,
}

impl ListEntry {
    /// Append this entry to a chunk under construction.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        put_path(buf, &self.path);
        put_varint(buf, self.size);
        buf.put_u8(self.kind as u8);
    }

    /// Decode every entry of a `ListChunk` payload.
    pub fn decode_chunk(payload: &[u8]) -> Result<Vec<ListEntry>> {
        let mut buf = payload;
        let mut entries = Vec::new();
        while buf.has_remaining() {
            let path = get_path(&mut buf)?;
            let size = get_varint(&mut buf)?;
            if !buf.has_remaining() {
                return Err(Error::local(ErrorCode::BadPayload, "truncated entry"));
            }
            let kind = match buf.get_u8() {
                0 => EntryKind::File,
                1 => EntryKind::Dir,
                k => {
                    return Err(Error::local(
                        ErrorCode::BadPayload,
                        format!("unknown entry kind {k}"),
                    ))
                }
            };
            entries.push(ListEntry { path, size, kind });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        for value in [
            0u64,
            1,
            127,
            128,
            16383,
            16384,
            (1 << 32) - 1,
            (1 << 63) - 1,
            u64::MAX,
        ] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert!(buf.len() <= MAX_VARINT_LEN);

            let mut slice = &buf[..];
            assert_eq!(get_varint(&mut slice).unwrap(), value);
            assert!(!slice.has_remaining());
        }
    }

    #[test]
    fn test_varint_length_cap() {
        let mut overlong = &[0x80u8; 11][..];
        let err = get_varint(&mut overlong).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadPayload);

        // Ten continuation-free bytes encoding more than 64 bits
        let mut too_big = &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f][..];
        assert!(get_varint(&mut too_big).is_err());
    }

    #[test]
    fn test_varint_truncated() {
        let mut truncated = &[0x80u8][..];
        assert_eq!(
            get_varint(&mut truncated).unwrap_err().code(),
            ErrorCode::BadPayload
        );
    }

    #[test]
    fn test_record_type_round_trip() {
        for byte in [
            0x11u8, 0x12, 0x13, 0x21, 0x22, 0x23, 0x30, 0x31, 0x32, 0x33, 0x40, 0x41, 0x50, 0x51,
            0x52, 0x60, 0x61,
        ] {
            let rtype = RecordType::try_from(byte).unwrap();
            assert_eq!(rtype as u8, byte);
        }
        assert!(RecordType::try_from(0x7f).is_err());
    }

    #[test]
    fn test_upload_open_round_trip() {
        use FilePermission::*;

        for perms in [
            vec![],
            vec![OwnerRead, OwnerWrite, GroupRead, OtherRead],
            vec![
                OwnerRead, OwnerWrite, OwnerExec, GroupRead, GroupWrite, GroupExec, OtherRead,
                OtherWrite, OtherExec,
            ],
        ] {
            let open = UploadOpen {
                path: "dir/alpha.bin".to_string(),
                mtime_unix: 1_700_000_000,
                perms,
            };
            let encoded = open.encode();
            assert_eq!(UploadOpen::decode(&encoded).unwrap(), open);
        }
    }

    #[test]
    fn test_upload_open_rejects_trailing_bytes() {
        let open = UploadOpen {
            path: "x".to_string(),
            mtime_unix: 0,
            perms: vec![],
        };
        let mut encoded = open.encode();
        encoded.put_u8(0);
        assert!(UploadOpen::decode(&encoded).is_err());
    }

    #[test]
    fn test_path_open_round_trip() {
        let open = PathOpen {
            path: "mixdir/child/a.bin".to_string(),
            size: 65_537,
            mtime_unix: 1_650_000_000,
            perms: vec![FilePermission::OwnerRead, FilePermission::OwnerWrite],
        };
        let encoded = open.encode();
        assert_eq!(PathOpen::decode(&encoded).unwrap(), open);
    }

    #[test]
    fn test_permission_mode_round_trip() {
        for mode in [0o000u32, 0o644, 0o755, 0o777, 0o600] {
            let perms = FilePermission::from_mode(mode);
            assert_eq!(FilePermission::to_mode(&perms), mode);
        }
    }

    #[test]
    fn test_list_entries_round_trip() {
        let entries = vec![
            ListEntry {
                path: "notes.txt".to_string(),
                size: 4096,
                kind: EntryKind::File,
            },
            ListEntry {
                path: "archive".to_string(),
                size: 0,
                kind: EntryKind::Dir,
            },
        ];

        let mut buf = BytesMut::new();
        for entry in &entries {
            entry.encode_into(&mut buf);
        }
        assert_eq!(ListEntry::decode_chunk(&buf).unwrap(), entries);
    }

    #[test]
    fn test_path_payload_round_trip() {
        let encoded = encode_path_payload("a/b/c.txt");
        assert_eq!(decode_path_payload(&encoded).unwrap(), "a/b/c.txt");

        assert!(decode_path_payload(&[0x03, b'a']).is_err());
    }
}
