//! Error taxonomy for the depot protocol.
//!
//! Failures cross the wire as a single code byte; human-readable text never
//! leaves the process. Each code carries two renderings, one for client logs
//! and one for server logs, plus a behavioral category that decides whether
//! the session, the batch, or just the current item dies.

use std::fmt;

use thiserror::Error;

/// Result type alias for depot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire error codes. The discriminant is the byte sent on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Unclassified failure
    Unknown = 0,
    /// Destination already exists and overwrite is disabled
    Exists = 1,
    /// Item excluded by a transfer filter
    Filter = 2,
    /// No space left on the receiving filesystem
    NoSpace = 3,
    /// Permission denied by the operating system
    Perms = 4,
    /// Remote path was absolute
    Absolute = 5,
    /// Remote path attempted to escape the share root
    UnsafePath = 6,
    /// Remote path was malformed or not a usable file
    BadPath = 7,
    /// Wire payload failed to decode
    BadPayload = 8,
    /// Opening a file failed
    OpenFail = 9,
    /// Writing file data failed
    WriteFail = 10,
    /// Reading file data failed
    ReadFail = 11,
    /// Requested path does not exist
    NotFound = 12,
    /// Receive deadline expired
    Timeout = 13,
    /// File digest mismatch
    Checksum = 14,
    /// Local configuration is unusable
    Config = 15,
    /// Peers do not share a required protocol feature
    Compat = 16,
    /// Authentication failed
    Auth = 17,
    /// Connection closed mid-protocol
    Closed = 18,
    /// Could not establish a connection
    Connect = 19,
    /// Peer violated the protocol state machine
    Protocol = 20,
    /// Atomic commit of a completed file failed
    CommitFail = 21,
    /// Concurrent writer conflict on the destination
    Conflict = 22,
    /// Remote peer sent a path the local side refuses to touch
    BadRemote = 23,
}

impl ErrorCode {
    /// Decode a wire byte. Unrecognized bytes collapse to `Unknown`.
    pub fn from_wire(byte: u8) -> Self {
        use ErrorCode::*;
        match byte {
            0 => Unknown,
            1 => Exists,
            2 => Filter,
            3 => NoSpace,
            4 => Perms,
            5 => Absolute,
            6 => UnsafePath,
            7 => BadPath,
            8 => BadPayload,
            9 => OpenFail,
            10 => WriteFail,
            11 => ReadFail,
            12 => NotFound,
            13 => Timeout,
            14 => Checksum,
            15 => Config,
            16 => Compat,
            17 => Auth,
            18 => Closed,
            19 => Connect,
            20 => Protocol,
            21 => CommitFail,
            22 => Conflict,
            23 => BadRemote,
            _ => Unknown,
        }
    }

    /// The byte sent on the wire.
    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Codes that terminate the session; no further records are exchanged.
    pub fn is_session_fatal(self) -> bool {
        use ErrorCode::*;
        matches!(
            self,
            Closed | Timeout | Protocol | Compat | Auth | Config | Connect
        )
    }

    /// Codes that abort the current batch for the peer that hit them.
    pub fn is_local_fatal(self) -> bool {
        use ErrorCode::*;
        matches!(self, NoSpace | Perms | OpenFail | WriteFail | ReadFail)
    }

    /// Codes that abort only the current file; the batch continues.
    pub fn is_per_item(self) -> bool {
        use ErrorCode::*;
        matches!(
            self,
            Exists | NotFound | BadPath | UnsafePath | Absolute | Checksum | Filter | Conflict
        )
    }

    /// Rendering used in client-side logs and CLI output.
    pub fn client_text(self) -> &'static str {
        use ErrorCode::*;
        match self {
            Unknown => "the transfer failed for an unknown reason",
            Exists => "the remote file already exists",
            Filter => "the item was excluded by a filter",
            NoSpace => "the server is out of disk space",
            Perms => "the server denied permission",
            Absolute => "absolute remote paths are not allowed",
            UnsafePath => "the remote path escapes the share root",
            BadPath => "the remote path is not usable",
            BadPayload => "the server sent a malformed message",
            OpenFail => "the server could not open the file",
            WriteFail => "the server could not write the file",
            ReadFail => "the server could not read the file",
            NotFound => "the remote path does not exist",
            Timeout => "the server stopped responding",
            Checksum => "the file arrived corrupted",
            Config => "local configuration is invalid",
            Compat => "the server speaks an incompatible protocol",
            Auth => "authentication with the server failed",
            Closed => "the connection closed unexpectedly",
            Connect => "could not connect to the server",
            Protocol => "the server violated the protocol",
            CommitFail => "the server could not finalize the file",
            Conflict => "another transfer owns the destination",
            BadRemote => "the server sent a path this client refuses",
        }
    }

    /// Rendering used in server-side logs.
    pub fn server_text(self) -> &'static str {
        use ErrorCode::*;
        match self {
            Unknown => "unclassified failure",
            Exists => "destination exists and overwrite is disabled",
            Filter => "item excluded by filter",
            NoSpace => "filesystem out of space",
            Perms => "operating system denied permission",
            Absolute => "client sent an absolute path",
            UnsafePath => "client path escapes the share root",
            BadPath => "client path is malformed or not a regular file",
            BadPayload => "client sent a malformed payload",
            OpenFail => "could not open file",
            WriteFail => "could not write file data",
            ReadFail => "could not read file data",
            NotFound => "requested path does not exist",
            Timeout => "client stopped responding",
            Checksum => "received data failed digest verification",
            Config => "server configuration is invalid",
            Compat => "client speaks an incompatible protocol",
            Auth => "client failed authentication",
            Closed => "connection closed mid-protocol",
            Connect => "connection could not be established",
            Protocol => "client violated the protocol",
            CommitFail => "atomic commit failed",
            Conflict => "concurrent writer conflict",
            BadRemote => "client reported a refused path",
        }
    }

    fn mnemonic(self) -> &'static str {
        use ErrorCode::*;
        match self {
            Unknown => "unknown",
            Exists => "exists",
            Filter => "filter",
            NoSpace => "no-space",
            Perms => "perms",
            Absolute => "absolute",
            UnsafePath => "unsafe-path",
            BadPath => "bad-path",
            BadPayload => "bad-payload",
            OpenFail => "open-fail",
            WriteFail => "write-fail",
            ReadFail => "read-fail",
            NotFound => "not-found",
            Timeout => "timeout",
            Checksum => "checksum",
            Config => "config",
            Compat => "compat",
            Auth => "auth",
            Closed => "closed",
            Connect => "connect",
            Protocol => "protocol",
            CommitFail => "commit-fail",
            Conflict => "conflict",
            BadRemote => "bad-remote",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Translate an OS error into a wire code, with a caller-supplied fallback
/// for anything that has no portable mapping.
pub fn os_error_code(err: &std::io::Error, fallback: ErrorCode) -> ErrorCode {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::PermissionDenied => ErrorCode::Perms,
        ErrorKind::NotFound => ErrorCode::NotFound,
        ErrorKind::StorageFull => ErrorCode::NoSpace,
        ErrorKind::AlreadyExists => ErrorCode::Exists,
        ErrorKind::TimedOut => ErrorCode::Timeout,
        ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
            ErrorCode::Closed
        }
        _ => fallback,
    }
}

/// Errors raised by depot operations.
///
/// Every variant maps onto a wire code via [`Error::code`]; `Remote` carries
/// a code the peer reported, everything else is locally detected.
#[derive(Error, Debug)]
pub enum Error {
    /// The peer reported a coded failure.
    #[error("peer reported [{code}]: {}", .code.client_text())]
    Remote { code: ErrorCode },

    /// A locally detected failure with its wire classification.
    #[error("[{code}] {context}")]
    Local { code: ErrorCode, context: String },

    /// Transport-level I/O failure.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl Error {
    /// A failure reported by the remote peer.
    pub fn remote(code: ErrorCode) -> Self {
        Error::Remote { code }
    }

    /// A locally detected failure.
    pub fn local(code: ErrorCode, context: impl Into<String>) -> Self {
        Error::Local {
            code,
            context: context.into(),
        }
    }

    /// The wire code this error would carry.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Remote { code } => *code,
            Error::Local { code, .. } => *code,
            Error::Network(e) => os_error_code(e, ErrorCode::Closed),
        }
    }

    /// Whether this error terminates the session.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Network(_)) || self.code().is_session_fatal()
    }
}
