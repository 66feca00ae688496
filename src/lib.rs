//! # Depot
//!
//! Point-to-point secure file transfer over a post-quantum authenticated
//! record channel.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Client API / Server dispatch (upload, download, list)  │
//! ├─────────────────────────────────────────────────────────┤
//! │  Transfer state machines (.part staging, checksums)     │
//! ├─────────────────────────────────────────────────────────┤
//! │  Record channel (framing, sequencing, rekeying)         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Handshake (Kyber KEM + Dilithium identity + TOFU)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto layer (XChaCha20-Poly1305, BLAKE2b, Argon2id)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Post-quantum security**: CRYSTALS-Kyber key establishment and
//!    CRYSTALS-Dilithium identities, bound together by a transcript digest
//! 2. **Integrity**: every file commits atomically after checksum
//!    verification; readers never observe half-written destinations
//! 3. **Forward isolation**: in-place rekeying at file boundaries rotates
//!    traffic keys without tearing down the session
//! 4. **Containment**: all remote paths resolve inside a sandboxed share root

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod channel;
pub mod client;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod sandbox;
pub mod server;
pub mod transfer;
pub mod wire;

pub use client::{Client, ClientConfig, TransferSummary};
pub use error::{Error, ErrorCode, Result};
pub use server::{Server, ServerConfig};

/// Protocol version negotiated in the hello exchange.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default server port.
pub const DEFAULT_PORT: u16 = 60006;

/// Default bound on a single blocking receive (milliseconds).
pub const DEFAULT_IO_TIMEOUT_MS: u64 = 120_000;

/// Default interval after which a stream sender proposes a rekey at the
/// next file boundary (milliseconds).
pub const DEFAULT_REKEY_INTERVAL_MS: u64 = 900_000;

/// Preferred file streaming chunk size.
pub const CHUNK_SIZE: usize = 1024 * 1024;
