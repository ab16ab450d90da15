//! Wire records for the Aether-Realist relay protocol.
//!
//! Every byte that crosses a tunnel stream belongs to exactly one *record*:
//! a fixed 30-byte big-endian header, a variable payload, and variable
//! random padding, prefixed on the stream by a `u32` total length. This
//! crate owns the structural layer only - it parses and emits records
//! without touching keys. Sealing and opening payloads is the job of
//! `aether-crypto`; moving records over a transport is the job of the
//! record pump in `aether-core`.
//!
//! # Invariants
//!
//! - Every accepted record carries [`PROTOCOL_VERSION`].
//! - The length prefix always equals `30 + payload_length + padding_length`
//!   and never exceeds [`MAX_RECORD_TOTAL`].
//! - Padding bytes carry no information and are ignored by receivers.

mod errors;
mod header;
pub mod payloads;
mod record;

pub use errors::{ProtocolError, Result};
pub use header::RecordHeader;
pub use payloads::{ErrorCode, ErrorPayload, MetadataPayload, TargetAddr};
pub use record::Record;

/// Protocol version carried in byte 0 of every record header.
pub const PROTOCOL_VERSION: u8 = 0x05;

/// Hard ceiling on `header + payload + padding` (the framed length).
pub const MAX_RECORD_TOTAL: usize = 1024 * 1024;

/// ALPN protocol identifier negotiated on the QUIC handshake.
pub const ALPN_PROTOCOL: &[u8] = b"aether/5";

/// Record type discriminator (header byte 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// First record on every client-opened stream: encrypted target address.
    Metadata = 0x01,
    /// Encrypted application bytes.
    Data = 0x02,
    /// Liveness probe; carries no payload.
    Ping = 0x03,
    /// Reply to [`RecordKind::Ping`]; carries no payload.
    Pong = 0x04,
    /// Unencrypted structured failure report.
    Error = 0x7F,
}

impl RecordKind {
    /// Parse a record kind from its wire byte. `None` if unrecognized.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Metadata),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Ping),
            0x04 => Some(Self::Pong),
            0x7F => Some(Self::Error),
            _ => None,
        }
    }

    /// Wire byte for this kind.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}
