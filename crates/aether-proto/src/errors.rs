//! Structural errors for record parsing and encoding.
//!
//! These cover framing violations only. Cryptographic failures (tag
//! mismatch, replay, key derivation) live in `aether-crypto`; they are
//! deliberately kept out of this crate so the codec can be fuzzed and
//! property-tested without key material.

use thiserror::Error;

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while parsing or emitting records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is shorter than the structure it should contain.
    #[error("record too short: expected {expected} bytes, got {actual}")]
    RecordTooShort {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Header version byte does not match [`crate::PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// Header type byte is not a known [`crate::RecordKind`].
    #[error("unknown record kind: {0:#04x}")]
    UnknownKind(u8),

    /// Framed length exceeds [`crate::MAX_RECORD_TOTAL`] or is below the
    /// header size.
    #[error("framed length {length} outside [{min}, {max}]")]
    BadFramedLength {
        /// Length prefix read from the wire.
        length: usize,
        /// Minimum legal framed length (header size).
        min: usize,
        /// Maximum legal framed length.
        max: usize,
    },

    /// `payload_length + padding_length` does not match the framed body.
    #[error("length fields inconsistent: payload {payload} + padding {padding} != body {body}")]
    LengthMismatch {
        /// Header payload length.
        payload: usize,
        /// Header padding length.
        padding: usize,
        /// Bytes actually present after the header.
        body: usize,
    },

    /// Metadata payload is structurally invalid.
    #[error("malformed metadata payload: {0}")]
    MalformedMetadata(&'static str),

    /// Error payload is structurally invalid.
    #[error("malformed error payload: {0}")]
    MalformedError(&'static str),
}
