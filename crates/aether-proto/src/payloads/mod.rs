//! Plaintext payload structures.
//!
//! Record payloads are fixed binary layouts, not self-describing formats:
//! the record kind in the header fully determines how the payload parses,
//! and the metadata payload's forward-compatibility hatch is its TLV
//! option list, where unknown tags are skipped. Metadata payloads are
//! always sealed before they reach the wire; error payloads travel as
//! plain framed records.

use bytes::{BufMut, BytesMut};

use crate::errors::{ProtocolError, Result};

mod metadata;

pub use metadata::{MetadataPayload, TargetAddr};

/// Wire error codes carried by Error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Record failed structural or cryptographic validation mid-stream.
    BadRecord = 0x0001,
    /// Metadata record failed to decrypt during handshake.
    MetadataDecrypt = 0x0002,
    /// Peer requested an unsupported operation.
    Unsupported = 0x0003,
    /// Gateway could not reach the requested target.
    TargetConnect = 0x0004,
    /// Owning session went away while the stream was live.
    StreamAbort = 0x0005,
    /// Counter exhaustion or stream-count ceiling.
    ResourceLimit = 0x0006,
    /// An operation exceeded its deadline.
    Timeout = 0x0007,
}

impl ErrorCode {
    /// Parse an error code from its wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::BadRecord),
            0x0002 => Some(Self::MetadataDecrypt),
            0x0003 => Some(Self::Unsupported),
            0x0004 => Some(Self::TargetConnect),
            0x0005 => Some(Self::StreamAbort),
            0x0006 => Some(Self::ResourceLimit),
            0x0007 => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Wire value for this code.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Stable string form surfaced to CLI/GUI consumers via events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRecord => "bad_record",
            Self::MetadataDecrypt => "metadata_decrypt",
            Self::Unsupported => "unsupported",
            Self::TargetConnect => "target_connect",
            Self::StreamAbort => "stream_abort",
            Self::ResourceLimit => "resource_limit",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an Error record.
///
/// Layout: `code: u16`, `reserved: u16 = 0`, then the UTF-8 message
/// occupying the rest of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    /// Wire error code.
    pub code: ErrorCode,
    /// Human-readable detail. Kept short; this crosses the wire.
    pub message: String,
}

impl ErrorPayload {
    /// Create an error payload.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    /// Serialize to payload bytes.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4 + self.message.len());
        buf.put_u16(self.code.to_u16());
        buf.put_u16(0); // reserved
        buf.put_slice(self.message.as_bytes());
        buf
    }

    /// Parse from payload bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MalformedError` on truncation, a non-zero
    ///   reserved field, an unknown code, or non-UTF-8 message bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(ProtocolError::MalformedError("shorter than code+reserved"));
        }

        let code = u16::from_be_bytes([bytes[0], bytes[1]]);
        let reserved = u16::from_be_bytes([bytes[2], bytes[3]]);
        if reserved != 0 {
            return Err(ProtocolError::MalformedError("reserved field not zero"));
        }

        let code = ErrorCode::from_u16(code).ok_or(ProtocolError::MalformedError("unknown error code"))?;
        let message = std::str::from_utf8(&bytes[4..])
            .map_err(|_| ProtocolError::MalformedError("message not valid UTF-8"))?
            .to_string();

        Ok(Self { code, message })
    }
}
