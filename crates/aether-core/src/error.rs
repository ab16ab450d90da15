//! Error types for the shared endpoint runtime.
//!
//! Errors are classified by kind, not by container: transport failures
//! surface to the state machine, cryptographic and protocol failures stay
//! on the stream that produced them, and peer-reported failures carry the
//! wire error code. We avoid `std::io::Error` for protocol logic and only
//! convert at async I/O boundaries.

use aether_proto::{ErrorCode, ProtocolError};
use thiserror::Error;

use crate::state::CoreState;

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the shared runtime.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Structural framing violation (close the stream, keep the session).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cryptographic validation failure (replay, tag mismatch, counter).
    #[error("crypto error: {0}")]
    Crypto(#[from] aether_crypto::CryptoError),

    /// Transport-level I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer reported a structured error on the stream.
    #[error("peer error {code}: {message}")]
    Peer {
        /// Wire error code from the Error record.
        code: ErrorCode,
        /// Message carried by the Error record.
        message: String,
    },

    /// A record of the wrong kind arrived for the current stream phase.
    #[error("unexpected record kind: expected {expected}")]
    UnexpectedRecord {
        /// What the stream phase required.
        expected: &'static str,
    },

    /// An illegal core state transition was attempted.
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the core was in.
        from: CoreState,
        /// State that was requested.
        to: CoreState,
    },

    /// The core is not in a state that permits the operation.
    #[error("operation requires Active state, core is {state:?}")]
    NotActive {
        /// Current core state.
        state: CoreState,
    },

    /// Session-layer failure (dial, close, missing primary).
    #[error("session error: {0}")]
    Session(String),
}

impl CoreError {
    /// Wire error code a gateway/client should attach when reporting this
    /// failure on a stream, if any.
    #[must_use]
    pub fn wire_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Protocol(_) | Self::Crypto(_) => Some(ErrorCode::BadRecord),
            Self::Peer { code, .. } => Some(*code),
            Self::Io(_) | Self::UnexpectedRecord { .. } => None,
            Self::InvalidTransition { .. } | Self::NotActive { .. } | Self::Session(_) => None,
        }
    }

    /// Stable code string surfaced on the event bus.
    #[must_use]
    pub fn code_str(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "bad_record",
            Self::Crypto(_) => "crypto",
            Self::Io(_) => "io",
            Self::Peer { code, .. } => code.as_str(),
            Self::UnexpectedRecord { .. } => "unexpected_record",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotActive { .. } => "not_active",
            Self::Session(_) => "session",
        }
    }
}
