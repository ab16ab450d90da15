//! Cryptographic failure taxonomy.
//!
//! Callers map these onto wire behavior: a failure during a gateway
//! handshake becomes a silent drop, the same failure mid-stream becomes a
//! `BadRecord` close. The error itself never carries key material.

use thiserror::Error;

/// Errors from the record cryptosystem.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// The per-session counter reached its 2^32 ceiling; the session must
    /// be rekeyed (rotated) before any further record is sealed.
    #[error("nonce counter exhausted; session requires rekey")]
    CounterExhausted,

    /// AEAD open failed: tag mismatch, wrong key, or tampered header.
    #[error("authenticated decryption failed")]
    OpenFailed,

    /// Record timestamp falls outside the replay window.
    #[error("timestamp outside replay window: skew {skew_ns}ns, window {window_ns}ns")]
    TimestampOutsideWindow {
        /// Absolute sender/receiver clock difference observed.
        skew_ns: u64,
        /// Configured window in nanoseconds.
        window_ns: u64,
    },

    /// Record counter did not advance past the last accepted value.
    #[error("replayed or reordered counter: got {counter}, last accepted {last_seen}")]
    CounterNotMonotonic {
        /// Counter carried by the rejected record.
        counter: u64,
        /// Highest counter accepted so far on this stream.
        last_seen: u64,
    },
}
